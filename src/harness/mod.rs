//! Runtime harness to execute the pipeline roles as modules

mod heart;
mod module;

pub use heart::*;
pub use module::*;
