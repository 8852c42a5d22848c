//! This library crate contains all the necessities to run a speed monitoring pipeline.
//!
//! Submodules have been introduced to split responsibilities. Each module has a specific focus
//! and they together form a chain of dependencies from the low-level messaging [`library`], over
//! the vehicle [`domain`] specific logic, through the executable [`harness`], up to the
//! high-level [`modules`](module) implementing the individual roles.

#![deny(missing_docs)]

pub mod domain;
pub mod harness;
pub mod library;
pub mod module;
