//! Runnable modules implementing the roles of the speed pipeline
//!
//! Every role is a [`Module`](crate::harness::Module) attaching its own
//! [`Endpoint`](crate::library::communication::Endpoint) to a shared bus. The
//! [`pipeline`] wires them together in a single process.

use std::sync::{Arc, Mutex};

pub mod options;

pub mod listener;
pub mod monitor;
pub mod pipeline;
pub mod producer;
pub mod relay;

/// Append-only record shared between a running module and its observers
#[derive(Debug)]
pub struct Journal<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Journal<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for Journal<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Journal<T> {
    /// Appends an entry
    pub fn record(&self, entry: T) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
    }

    /// Copy of all entries in the order they were recorded
    pub fn entries(&self) -> Vec<T> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
