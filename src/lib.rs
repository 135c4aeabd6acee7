//! Find capture files, mutate a fresh copy of each for every replay, and
//! feed the copies to analysis engines under a bounded, cancellable
//! two-level scheduler.

pub mod capture;
pub mod catalog;
pub mod cli;
pub mod control;
pub mod models;
pub mod scheduler;
pub mod utils;
