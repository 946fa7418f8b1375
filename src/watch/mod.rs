//! The four long-running poll loops.
//!
//! Each watcher is an owned struct with an async `run` loop: do work, sleep
//! a fixed interval, repeat. Failures inside one iteration are absorbed and
//! logged; nothing here terminates a loop. The only shared mutable state is
//! the ledger.

pub mod bump;
pub mod chat;
pub mod digest;
pub mod orders;
