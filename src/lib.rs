//! Background synchronization engine for a storefront seller account.
//!
//! Four independent poll loops (chats, orders, bump scheduler, broadcast
//! digest) watch an authenticated web session for state changes and fan
//! notifications out to opted-in recipients. A single persisted ledger is
//! the idempotency authority: per-chat cursors, per-order flags and
//! per-digest dedup keys decide what counts as "new" on every poll.

pub mod broadcast;
pub mod client;
pub mod config;
pub mod inventory;
pub mod ledger;
pub mod notify;
pub mod types;
pub mod watch;

#[cfg(test)]
pub(crate) mod testutil;
