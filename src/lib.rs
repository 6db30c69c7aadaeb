//! Ticket availability watcher.
//!
//! Polls a resale event page on a randomized schedule, pulls out the
//! offers currently for sale, and alerts a set of Telegram chats when the
//! offer set is new or changed (or unchanged for longer than the resend
//! interval). The binary in `main.rs` wires the real collaborators; every
//! module here works against traits so the poll loop can be exercised
//! with in-memory fakes.

pub mod backoff;
pub mod blocking;
pub mod config;
pub mod dedup;
pub mod diagnostics;
pub mod extract;
pub mod fetch;
pub mod notify;
pub mod poller;
pub mod session;
pub mod stats;
