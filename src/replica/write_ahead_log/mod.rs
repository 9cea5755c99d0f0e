//! This module is a raft-specific log that wraps the generic commit log. It owns the entry
//! encoding and the commit/apply bookkeeping on top of the storage contract.

mod log;
mod log_entry;

pub(crate) use log::RaftLog;
pub(crate) use log_entry::EntryPayload;
pub use log_entry::RaftLogEntry;
