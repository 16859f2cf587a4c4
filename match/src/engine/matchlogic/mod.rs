//! Match Logic Module
//!
//! The two matching policies over a ledger transaction: immediate matching of
//! a newly submitted order and the batch pass over a locked book.

pub mod matcher;

pub use matcher::Matcher;
