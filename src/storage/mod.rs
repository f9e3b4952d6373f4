//! Storage layer for vault records.
//!
//! Uses ReDB for embedded key-value storage with ACID transactions.

pub mod redb;

pub use self::redb::Storage;
