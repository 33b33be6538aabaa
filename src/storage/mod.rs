#![forbid(unsafe_code)]

//! Persistent index structures.

/// Generation-safe, crash-recoverable B+Tree.
pub mod gbptree;
