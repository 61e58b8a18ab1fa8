//! sqlite-session - transaction-aware SQLite sessions.
//!
//! Sessions over one native connection, lazily materialized row cursors, and a
//! schema reflector serving catalog queries from cached shadow tables.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod meta;
