//! Infrastructure layer for taskflow.
//!
//! Implements the storage adapter trait defined in `taskflow-core` on the
//! filesystem and on SQLite, loads `config.toml`, and talks to component
//! actors over HTTP.

pub mod config;
pub mod http;
pub mod sqlite;
pub mod storage;
