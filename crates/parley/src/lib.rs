//! Parley backend library.
//!
//! Live mutation broadcast for a multi-tenant chat backend: committed changes
//! become payload-free markers on channels, the hub fans them out to
//! authorized subscribers, and clients re-read what changed through
//! reconciliation.

pub mod api;
pub mod auth;
pub mod authority;
pub mod chat;
pub mod config;
pub mod db;
pub mod hub;
pub mod notify;
pub mod reconcile;
pub mod stream;
pub mod sync;
