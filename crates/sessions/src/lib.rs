//! Durable mapping from chat threads to agent sessions.
//!
//! The whole map lives in one JSON document (`~/.corral/sessions.json` by
//! default), rewritten atomically under an advisory file lock.

pub mod file;
pub mod store;

pub use {
    file::{Session, SessionDocument, SessionFile},
    store::SessionStore,
};
