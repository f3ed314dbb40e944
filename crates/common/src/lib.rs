//! Types shared by every corral crate.

pub mod types;

pub use types::{Artifact, CoalesceKey, HistoryTurn, ThreadKey};
