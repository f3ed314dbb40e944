//! Shaping inbound chat traffic before it reaches the agent: coalescing
//! bursts of fragments and serializing turns per thread.

pub mod debounce;
pub mod inflight;

pub use {
    debounce::{Coalesced, DebounceError, Debouncer},
    inflight::{FollowUp, InFlight},
};
