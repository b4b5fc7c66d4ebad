//! Testing utilities for crabframe
//!
//! Provides a deterministic in-process device backend that replays a script
//! of frames, errors and blocking points, and records every call made to it.

pub mod scripted;

pub use scripted::{synthetic_payload, Exhaustion, ScriptCounters, ScriptedBackend, ScriptedHandle, Step};
