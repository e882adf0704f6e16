//! rcm-core — shared types, wire format, and configuration for the RC
//! connection manager. All other rcm crates depend on this one.

pub mod config;
pub mod path;
pub mod wire;

pub use path::{Gid, PathRecord};
pub use wire::{AprStatus, AttrId, CmMessage, Mad, RejectReason, WireError};
