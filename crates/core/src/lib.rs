//! Shared domain types for the seller-relay workspace.
//!
//! Everything here is transport-agnostic: account identifiers, the
//! per-account connection state and status snapshot, the normalized
//! inbound event envelope, and the domain error type.

pub mod error;
pub mod event;
pub mod status;
pub mod types;
