//! Courier SDK
//!
//! Shared types for the Courier gateway: the error enum used across the
//! engine, and the skill invocation/result contract shared with externally
//! spawned skill scripts.

pub mod errors;
pub mod types;

pub use errors::{CourierErrorExt, GatewayError};
pub use types::{SkillInvocation, SkillResult};
