//! # relay-core
//!
//! Core types and primitives for the Relay run orchestration core.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! the error type and failure taxonomy, run/model identifiers, the conversation items
//! sent upstream, and the run lifecycle event bus.

pub mod error;
pub mod event;
pub mod message;
pub mod tool;
pub mod types;

pub use error::{FailureClass, RelayError, Result};
pub use event::{EventBus, RunEvent};
pub use message::{InputItem, Role};
pub use tool::ToolSpec;
pub use types::*;
