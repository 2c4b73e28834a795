//! # relay-llm
//!
//! Provider-facing layer of the run core: the provider trait, model-reference
//! resolution, per-provider admission control, tool-chain validation, and the
//! failure classification table.

pub mod admission;
pub mod classify;
pub mod mock;
pub mod provider;
pub mod router;
pub mod tool_chain;

pub use admission::{AdmissionGate, AdmissionPermit, DEFAULT_SAFETY_TIMEOUT};
pub use classify::{classify, classify_message};
pub use mock::MockProvider;
pub use provider::{LlmProvider, LlmRequest, LlmResponse, ProviderAuth, StopReason, Usage};
pub use router::ProviderRegistry;
pub use tool_chain::{CarriedCalls, ToolChainPayload, ToolChainViolation, ViolationKind, drop_tail_turn, sanitize};
