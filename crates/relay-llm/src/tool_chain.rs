//! Tool-call chain validation for responses-style payloads.
//!
//! Calls and outputs are separate items linked by `call_id`. Providers reject a
//! payload whose links are broken, and a rejected payload stays broken on every
//! retry unless the bad tail is cut off first. [`sanitize`] finds the first
//! broken link, drops the tool turn containing it together with everything
//! after it, and clears the continuity token so the provider does not splice
//! the cut history back in.

use std::collections::{HashMap, HashSet};
use tracing::warn;

use relay_core::{InputItem, RelayError};

/// Call ids carried over from earlier requests of the same session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarriedCalls {
    /// Issued in a previous response, not answered yet.
    pub open: HashSet<String>,
    /// Issued and answered in earlier requests.
    pub closed: HashSet<String>,
}

/// The tool-chain view of one outgoing request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolChainPayload {
    pub items: Vec<InputItem>,
    pub previous_response_id: Option<String>,
    pub carried: CarriedCalls,
}

impl ToolChainPayload {
    pub fn new(items: Vec<InputItem>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    pub fn with_previous_response_id(mut self, id: impl Into<String>) -> Self {
        self.previous_response_id = Some(id.into());
        self
    }

    pub fn with_carried(mut self, carried: CarriedCalls) -> Self {
        self.carried = carried;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// An output whose call id was never issued.
    UnmatchedOutput,
    /// A second output for a call that was already answered.
    AlreadyConsumed,
    /// A call id issued twice.
    DuplicateCallId,
}

impl ViolationKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::UnmatchedOutput => "output without a matching call",
            Self::AlreadyConsumed => "output for an already answered call",
            Self::DuplicateCallId => "call id reused",
        }
    }
}

/// The first broken link found in a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolChainViolation {
    pub kind: ViolationKind,
    pub call_id: String,
    /// Index of the offending item in the original payload.
    pub index: usize,
    /// Index the payload was truncated at.
    pub truncated_at: usize,
    /// Number of items removed.
    pub dropped: usize,
}

impl std::fmt::Display for ToolChainViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (call_id {} at item {}; dropped {} item(s))",
            self.kind.as_str(),
            self.call_id,
            self.index,
            self.dropped
        )
    }
}

impl From<ToolChainViolation> for RelayError {
    fn from(v: ToolChainViolation) -> Self {
        RelayError::ToolChainCorrupted(v.to_string())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CallState {
    Open,
    Answered,
}

/// Validate the payload in place.
///
/// A valid payload is left untouched. On the first violation the payload is
/// truncated at the start of the tool turn containing it, the continuity token
/// is cleared, and the violation is returned.
pub fn sanitize(payload: &mut ToolChainPayload) -> Result<(), ToolChainViolation> {
    let Some((kind, call_id, index)) = find_violation(&payload.items, &payload.carried) else {
        return Ok(());
    };

    let truncated_at = turn_start(&payload.items, index);
    let dropped = payload.items.len() - truncated_at;
    payload.items.truncate(truncated_at);
    payload.previous_response_id = None;

    let violation = ToolChainViolation {
        kind,
        call_id,
        index,
        truncated_at,
        dropped,
    };
    warn!(
        call_id = %violation.call_id,
        index,
        dropped,
        kind = violation.kind.as_str(),
        "dropped malformed tool-call turn"
    );
    Err(violation)
}

/// Validate without modifying anything.
pub fn check(payload: &ToolChainPayload) -> Result<(), ToolChainViolation> {
    let mut copy = payload.clone();
    sanitize(&mut copy)
}

/// Drop the trailing tool turn and the continuity token.
///
/// Used when the provider rejected a chain that looked valid locally, so the
/// exact bad link is unknown. Returns the number of items removed.
pub fn drop_tail_turn(payload: &mut ToolChainPayload) -> usize {
    payload.previous_response_id = None;
    let Some(last) = payload.items.len().checked_sub(1) else {
        return 0;
    };
    if !payload.items[last].is_tool_item() {
        return 0;
    }
    let start = turn_start(&payload.items, last);
    let dropped = payload.items.len() - start;
    payload.items.truncate(start);
    warn!(dropped, "provider rejected tool-call chain; dropped trailing tool turn");
    dropped
}

fn find_violation(
    items: &[InputItem],
    carried: &CarriedCalls,
) -> Option<(ViolationKind, String, usize)> {
    let mut issued: HashMap<&str, CallState> = HashMap::new();
    let mut carried_open: HashSet<&str> = carried.open.iter().map(String::as_str).collect();

    for (index, item) in items.iter().enumerate() {
        match item {
            InputItem::FunctionCall { call_id, .. } => {
                let reused = issued.contains_key(call_id.as_str())
                    || carried.open.contains(call_id)
                    || carried.closed.contains(call_id);
                if reused {
                    return Some((ViolationKind::DuplicateCallId, call_id.clone(), index));
                }
                issued.insert(call_id.as_str(), CallState::Open);
            }
            InputItem::FunctionCallOutput { call_id, .. } => {
                match issued.get(call_id.as_str()).copied() {
                    Some(CallState::Open) => {
                        issued.insert(call_id.as_str(), CallState::Answered);
                    }
                    Some(CallState::Answered) => {
                        return Some((ViolationKind::AlreadyConsumed, call_id.clone(), index));
                    }
                    None if carried_open.remove(call_id.as_str()) => {}
                    None if carried.closed.contains(call_id) => {
                        return Some((ViolationKind::AlreadyConsumed, call_id.clone(), index));
                    }
                    None => {
                        return Some((ViolationKind::UnmatchedOutput, call_id.clone(), index));
                    }
                }
            }
            InputItem::Message { .. } => {}
        }
    }
    None
}

/// Start of the contiguous run of tool items containing `index`.
fn turn_start(items: &[InputItem], index: usize) -> usize {
    let mut start = index;
    while start > 0 && items[start - 1].is_tool_item() {
        start -= 1;
    }
    start
}
