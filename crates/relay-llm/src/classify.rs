//! Failure classification.
//!
//! Every provider failure is mapped to exactly one [`FailureClass`] here and
//! nowhere else. Structured HTTP status and provider error codes win; message
//! patterns are consulted only when neither says anything decisive.

use once_cell::sync::Lazy;
use regex::Regex;

use relay_core::{FailureClass, RelayError};

/// User-facing text for billing failures.
pub const BILLING_USER_MESSAGE: &str = "⚠️ API provider returned a billing error. Your API key has run out of credits or has an insufficient balance. Check your provider's billing dashboard and top up or switch to a different API key.";

/// User-facing text for context overflow that history trimming could not fix.
pub const CONTEXT_OVERFLOW_USER_MESSAGE: &str = "⚠️ Context overflow: prompt too large for this model. Try a shorter message or a larger-context model.";

// ── Structured signals ─────────────────────────────────────────

fn class_for_code(code: &str) -> Option<FailureClass> {
    let code = code.to_ascii_lowercase();
    let class = match code.as_str() {
        "rate_limit_exceeded" | "rate_limit_error" | "too_many_requests" | "overloaded_error"
        | "resource_exhausted" => FailureClass::RateLimit,
        "insufficient_quota" | "billing_hard_limit_reached" | "payment_required"
        | "credit_balance_too_low" => FailureClass::Billing,
        "invalid_grant" | "invalid_api_key" | "account_deactivated" | "permission_denied" => {
            FailureClass::Auth { recoverable: false }
        }
        "authentication_error" | "token_expired" | "expired_token" | "unauthorized" => {
            FailureClass::Auth { recoverable: true }
        }
        "context_length_exceeded" | "string_above_max_length" | "request_too_large" => {
            FailureClass::ContextOverflow
        }
        "timeout" | "request_timeout" | "deadline_exceeded" => FailureClass::Timeout,
        _ => return None,
    };
    Some(class)
}

fn class_for_status(status: u16, message: &str) -> Option<FailureClass> {
    let class = match status {
        429 | 529 => FailureClass::RateLimit,
        402 => FailureClass::Billing,
        401 | 403 => {
            // A 401 can be an expired token (refreshable) or a dead grant.
            if is_permanent_auth(message) {
                FailureClass::Auth { recoverable: false }
            } else {
                FailureClass::Auth { recoverable: true }
            }
        }
        408 | 502 | 503 | 504 => FailureClass::Timeout,
        413 => FailureClass::ContextOverflow,
        // 400 and 500 say nothing by themselves; the body decides.
        _ => return None,
    };
    Some(class)
}

fn is_permanent_auth(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["invalid_grant", "revoked", "account has been disabled", "deactivated"]
        .iter()
        .any(|m| lower.contains(m))
}

// ── Message patterns ───────────────────────────────────────────

struct FailurePattern {
    check: fn(&str) -> bool,
    class: FailureClass,
}

static TOOL_CHAIN_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)(no tool call found for function call output|function call turn comes immediately after|tool_use ids? (?:were|was) found without .*tool_result|duplicate (?:item|call) (?:found )?with id|unexpected `?tool_use_id`?)",
    )
    .ok()
});

static CONTEXT_OVERFLOW_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)(context[ _-]?(?:length|window)|maximum context|prompt is too long|too many tokens|input is too long|exceeds? the (?:model'?s? )?(?:context|token limit))",
    )
    .ok()
});

fn regex_match(re: &Lazy<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// All known message patterns, checked in order. Lowercased input.
fn patterns() -> &'static [FailurePattern] {
    static PATTERNS: &[FailurePattern] = &[
        // Tool chain first: these arrive as generic 400s.
        FailurePattern {
            check: |s| regex_match(&TOOL_CHAIN_RE, s),
            class: FailureClass::ToolChainCorruption,
        },
        FailurePattern {
            check: |s| s.contains("tool-call chain corrupted"),
            class: FailureClass::ToolChainCorruption,
        },
        // Billing before rate limit: "quota" messages mention both.
        FailurePattern {
            check: |s| {
                s.contains("insufficient_quota")
                    || s.contains("credit balance")
                    || s.contains("billing")
                    || s.contains("payment required")
                    || s.contains("exceeded your current quota")
            },
            class: FailureClass::Billing,
        },
        FailurePattern {
            check: |s| {
                s.contains("rate limit")
                    || s.contains("rate_limit")
                    || s.contains("too many requests")
                    || s.contains("http 429")
                    || s.contains("overloaded")
                    || s.contains("resource exhausted")
            },
            class: FailureClass::RateLimit,
        },
        FailurePattern {
            check: is_permanent_auth,
            class: FailureClass::Auth { recoverable: false },
        },
        FailurePattern {
            check: |s| {
                s.contains("unauthorized")
                    || s.contains("authentication")
                    || s.contains("http 401")
                    || (s.contains("token") && s.contains("expired"))
            },
            class: FailureClass::Auth { recoverable: true },
        },
        FailurePattern {
            check: |s| regex_match(&CONTEXT_OVERFLOW_RE, s),
            class: FailureClass::ContextOverflow,
        },
        FailurePattern {
            check: |s| {
                s.contains("timed out")
                    || s.contains("timeout")
                    || s.contains("deadline exceeded")
                    || s.contains("connection reset")
                    || s.contains("connection closed")
                    || s.contains("econnreset")
                    || s.contains("etimedout")
                    || s.contains("http 502")
                    || s.contains("http 503")
                    || s.contains("http 504")
            },
            class: FailureClass::Timeout,
        },
    ];
    PATTERNS
}

/// Classify free-form error text.
pub fn classify_message(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    patterns()
        .iter()
        .find(|p| (p.check)(&lower))
        .map(|p| p.class)
        .unwrap_or(FailureClass::Unknown)
}

/// Classify an error returned from a provider call.
pub fn classify(err: &RelayError) -> FailureClass {
    match err {
        RelayError::Provider {
            status,
            code,
            message,
            ..
        } => {
            if let Some(class) = code.as_deref().and_then(class_for_code) {
                return class;
            }
            // Tool-chain rejections come back as plain 400s; check the body first.
            let by_message = classify_message(message);
            if by_message == FailureClass::ToolChainCorruption {
                return by_message;
            }
            status
                .and_then(|s| class_for_status(s, message))
                .unwrap_or(by_message)
        }
        RelayError::RateLimited { .. } => FailureClass::RateLimit,
        RelayError::ContextOverflow { .. } => FailureClass::ContextOverflow,
        RelayError::Timeout(_) => FailureClass::Timeout,
        RelayError::ToolChainCorrupted(_) => FailureClass::ToolChainCorruption,
        RelayError::Classified { class, .. } => *class,
        RelayError::Other(e) => classify_message(&e.to_string()),
        _ => FailureClass::Unknown,
    }
}

/// Text shown to the end user when a run stops on this class.
pub fn user_message(class: FailureClass, detail: &str) -> String {
    match class {
        FailureClass::Billing => BILLING_USER_MESSAGE.to_string(),
        FailureClass::ContextOverflow => CONTEXT_OVERFLOW_USER_MESSAGE.to_string(),
        FailureClass::Auth { recoverable: false } => format!(
            "⚠️ Authentication failed and cannot be refreshed. Re-authenticate this provider. ({detail})"
        ),
        FailureClass::Timeout => "⚠️ The model did not respond in time. Please try again.".to_string(),
        FailureClass::RateLimit | FailureClass::Auth { recoverable: true } => format!(
            "⚠️ All configured models are rate limited or unavailable right now. ({detail})"
        ),
        FailureClass::ToolChainCorruption | FailureClass::Unknown => {
            format!("⚠️ Agent failed: {detail}")
        }
    }
}
