#[cfg(test)]
mod tests {
    use relay_core::{FailureClass, RelayError};
    use relay_llm::classify::{self, BILLING_USER_MESSAGE, classify, classify_message};

    fn provider_err(status: Option<u16>, code: Option<&str>, message: &str) -> RelayError {
        RelayError::Provider {
            provider: "openai".into(),
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    // ── Structured signals ─────────────────────────────────────

    #[test]
    fn test_status_codes() {
        assert_eq!(classify(&provider_err(Some(429), None, "")), FailureClass::RateLimit);
        assert_eq!(classify(&provider_err(Some(402), None, "")), FailureClass::Billing);
        assert_eq!(classify(&provider_err(Some(504), None, "")), FailureClass::Timeout);
        assert_eq!(
            classify(&provider_err(Some(413), None, "")),
            FailureClass::ContextOverflow
        );
        assert_eq!(
            classify(&provider_err(Some(401), None, "token expired")),
            FailureClass::Auth { recoverable: true }
        );
        assert_eq!(
            classify(&provider_err(Some(401), None, "invalid_grant: refresh token revoked")),
            FailureClass::Auth { recoverable: false }
        );
    }

    #[test]
    fn test_code_wins_over_status_and_message() {
        let err = provider_err(Some(429), Some("insufficient_quota"), "rate limit reached");
        assert_eq!(classify(&err), FailureClass::Billing);

        let err = provider_err(Some(400), Some("context_length_exceeded"), "bad request");
        assert_eq!(classify(&err), FailureClass::ContextOverflow);
    }

    #[test]
    fn test_bare_400_falls_back_to_message() {
        let err = provider_err(
            Some(400),
            None,
            "No tool call found for function call output with call_id call_123.",
        );
        assert_eq!(classify(&err), FailureClass::ToolChainCorruption);

        let err = provider_err(Some(400), None, "something odd");
        assert_eq!(classify(&err), FailureClass::Unknown);
    }

    // ── Message patterns ───────────────────────────────────────

    #[test]
    fn test_message_patterns() {
        assert_eq!(classify_message("HTTP 429: Too Many Requests"), FailureClass::RateLimit);
        assert_eq!(classify_message("Overloaded"), FailureClass::RateLimit);
        assert_eq!(
            classify_message("Your credit balance is too low to access the API"),
            FailureClass::Billing
        );
        assert_eq!(
            classify_message("prompt is too long: 210000 tokens > 200000 maximum"),
            FailureClass::ContextOverflow
        );
        assert_eq!(classify_message("request timed out"), FailureClass::Timeout);
        assert_eq!(
            classify_message(
                "Please ensure that function call turn comes immediately after a user turn"
            ),
            FailureClass::ToolChainCorruption
        );
        assert_eq!(classify_message("kaboom"), FailureClass::Unknown);
    }

    #[test]
    fn test_internal_errors() {
        assert_eq!(
            classify(&RelayError::ToolChainCorrupted("x".into())),
            FailureClass::ToolChainCorruption
        );
        assert_eq!(classify(&RelayError::Timeout("attempt".into())), FailureClass::Timeout);
        assert_eq!(
            classify(&RelayError::RateLimited { retry_after_secs: 3 }),
            FailureClass::RateLimit
        );
        assert_eq!(classify(&RelayError::Cancelled), FailureClass::Unknown);
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            classify::user_message(FailureClass::Billing, "ignored"),
            BILLING_USER_MESSAGE
        );
        assert!(
            classify::user_message(FailureClass::ContextOverflow, "")
                .contains("Context overflow")
        );
        assert!(classify::user_message(FailureClass::Unknown, "boom").contains("boom"));
    }
}
