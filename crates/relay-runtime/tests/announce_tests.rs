#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use relay_core::{EventBus, RelayError, RunEvent, RunStatus};
    use relay_runtime::announce::announce_idempotency_key;
    use relay_runtime::gateway::{ChatMessage, GatewayCall, WaitResult};
    use relay_runtime::subagent::{DeliveryContext, SubagentCleanup, SubagentSettings};
    use relay_runtime::{
        ANNOUNCE_SKIP, AnnounceFlow, AnnounceOutcome, MemorySessionStore, RecordingGateway,
        SessionStore, SubagentRegistry, SubagentRunRecord,
    };
    use std::sync::Arc;
    use std::time::Duration;

    const PARENT: &str = "agent:main:telegram:42";
    const CHILD: &str = "agent:main:subagent:abc";
    const RUN: &str = "run-7";

    struct Harness {
        gateway: Arc<RecordingGateway>,
        registry: Arc<SubagentRegistry>,
        sessions: Arc<MemorySessionStore>,
        events: EventBus,
        flow: Arc<AnnounceFlow>,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(RecordingGateway::new());
        let registry = Arc::new(SubagentRegistry::new(SubagentSettings {
            wait_timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(50),
            ..Default::default()
        }));
        let sessions = Arc::new(MemorySessionStore::new());
        let events = EventBus::default();
        let flow = Arc::new(
            AnnounceFlow::new(gateway.clone(), registry.clone())
                .with_sessions(sessions.clone())
                .with_events(events.clone()),
        );
        Harness {
            gateway,
            registry,
            sessions,
            events,
            flow,
        }
    }

    fn child(expects_completion_message: bool) -> SubagentRunRecord {
        let mut record = SubagentRunRecord::new(RUN, CHILD, PARENT, "summarise the logs");
        record.last_status = RunStatus::Running;
        record.started_at = Some(Utc::now() - ChronoDuration::seconds(95));
        record.expects_completion_message = expects_completion_message;
        record.requester_origin = Some(DeliveryContext {
            channel: "telegram".into(),
            to: "42".into(),
            thread_id: Some("7".into()),
            ..Default::default()
        });
        record
    }

    fn transcript(h: &Harness, reply: &str) {
        h.gateway.set_history(
            CHILD,
            vec![
                ChatMessage::new("user", "summarise the logs"),
                ChatMessage::new("assistant", reply),
                ChatMessage::new("assistant", "  "),
            ],
        );
    }

    // ── Delivery paths ─────────────────────────────────────────

    #[tokio::test]
    async fn test_completion_message_is_sent_directly_then_parent_informed() {
        let h = harness();
        let record = child(true);
        let key = announce_idempotency_key(&record);
        h.registry.register(record);
        transcript(&h, "Found 3 errors in auth.log.");

        let outcome = h.flow.announce(RUN).await.unwrap();
        assert_eq!(outcome, AnnounceOutcome::Delivered { direct: true });

        let sends = h.gateway.send_calls();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].channel, "telegram");
        assert_eq!(sends[0].to, "42");
        assert_eq!(sends[0].thread_id.as_deref(), Some("7"));
        assert_eq!(sends[0].idempotency_key, key);
        assert!(sends[0].message.starts_with("✅ Subagent \"summarise the logs\" finished."));
        assert!(sends[0].message.contains("Found 3 errors in auth.log."));

        let agents = h.gateway.agent_calls();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].session_key, PARENT);
        assert!(!agents[0].deliver);
        assert!(!agents[0].expect_final);
        assert_eq!(agents[0].idempotency_key, format!("{key}-agent"));
        assert!(agents[0].message.contains("already delivered"));
    }

    #[tokio::test]
    async fn test_without_completion_message_parent_delivers_final_turn() {
        let h = harness();
        let record = child(false);
        let key = announce_idempotency_key(&record);
        h.registry.register(record);
        transcript(&h, "All green.");

        let outcome = h.flow.announce(RUN).await.unwrap();
        assert_eq!(outcome, AnnounceOutcome::Delivered { direct: false });
        assert!(h.gateway.send_calls().is_empty());

        let agents = h.gateway.agent_calls();
        assert_eq!(agents.len(), 1);
        let call = &agents[0];
        assert_eq!(call.session_key, PARENT);
        assert!(call.deliver);
        assert!(call.expect_final);
        assert_eq!(call.idempotency_key, key);
        assert_eq!(call.channel.as_deref(), Some("telegram"));
        assert_eq!(call.to.as_deref(), Some("42"));
        assert!(call.message.contains("All green."));
    }

    #[tokio::test]
    async fn test_completion_message_without_origin_falls_back_to_agent_turn() {
        let h = harness();
        let mut record = child(true);
        record.requester_origin = None;
        h.registry.register(record);

        let outcome = h.flow.announce(RUN).await.unwrap();
        assert_eq!(outcome, AnnounceOutcome::Delivered { direct: false });
        assert!(h.gateway.send_calls().is_empty());
        let agents = h.gateway.agent_calls();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].channel.is_none());
        assert!(agents[0].message.contains("(no output)"));
    }

    // ── Exactly once ───────────────────────────────────────────

    #[tokio::test]
    async fn test_second_announce_is_a_no_op() {
        let h = harness();
        h.registry.register(child(true));

        assert!(matches!(
            h.flow.announce(RUN).await.unwrap(),
            AnnounceOutcome::Delivered { .. }
        ));
        let calls_after_first = h.gateway.calls().len();

        assert_eq!(
            h.flow.announce(RUN).await.unwrap(),
            AnnounceOutcome::AlreadyAnnounced
        );
        assert_eq!(h.gateway.calls().len(), calls_after_first);
        assert!(h.registry.get(RUN).is_none());
        assert!(h.registry.was_announced(RUN));
    }

    #[tokio::test]
    async fn test_concurrent_announces_deliver_once() {
        let h = harness();
        h.registry.register(child(true));

        let (a, b) = tokio::join!(h.flow.announce(RUN), h.flow.announce(RUN));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, AnnounceOutcome::AlreadyAnnounced));
        assert_eq!(
            outcomes,
            vec![
                AnnounceOutcome::Delivered { direct: true },
                AnnounceOutcome::AlreadyAnnounced
            ]
        );
        assert_eq!(h.gateway.send_calls().len(), 1);
        assert_eq!(h.gateway.agent_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_releases_claim_for_retry() {
        let h = harness();
        h.registry.register(child(true));
        h.gateway.fail_method("send", "channel offline");

        let err = h.flow.announce(RUN).await.unwrap_err();
        assert!(matches!(err, RelayError::Gateway { ref method, .. } if method == "send"));
        let record = h.registry.get(RUN).unwrap();
        assert!(!record.announce_claimed);
        assert!(record.announced_at.is_none());
        assert!(h.gateway.agent_calls().is_empty());

        h.gateway.clear_failures();
        let outcome = h.flow.announce(RUN).await.unwrap();
        assert_eq!(outcome, AnnounceOutcome::Delivered { direct: true });

        let sends = h.gateway.send_calls();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].idempotency_key, sends[1].idempotency_key);
    }

    #[tokio::test]
    async fn test_unknown_run_is_an_error() {
        let h = harness();
        let err = h.flow.announce("run-unknown").await.unwrap_err();
        assert!(matches!(err, RelayError::SubagentNotFound(_)));
    }

    // ── Reply handling ─────────────────────────────────────────

    #[tokio::test]
    async fn test_announce_skip_suppresses_delivery() {
        let h = harness();
        let mut record = child(true);
        record.cleanup = SubagentCleanup::Delete;
        h.registry.register(record);
        transcript(&h, ANNOUNCE_SKIP);

        let outcome = h.flow.announce(RUN).await.unwrap();
        assert_eq!(outcome, AnnounceOutcome::Skipped);
        assert!(h.gateway.send_calls().is_empty());
        assert!(h.gateway.agent_calls().is_empty());
        assert!(h.registry.was_announced(RUN));
        assert!(h.registry.get(RUN).is_none());
        assert!(h.gateway.calls().iter().any(|c| matches!(
            c,
            GatewayCall::Delete { session_key, delete_transcript: true } if session_key == CHILD
        )));
    }

    #[tokio::test]
    async fn test_still_running_child_is_deferred() {
        let h = harness();
        h.registry.register(child(true));
        h.gateway.script_wait(RUN, [WaitResult::still_running()]);

        let outcome = h.flow.announce(RUN).await.unwrap();
        assert_eq!(outcome, AnnounceOutcome::Pending);
        let record = h.registry.get(RUN).unwrap();
        assert!(!record.announce_claimed);
        assert!(h.gateway.send_calls().is_empty());

        // The child reports in-process; its reply is used without reading history.
        h.registry
            .mark_ended(RUN, RunStatus::Ok, Some("Finished late.".into()), None);
        let outcome = h.flow.announce(RUN).await.unwrap();
        assert_eq!(outcome, AnnounceOutcome::Delivered { direct: true });
        assert!(h.gateway.send_calls()[0].message.contains("Finished late."));
        assert!(
            !h.gateway
                .calls()
                .iter()
                .any(|c| matches!(c, GatewayCall::History { .. }))
        );
    }

    #[tokio::test]
    async fn test_failed_child_headline_carries_error() {
        let h = harness();
        h.registry.register(child(false));
        h.gateway.script_wait(
            RUN,
            [WaitResult {
                error: Some("tool crashed".into()),
                ..WaitResult::status(RunStatus::Error)
            }],
        );

        h.flow.announce(RUN).await.unwrap();
        let message = &h.gateway.agent_calls()[0].message;
        assert!(message.starts_with("❌ Subagent \"summarise the logs\" failed: tool crashed"));
    }

    #[tokio::test]
    async fn test_timed_out_child_headline() {
        let h = harness();
        let mut record = child(false);
        record.label = Some("log digest".into());
        h.registry.register(record);
        h.gateway
            .script_wait(RUN, [WaitResult::status(RunStatus::Timeout)]);

        h.flow.announce(RUN).await.unwrap();
        let message = &h.gateway.agent_calls()[0].message;
        assert!(message.starts_with("⏱️ Subagent \"log digest\" timed out."));
    }

    #[tokio::test]
    async fn test_stats_line_includes_runtime_tokens_and_session() {
        let h = harness();
        h.registry.register(child(true));
        h.sessions
            .update(
                CHILD,
                Box::new(|e| {
                    e.input_tokens = Some(1_200);
                    e.output_tokens = Some(300);
                }),
            )
            .await
            .unwrap();

        h.flow.announce(RUN).await.unwrap();
        let message = &h.gateway.send_calls()[0].message;
        assert!(message.contains("Stats: runtime 1m"));
        assert!(message.contains("tokens 1.5k (in 1.2k / out 300)"));
        assert!(message.contains(&format!("session {CHILD}")));
    }

    // ── Cleanup ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_label_patch_and_delete_cleanup() {
        let h = harness();
        let mut record = child(true);
        record.label = Some("log digest".into());
        record.cleanup = SubagentCleanup::Delete;
        h.registry.register(record);

        h.flow.announce(RUN).await.unwrap();
        let calls = h.gateway.calls();
        assert!(calls.iter().any(|c| matches!(
            c,
            GatewayCall::Patch { session_key, label: Some(label) }
                if session_key == CHILD && label == "log digest"
        )));
        assert!(calls.iter().any(|c| matches!(c, GatewayCall::Delete { .. })));
    }

    #[tokio::test]
    async fn test_keep_cleanup_leaves_child_session() {
        let h = harness();
        h.registry.register(child(true));
        h.gateway.fail_method("sessions.patch", "ignored");

        h.flow.announce(RUN).await.unwrap();
        assert!(
            !h.gateway
                .calls()
                .iter()
                .any(|c| matches!(c, GatewayCall::Delete { .. }))
        );
        assert!(h.registry.get(RUN).is_none());
    }

    // ── Background watch ───────────────────────────────────────

    #[tokio::test]
    async fn test_watch_announces_in_background_and_publishes() {
        let h = harness();
        let mut rx = h.events.subscribe();
        h.registry.register(child(true));
        h.gateway.script_wait(
            RUN,
            [WaitResult::still_running(), WaitResult::status(RunStatus::Ok)],
        );

        let outcome = h.flow.watch(RUN).await.unwrap().unwrap();
        assert_eq!(outcome, AnnounceOutcome::Delivered { direct: true });
        assert!(matches!(
            rx.try_recv().unwrap(),
            RunEvent::SubagentAnnounced { status: RunStatus::Ok, ref parent_session_key, .. }
                if parent_session_key == PARENT
        ));
    }
}
