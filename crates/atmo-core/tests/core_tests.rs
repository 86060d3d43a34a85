#[cfg(test)]
mod tests {
    use atmo_core::*;

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_token_invalid_display_carries_reason() {
        let err = AtmoError::token(TokenRejection::Expired);
        assert_eq!(err.to_string(), "token invalid: expired");
    }

    #[test]
    fn test_rejection_reasons_are_distinct() {
        let reasons = [
            TokenRejection::Malformed,
            TokenRejection::BadSignature,
            TokenRejection::Expired,
            TokenRejection::NotYetValid,
            TokenRejection::WrongMesh,
            TokenRejection::IssuerMismatch,
            TokenRejection::UntrustedIssuer,
            TokenRejection::SubjectMismatch,
        ];
        let mut seen = std::collections::HashSet::new();
        for r in reasons {
            assert!(seen.insert(r.to_string()), "duplicate reason {r}");
        }
    }

    #[test]
    fn test_timeout_display() {
        let err = AtmoError::Timeout {
            request_id: "req-1".into(),
            waited_ms: 2000,
        };
        let s = err.to_string();
        assert!(s.contains("req-1"));
        assert!(s.contains("2000"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            AtmoError::Timeout {
                request_id: "r".into(),
                waited_ms: 1
            }
            .is_retryable()
        );
        assert!(AtmoError::NoCandidateCapability("llm".into()).is_retryable());
        assert!(!AtmoError::token(TokenRejection::BadSignature).is_retryable());
        assert!(!AtmoError::Signing("no key".into()).is_retryable());
    }

    #[test]
    fn test_error_from_serde() {
        let json_err = serde_json::from_str::<String>("not valid json").unwrap_err();
        let err: AtmoError = json_err.into();
        assert!(matches!(err, AtmoError::Serialization(_)));
    }

    // ── Event bus tests ────────────────────────────────────────

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::CapabilitiesEvicted { count: 3 });
        match rx.recv().await.unwrap() {
            Event::CapabilitiesEvicted { count } => assert_eq!(count, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_event_bus_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(Event::NodeStopped {
            node_id: "n".into(),
        });
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let ev = Event::PeerRejected {
            node_id: "abc".into(),
            reason: "expired".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"kind\":\"peer_rejected\""));
    }
}
