//! Golden tests - fixture-based tests that lock expected behavior
//!
//! These tests use JSON fixtures to verify wire formats and lifecycle rules.
//! Any change in behavior will cause these tests to fail, signaling a
//! potential protocol break with the backend or the channel server.
//!
//! Run with: cargo test --test golden_tests

use serde::Deserialize;
use std::fs;

fn read_fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read {}: {}", path, e))
}

// ============================================================================
// CHANNEL MESSAGE GOLDEN TESTS
// ============================================================================

mod channel_golden {
    use super::*;
    use vitalsync::realtime::{ChannelEvent, ChannelMessage, MessageCategory};
    use vitalsync::SyncError;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        frame: String,
        expected: Expected,
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Expected {
        Ok {
            #[serde(rename = "type")]
            message_type: String,
            category: String,
            event: String,
        },
        Err {
            error: String,
        },
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    fn category_name(category: MessageCategory) -> &'static str {
        match category {
            MessageCategory::Control => "control",
            MessageCategory::Data => "data",
            MessageCategory::Request => "request",
        }
    }

    fn event_name(event: &ChannelEvent) -> &'static str {
        match event {
            ChannelEvent::Pong => "pong",
            ChannelEvent::Error(_) => "error",
            ChannelEvent::MetricUpdate(_) => "metric_update",
            ChannelEvent::InsightNotification(_) => "insight_notification",
            ChannelEvent::AnalysisUpdate(_) => "analysis_update",
            ChannelEvent::SyncStatusUpdate(_) => "sync_status_update",
            ChannelEvent::SystemNotification(_) => "system_notification",
            ChannelEvent::Other(_) => "other",
        }
    }

    #[test]
    fn test_channel_messages_golden() {
        let fixture: Fixture = serde_json::from_str(&read_fixture("channel_messages.json"))
            .expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            let decoded = ChannelMessage::decode(case.frame.as_bytes());

            match case.expected {
                Expected::Ok {
                    message_type,
                    category,
                    event,
                } => {
                    let message = decoded
                        .unwrap_or_else(|e| panic!("Case '{}': frame rejected: {}", case.name, e));
                    assert_eq!(message.message_type.as_str(), message_type, "Case '{}'", case.name);
                    assert_eq!(
                        category_name(message.message_type.category()),
                        category,
                        "Case '{}'",
                        case.name
                    );
                    let decoded_event = ChannelEvent::decode(&message)
                        .unwrap_or_else(|e| panic!("Case '{}': payload rejected: {}", case.name, e));
                    assert_eq!(event_name(&decoded_event), event, "Case '{}'", case.name);

                    // Re-encoding keeps the envelope intact
                    let again = ChannelMessage::decode(message.encode().unwrap().as_bytes()).unwrap();
                    assert_eq!(again, message, "Case '{}': re-encode mismatch", case.name);
                }
                Expected::Err { error } => match error.as_str() {
                    "frame" => assert!(
                        matches!(decoded, Err(SyncError::Decode(_))),
                        "Case '{}': expected frame error, got {:?}",
                        case.name,
                        decoded
                    ),
                    "payload" => {
                        let message = decoded.unwrap_or_else(|e| {
                            panic!("Case '{}': frame rejected: {}", case.name, e)
                        });
                        assert!(
                            matches!(ChannelEvent::decode(&message), Err(SyncError::Decode(_))),
                            "Case '{}': expected payload error",
                            case.name
                        );
                    }
                    other => panic!("Case '{}': unknown error kind {}", case.name, other),
                },
            }
        }
    }
}

// ============================================================================
// STATUS TRANSITION GOLDEN TESTS
// ============================================================================

mod transition_golden {
    use super::*;
    use vitalsync::types::SyncStatus;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        from: SyncStatus,
        to: SyncStatus,
        allowed: bool,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_status_transitions_golden() {
        let fixture: Fixture = serde_json::from_str(&read_fixture("status_transitions.json"))
            .expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            assert_eq!(
                case.from.can_transition_to(case.to),
                case.allowed,
                "{} -> {}",
                case.from,
                case.to
            );
            assert_eq!(case.from.transition(case.to).is_ok(), case.allowed);
        }
    }
}

// ============================================================================
// ENDPOINT GOLDEN TESTS
// ============================================================================

mod endpoint_golden {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use vitalsync::api::Endpoint;
    use vitalsync::types::EntityType;

    #[derive(Debug, Deserialize)]
    struct Spec {
        kind: String,
        entity: Option<EntityType>,
        since: Option<DateTime<Utc>>,
        id: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        endpoint: Spec,
        method: String,
        path: String,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    fn build(spec: Spec) -> Endpoint {
        let entity = || spec.entity.expect("fixture needs an entity");
        let id = || spec.id.clone().expect("fixture needs an id");
        match spec.kind.as_str() {
            "upload_batch" => Endpoint::UploadBatch {
                entity: entity(),
                body: json!([]),
            },
            "fetch_changes" => Endpoint::FetchChanges {
                entity: entity(),
                since: spec.since,
            },
            "get_profile" => Endpoint::GetProfile,
            "update_profile" => Endpoint::UpdateProfile { body: json!({}) },
            "submit_analysis" => Endpoint::SubmitAnalysis { body: json!({}) },
            "get_analysis" => Endpoint::GetAnalysis { id: id() },
            "insight_feedback" => Endpoint::InsightFeedback {
                insight_id: id(),
                body: json!({}),
            },
            "upload_metrics" => Endpoint::UploadMetrics { body: json!({}) },
            other => panic!("unknown endpoint kind {}", other),
        }
    }

    #[test]
    fn test_endpoint_paths_golden() {
        let fixture: Fixture = serde_json::from_str(&read_fixture("endpoint_paths.json"))
            .expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            let endpoint = build(case.endpoint);
            assert_eq!(endpoint.method().as_str(), case.method, "Case '{}'", case.name);
            assert_eq!(endpoint.path(), case.path, "Case '{}'", case.name);
            assert_eq!(
                endpoint.cache_key(),
                format!("{}:{}", case.method, case.path),
                "Case '{}'",
                case.name
            );
        }
    }
}
