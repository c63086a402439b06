//! Offline operation model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Kind of deferred mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    MetricUpload,
    ProfileUpdate,
    AnalysisSubmit,
    InsightFeedback,
}

impl OperationType {
    pub const ALL: [OperationType; 4] = [
        OperationType::MetricUpload,
        OperationType::ProfileUpdate,
        OperationType::AnalysisSubmit,
        OperationType::InsightFeedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::MetricUpload => "metric_upload",
            OperationType::ProfileUpdate => "profile_update",
            OperationType::AnalysisSubmit => "analysis_submit",
            OperationType::InsightFeedback => "insight_feedback",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::Decode(format!("unknown operation type: {}", s)))
    }
}

/// Priority presets; any `i32` is accepted, lower runs first
pub mod priority {
    pub const HIGH: i32 = 0;
    pub const NORMAL: i32 = 10;
    pub const LOW: i32 = 20;
}

/// A durable unit of deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: Uuid,
    pub operation_type: OperationType,
    /// Opaque serialized request body
    pub payload: Vec<u8>,
    pub priority: i32,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Not processed before this time; `None` means immediately
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OfflineOperation {
    pub fn new(operation_type: OperationType, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_type,
            payload,
            priority: priority::NORMAL,
            retry_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Create an operation whose payload is `body` serialized as JSON
    pub fn json<T: Serialize>(operation_type: OperationType, body: &T) -> Result<Self> {
        Ok(Self::new(operation_type, serde_json::to_vec(body)?))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Decode the payload as JSON
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| SyncError::Decode(format!("operation {}: {}", self.id, e)))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// An operation that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub operation: OfflineOperation,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_payload() {
        let op = OfflineOperation::json(OperationType::InsightFeedback, &json!({"helpful": true}))
            .unwrap()
            .with_priority(priority::HIGH);
        let body: serde_json::Value = op.payload_json().unwrap();
        assert_eq!(body["helpful"], true);
        assert_eq!(op.priority, priority::HIGH);
        assert_eq!(op.retry_count, 0);
    }

    #[test]
    fn test_bad_payload_is_decode_error() {
        let op = OfflineOperation::new(OperationType::MetricUpload, b"not json".to_vec());
        let result: Result<serde_json::Value> = op.payload_json();
        assert!(matches!(result, Err(SyncError::Decode(_))));
    }

    #[test]
    fn test_due() {
        let now = Utc::now();
        let mut op = OfflineOperation::new(OperationType::ProfileUpdate, vec![]);
        assert!(op.is_due(now));
        op.next_attempt_at = Some(now + chrono::Duration::seconds(10));
        assert!(!op.is_due(now));
    }

    #[test]
    fn test_type_names() {
        for t in OperationType::ALL {
            assert_eq!(t.as_str().parse::<OperationType>().unwrap(), t);
        }
    }
}
