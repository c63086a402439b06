//! Backend endpoints as a closed sum type

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::EntityType;

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Responses to these methods may be cached
    pub fn is_read(&self) -> bool {
        matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every backend call the engine makes
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// Push a chunk of records of one entity type
    UploadBatch { entity: EntityType, body: Value },
    /// Remote changes of one entity type since a point in time
    FetchChanges {
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    },
    GetProfile,
    UpdateProfile { body: Value },
    SubmitAnalysis { body: Value },
    GetAnalysis { id: String },
    InsightFeedback { insight_id: String, body: Value },
    /// Raw wearable samples
    UploadMetrics { body: Value },
}

impl Endpoint {
    pub fn method(&self) -> Method {
        match self {
            Endpoint::UploadBatch { .. }
            | Endpoint::SubmitAnalysis { .. }
            | Endpoint::InsightFeedback { .. }
            | Endpoint::UploadMetrics { .. } => Method::Post,
            Endpoint::FetchChanges { .. } | Endpoint::GetProfile | Endpoint::GetAnalysis { .. } => {
                Method::Get
            }
            Endpoint::UpdateProfile { .. } => Method::Put,
        }
    }

    /// Path relative to the API base URL, including any query string
    pub fn path(&self) -> String {
        match self {
            Endpoint::UploadBatch { entity, .. } => format!("/{}/batch", entity.api_segment()),
            Endpoint::FetchChanges { entity, since } => match since {
                Some(since) => format!(
                    "/{}/changes?since={}",
                    entity.api_segment(),
                    since.to_rfc3339_opts(SecondsFormat::Millis, true)
                ),
                None => format!("/{}/changes", entity.api_segment()),
            },
            Endpoint::GetProfile | Endpoint::UpdateProfile { .. } => "/profile".to_string(),
            Endpoint::SubmitAnalysis { .. } => "/pat/analyze".to_string(),
            Endpoint::GetAnalysis { id } => format!("/pat/analysis/{}", id),
            Endpoint::InsightFeedback { insight_id, .. } => {
                format!("/insights/{}/feedback", insight_id)
            }
            Endpoint::UploadMetrics { .. } => "/health-data/upload".to_string(),
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Endpoint::UploadBatch { body, .. }
            | Endpoint::UpdateProfile { body }
            | Endpoint::SubmitAnalysis { body }
            | Endpoint::InsightFeedback { body, .. }
            | Endpoint::UploadMetrics { body } => Some(body),
            Endpoint::FetchChanges { .. } | Endpoint::GetProfile | Endpoint::GetAnalysis { .. } => {
                None
            }
        }
    }

    /// Safe to repeat without side effects
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method(), Method::Get | Method::Put | Method::Delete)
    }

    /// `METHOD:path`, used as the response cache key
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.method(), self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_paths_and_methods() {
        let upload = Endpoint::UploadBatch {
            entity: EntityType::Metric,
            body: json!([]),
        };
        assert_eq!(upload.method(), Method::Post);
        assert_eq!(upload.path(), "/health-data/batch");
        assert!(!upload.is_idempotent());

        let feedback = Endpoint::InsightFeedback {
            insight_id: "abc".into(),
            body: json!({"helpful": true}),
        };
        assert_eq!(feedback.path(), "/insights/abc/feedback");
        assert!(feedback.body().is_some());

        assert_eq!(Endpoint::GetProfile.cache_key(), "GET:/profile");
        assert_eq!(
            Endpoint::UpdateProfile { body: json!({}) }.cache_key(),
            "PUT:/profile"
        );
    }

    #[test]
    fn test_fetch_changes_query() {
        let since = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let endpoint = Endpoint::FetchChanges {
            entity: EntityType::Insight,
            since: Some(since),
        };
        assert_eq!(
            endpoint.path(),
            "/insights/changes?since=2024-01-02T03:04:05.000Z"
        );
        assert!(endpoint.body().is_none());
        assert!(endpoint.method().is_read());
    }
}
