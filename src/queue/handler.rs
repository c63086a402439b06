//! Per-type operation handlers

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::operation::{OfflineOperation, OperationType};
use crate::api::{ApiService, CachePolicy, Endpoint};
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;

/// Applies one queued operation against the remote side
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, op: &OfflineOperation) -> Result<()>;
}

/// One handler per operation type
#[derive(Clone)]
pub struct OperationHandlers {
    metric_upload: Arc<dyn OperationHandler>,
    profile_update: Arc<dyn OperationHandler>,
    analysis_submit: Arc<dyn OperationHandler>,
    insight_feedback: Arc<dyn OperationHandler>,
}

impl OperationHandlers {
    /// Route every type to the same handler
    pub fn uniform(handler: Arc<dyn OperationHandler>) -> Self {
        Self {
            metric_upload: handler.clone(),
            profile_update: handler.clone(),
            analysis_submit: handler.clone(),
            insight_feedback: handler,
        }
    }

    /// Replace the handler for one type
    pub fn with(mut self, operation_type: OperationType, handler: Arc<dyn OperationHandler>) -> Self {
        match operation_type {
            OperationType::MetricUpload => self.metric_upload = handler,
            OperationType::ProfileUpdate => self.profile_update = handler,
            OperationType::AnalysisSubmit => self.analysis_submit = handler,
            OperationType::InsightFeedback => self.insight_feedback = handler,
        }
        self
    }

    fn handler_for(&self, operation_type: OperationType) -> &Arc<dyn OperationHandler> {
        match operation_type {
            OperationType::MetricUpload => &self.metric_upload,
            OperationType::ProfileUpdate => &self.profile_update,
            OperationType::AnalysisSubmit => &self.analysis_submit,
            OperationType::InsightFeedback => &self.insight_feedback,
        }
    }

    pub async fn dispatch(&self, op: &OfflineOperation) -> Result<()> {
        self.handler_for(op.operation_type).handle(op).await
    }
}

/// Sends operations to the backend. Retries are left to the queue.
pub struct BackendOperationHandler {
    api: Arc<ApiService>,
}

impl BackendOperationHandler {
    pub fn new(api: Arc<ApiService>) -> Self {
        Self { api }
    }

    /// Endpoint an operation maps to
    pub fn endpoint_for(op: &OfflineOperation) -> Result<Endpoint> {
        let body: Value = op.payload_json()?;
        Ok(match op.operation_type {
            OperationType::MetricUpload => Endpoint::UploadMetrics { body },
            OperationType::ProfileUpdate => Endpoint::UpdateProfile { body },
            OperationType::AnalysisSubmit => Endpoint::SubmitAnalysis { body },
            OperationType::InsightFeedback => {
                let insight_id = body
                    .get("insight_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SyncError::Decode(format!("operation {}: missing insight_id", op.id))
                    })?
                    .to_string();
                Endpoint::InsightFeedback { insight_id, body }
            }
        })
    }
}

#[async_trait]
impl OperationHandler for BackendOperationHandler {
    async fn handle(&self, op: &OfflineOperation) -> Result<()> {
        let endpoint = Self::endpoint_for(op)?;
        self.api
            .execute(&endpoint, CachePolicy::NetworkOnly, RetryPolicy::None)
            .await?;
        Ok(())
    }
}
