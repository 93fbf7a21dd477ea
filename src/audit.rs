//! Audit sink.
//!
//! Audit writes are fire-and-forget: a failing sink is logged and never
//! aborts the operation being audited.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Who acted. "system" for background scans.
    pub actor: String,
    pub action: String,
    /// Resource reference, e.g. `followup:<uuid>`.
    pub resource: String,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        actor: impl ToString,
        action: impl Into<String>,
        resource: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            actor: actor.to_string(),
            action: action.into(),
            resource: resource.into(),
            details,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<()>;
}

/// Writes audit records to the tracing pipeline only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        info!(
            actor = %entry.actor,
            action = %entry.action,
            resource = %entry.resource,
            details = %entry.details,
            "audit"
        );
        Ok(())
    }
}

/// Record an audit entry, swallowing (and logging) any failure.
pub async fn record_best_effort(sink: &dyn AuditSink, entry: AuditEntry) {
    if let Err(e) = sink.record(&entry).await {
        warn!(
            action = %entry.action,
            resource = %entry.resource,
            error = %e,
            "audit record failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSink(AtomicUsize);

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _entry: &AuditEntry) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("audit store down".into()))
        }
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let sink = FailingSink(AtomicUsize::new(0));
        record_best_effort(
            &sink,
            AuditEntry::new("system", "followup.escalate", "followup:1", serde_json::json!({})),
        )
        .await;
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }
}
