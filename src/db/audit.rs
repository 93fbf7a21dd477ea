//! Audit log table.

use async_trait::async_trait;

use crate::audit::{AuditEntry, AuditSink};
use crate::error::Result;

#[async_trait]
impl AuditSink for super::Db {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (actor, action, resource, details) VALUES ($1, $2, $3, $4)",
        )
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&entry.details)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
