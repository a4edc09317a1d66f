//! Execution context persistence.
//!
//! Persistence is advisory: the pipeline's in-memory map is the system of
//! record, and a failed `save` is logged by the caller and otherwise ignored.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use super::context::ExecutionContext;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatePersistence: Send + Sync {
    async fn save(&self, context: &ExecutionContext) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

#[async_trait]
impl StatePersistence for NoopPersistence {
    async fn save(&self, _context: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

/// One pretty-printed JSON file per execution id under `dir`.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn file_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Load a saved context. Returns None if nothing was saved under `id`.
    pub async fn load(&self, id: &str) -> Result<Option<ExecutionContext>> {
        let path = self.file_for(id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "No saved execution");
            return Ok(None);
        }

        let json = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read execution state from {}", path.display()))?;
        let context: ExecutionContext = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse execution state from {}", path.display()))?;

        info!(
            execution_id = %context.id,
            state = %context.state,
            "Execution state loaded from disk"
        );
        Ok(Some(context))
    }

    /// Remove a saved context, if any.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let path = self.file_for(id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StatePersistence for JsonFilePersistence {
    async fn save(&self, context: &ExecutionContext) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create state dir {}", self.dir.display()))?;

        let json = serde_json::to_string_pretty(context)
            .context("Failed to serialise execution context")?;
        let path = self.file_for(&context.id);
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write execution state to {}", path.display()))?;

        debug!(execution_id = %context.id, state = %context.state, "Execution state saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::ExecutionState;
    use crate::types::{Opportunity, Path, Urgency};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn temp_dir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("conclave_test_state_{}", uuid::Uuid::new_v4()));
        p
    }

    fn context() -> ExecutionContext {
        let opp = Opportunity::new(
            "flash_loan",
            serde_json::json!({ "pool": "0xabc" }),
            dec!(42.5),
            0.3,
            Urgency::High,
            Utc::now(),
        );
        ExecutionContext::new(opp, Path::new(dec!(650)), 2)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = JsonFilePersistence::new(temp_dir());
        let mut ctx = context();
        ctx.transition(ExecutionState::Detecting);
        ctx.errors.push("warning".into());

        store.save(&ctx).await.unwrap();
        let loaded = store.load(&ctx.id).await.unwrap().expect("saved context");

        assert_eq!(loaded.id, ctx.id);
        assert_eq!(loaded.state, ExecutionState::Detecting);
        assert_eq!(loaded.opportunity.expected_value, dec!(42.5));
        assert_eq!(loaded.path.net_profit, dec!(650));
        assert_eq!(loaded.state_history, ctx.state_history);

        store.delete(&ctx.id).await.unwrap();
        assert!(store.load(&ctx.id).await.unwrap().is_none());
        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn test_load_unknown_id() {
        let store = JsonFilePersistence::new(temp_dir());
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_state() {
        let store = JsonFilePersistence::new(temp_dir());
        let mut ctx = context();
        store.save(&ctx).await.unwrap();
        ctx.transition(ExecutionState::Completed);
        store.save(&ctx).await.unwrap();

        let loaded = store.load(&ctx.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, ExecutionState::Completed);
        let _ = std::fs::remove_dir_all(store.dir());
    }
}
