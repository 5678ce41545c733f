/// Lazy per-report metadata cache
use crate::backend::{Backend, ReportMeta};
use crate::error::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Report metadata never changes after upload, so the first fetched value
/// is kept for good. Content is fetched on demand and not cached.
pub struct ReportCache<B> {
    backend: Arc<B>,
    entries: RwLock<HashMap<String, ReportMeta>>,
}

impl<B: Backend> ReportCache<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn metadata(&self, report_id: &str) -> Result<ReportMeta> {
        if let Some(meta) = self.entries.read().await.get(report_id) {
            return Ok(meta.clone());
        }

        debug!("Report {} not cached, fetching", report_id);
        let fetched = self.backend.fetch_report_meta(report_id).await?;

        // Two concurrent misses may both fetch; the first insert wins
        let mut entries = self.entries.write().await;
        Ok(entries
            .entry(report_id.to_string())
            .or_insert(fetched)
            .clone())
    }

    pub async fn content(&self, report_id: &str) -> Result<Bytes> {
        self.backend.fetch_report_content(report_id).await
    }
}
