//! Publishing the snapshot to a downstream sink.
//!
//! Two interchangeable sinks implement [`Sink`]: [`ApiSink`] pushes new
//! entities and units to a remote API, [`GitSink`] commits the serialized
//! snapshot file and pushes it to a branch. [`Publisher`] wraps either one
//! with the run-level policy: skip unchanged snapshots, retry once, record
//! the published hash.

pub mod api;
pub mod git;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use storysync_shared::{ResolvedSink, Result, Snapshot, StorySyncError};
use storysync_storage::Storage;

pub use api::ApiSink;
pub use git::GitSink;

/// What a sink did with one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SinkReport {
    /// Entities the sink did not know before.
    pub entities_created: usize,
    /// Units handed to the sink.
    pub units_added: usize,
    /// Whether a new commit was created (git sink only).
    pub committed: bool,
}

/// A downstream destination for snapshots.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable name, used as the publish-state key.
    fn name(&self) -> &str;

    /// Deliver the whole snapshot. Must be safe to call again after a
    /// partial failure.
    async fn publish(&self, snapshot: &Snapshot) -> Result<SinkReport>;
}

/// Build the sink described by resolved configuration.
pub fn build_sink(resolved: ResolvedSink, timeout: Duration) -> Result<Box<dyn Sink>> {
    match resolved {
        ResolvedSink::Api { base_url, token } => {
            Ok(Box::new(ApiSink::new(&base_url, token, timeout)?))
        }
        ResolvedSink::Git {
            repo_dir,
            file,
            remote_url,
            branch,
            token,
            author_name,
            author_email,
        } => Ok(Box::new(GitSink {
            repo_dir,
            file,
            remote_url,
            branch,
            token,
            author_name,
            author_email,
        })),
    }
}

/// Result of a publish attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published(SinkReport),
    /// The sink already holds this exact snapshot.
    Unchanged,
}

/// Applies the publish policy around a [`Sink`].
pub struct Publisher {
    sink: Box<dyn Sink>,
    storage: Arc<Storage>,
}

impl Publisher {
    pub fn new(sink: Box<dyn Sink>, storage: Arc<Storage>) -> Self {
        Self { sink, storage }
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Publish `snapshot` unless the sink already accepted an identical one.
    ///
    /// The whole publish is retried once. On a second failure the recorded
    /// hash is left untouched so the next run tries again, and a
    /// [`StorySyncError::Sink`] is returned.
    #[instrument(skip_all, fields(sink = self.sink.name(), force))]
    pub async fn publish(&self, snapshot: &Snapshot, force: bool) -> Result<PublishOutcome> {
        let hash = snapshot.content_hash()?;

        if !force {
            if let Some(state) = self.storage.get_publish_state(self.sink.name()).await? {
                if state.snapshot_hash == hash {
                    info!("snapshot unchanged since last publish, skipping");
                    return Ok(PublishOutcome::Unchanged);
                }
            }
        }

        let report = match self.sink.publish(snapshot).await {
            Ok(report) => report,
            Err(first) => {
                warn!(error = %first, "publish failed, retrying once");
                self.sink.publish(snapshot).await.map_err(|second| {
                    StorySyncError::Sink(format!("publish failed twice: {second}"))
                })?
            }
        };

        self.storage
            .set_publish_state(self.sink.name(), &hash)
            .await?;
        info!(
            entities_created = report.entities_created,
            units_added = report.units_added,
            committed = report.committed,
            "snapshot published"
        );
        Ok(PublishOutcome::Published(report))
    }
}
