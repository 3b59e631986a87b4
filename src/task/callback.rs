use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::codes::Code;
use crate::storage::PieceStorage;

use super::TaskCallback;
use super::peer_task::PeerTask;

/// Callback wiring a task to its piece storage: the task entry is created
/// when the content length is first known, kept up to date as metadata
/// grows, and the finished content is digest-checked and copied to the
/// output destination.
pub struct StorageCallback {
    storage: Arc<dyn PieceStorage>,
    output: PathBuf,
    start: Instant,
}

impl StorageCallback {
    pub fn new(storage: Arc<dyn PieceStorage>, output: PathBuf) -> Self {
        StorageCallback {
            storage,
            output,
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl TaskCallback for StorageCallback {
    async fn init(&self, task: &PeerTask) -> Result<()> {
        self.storage
            .register_task(task.task_id(), task.content_length())
            .await
            .context("register task in storage")?;
        Ok(())
    }

    async fn update(&self, task: &PeerTask) -> Result<()> {
        // re-register refreshes the stored content length only
        self.storage
            .register_task(task.task_id(), task.content_length())
            .await
            .context("update task in storage")?;
        Ok(())
    }

    async fn done(&self, task: &PeerTask) -> Result<()> {
        let digest = &task.request().url_meta.digest;
        self.storage
            .validate_digest(task.task_id(), digest)
            .await
            .context("validate content digest")?;
        self.storage
            .store_to_destination(task.task_id(), &self.output)
            .await
            .context("store content to destination")?;
        log::info!(
            "task {} stored to {}, cost: {}ms",
            task.task_id(),
            self.output.display(),
            self.start.elapsed().as_millis()
        );
        Ok(())
    }

    async fn fail(&self, task: &PeerTask, code: Code, reason: &str) -> Result<()> {
        log::error!(
            "task {} failed after {}ms, code: {code}, reason: {reason}",
            task.task_id(),
            self.start.elapsed().as_millis()
        );
        Ok(())
    }

    fn start_time(&self) -> Instant {
        self.start
    }
}
