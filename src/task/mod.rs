use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::codes::Code;
use crate::scheduler::{PieceInfo, PieceResult};

pub mod callback;
pub mod peer_task;

/// Request handed to a piece worker: which piece, from which peer.
#[derive(Debug, Clone)]
pub struct DownloadPieceRequest {
    pub task_id: String,
    pub dst_pid: String,
    pub dst_addr: String,
    pub piece: PieceInfo,
}

/// Outcome of one piece attempt, fed back into the task by the downloader.
#[derive(Debug, Clone)]
pub struct PieceTaskResult {
    pub piece: PieceInfo,
    pub result: PieceResult,
}

#[derive(Debug, Clone)]
pub struct ProgressState {
    pub success: bool,
    pub code: Code,
    pub msg: String,
}

/// Acknowledgement handle carried by the terminal progress event. Invoking
/// it tells the task the initiator has seen the final state, which releases
/// the progress channel.
#[derive(Debug)]
pub struct DoneAck {
    peer_task_done: Arc<AtomicBool>,
    progress_stop: CancellationToken,
}

impl DoneAck {
    pub(crate) fn new(peer_task_done: Arc<AtomicBool>, progress_stop: CancellationToken) -> Self {
        DoneAck {
            peer_task_done,
            progress_stop,
        }
    }

    pub fn ack(self) {
        self.peer_task_done.store(true, Ordering::SeqCst);
        self.progress_stop.cancel();
    }
}

/// Download progress streamed to the initiator. Exactly one event per task
/// carries `done = true`; that one also carries the ack handle.
#[derive(Debug)]
pub struct ProgressEvent {
    pub state: ProgressState,
    pub task_id: String,
    pub peer_id: String,
    pub content_length: i64,
    pub completed_length: i64,
    pub done: bool,
    pub done_ack: Option<DoneAck>,
}

/// Hooks the task invokes at its lifecycle edges. `init` fires once the
/// content length is first known, `update` when the piece total grows,
/// `done`/`fail` exactly once combined.
#[async_trait]
pub trait TaskCallback: Send + Sync {
    async fn init(&self, task: &peer_task::PeerTask) -> Result<()>;
    async fn update(&self, task: &peer_task::PeerTask) -> Result<()>;
    async fn done(&self, task: &peer_task::PeerTask) -> Result<()>;
    async fn fail(&self, task: &peer_task::PeerTask, code: Code, reason: &str) -> Result<()>;
    fn start_time(&self) -> Instant;
}
