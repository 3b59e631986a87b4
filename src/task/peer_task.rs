use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;

use crate::bitmap::PieceBitmap;
use crate::codes::Code;
use crate::config::{DEFAULT_PIECE_CHAN_SIZE, SchedulerOptions};
use crate::downloader::{PieceDownloader, RemoteCode};
use crate::limiter::RateLimiter;
use crate::retry::{self, Attempt};
use crate::scheduler::{
    DestPeer, DirectPiece, PeerPacket, PeerPacketStream, PiecePacket, PieceInfo, PieceResult,
    PieceStyle, PieceTaskRequest, RecvError, SchedulerClient, SinglePiece, SizeScope, TaskRequest,
};
use crate::storage::PieceStorage;

use super::{
    DoneAck, DownloadPieceRequest, PieceTaskResult, ProgressEvent, ProgressState, TaskCallback,
};

const REASON_SCHEDULE_TIMEOUT: &str = "wait first peer packet from scheduler timeout";
const REASON_RESCHEDULE_TIMEOUT: &str = "wait more available peers from scheduler timeout";
const REASON_CONTEXT_CANCELED: &str = "context canceled";
const REASON_PEER_GONE: &str = "scheduler says client should disconnect";
const REASON_BACK_SOURCE: &str = "scheduler requires downloading from the source";

const GET_PIECE_RETRY_INIT: Duration = Duration::from_millis(50);
const GET_PIECE_RETRY_MAX: Duration = Duration::from_millis(200);
const GET_PIECE_RETRY_ATTEMPTS: usize = 40;

#[derive(Debug, Error)]
#[error("peer packet changed")]
struct PeerPacketChanged;

enum ScheduleDecision {
    /// A peer packet is available; carries the piece number to resume from.
    Ready(i32),
    BackSource,
    Exit,
}

/// One end-to-end download of one url. Owns the piece bitmaps, the current
/// peer packet, the failure state and the cancellation context; the
/// coordinator loop, the pull loop and the piece workers all run against a
/// shared handle of this.
pub struct PeerTask {
    cancel: CancellationToken,
    done: CancellationToken,
    peer_task_done: Arc<AtomicBool>,
    finish_latch: AtomicBool,

    request: TaskRequest,
    peer_id: String,
    task_id: String,

    scheduler_options: SchedulerOptions,
    stream: PeerPacketStream,
    downloader: Arc<dyn PieceDownloader>,
    storage: Arc<dyn PieceStorage>,
    callback: Arc<dyn TaskCallback>,
    limiter: Option<RateLimiter>,

    need_back_source: AtomicBool,
    single_piece: Option<SinglePiece>,
    tiny_content: Option<Bytes>,

    total_pieces: AtomicI32,
    content_length: AtomicI64,
    completed_length: AtomicI64,
    used_traffic: AtomicI64,

    peer_packet: StdRwLock<Option<Arc<PeerPacket>>>,
    parallel_count: AtomicI32,
    peer_packet_ready_tx: Sender<()>,
    peer_packet_ready_rx: AsyncMutex<Receiver<()>>,
    back_source_signal: CancellationToken,

    // guards the ready-bit + completed-length pair so the two always move
    // together
    piece_lock: StdMutex<()>,
    ready_pieces: PieceBitmap,
    requested_pieces: PieceBitmap,

    failed: StdMutex<Option<(Code, String)>>,
    failed_piece_tx: Sender<i32>,
    failed_piece_rx: AsyncMutex<Receiver<i32>>,

    progress_tx: Sender<ProgressEvent>,
    progress_stop: CancellationToken,
}

impl PeerTask {
    /// Registers the task with the scheduler and builds the task state. On
    /// an unreachable scheduler, with auto back source enabled, the task is
    /// built around a stub stream that escalates to back-source on its own.
    pub async fn new(
        request: TaskRequest,
        scheduler: Arc<dyn SchedulerClient>,
        downloader: Arc<dyn PieceDownloader>,
        storage: Arc<dyn PieceStorage>,
        callback: Arc<dyn TaskCallback>,
        scheduler_options: SchedulerOptions,
        per_peer_rate_limit: Option<u64>,
    ) -> Result<(Arc<PeerTask>, Receiver<ProgressEvent>)> {
        log::info!(
            "request overview, url: {}, filter: {:?}, tag: {:?}, peer: {}",
            request.url,
            request.url_meta.filter,
            request.url_meta.tag,
            request.peer_id
        );
        log::info!("step 1: peer {} start to register", request.peer_id);
        let mut need_back_source = false;
        let register_result = match scheduler.register_peer_task(&request).await {
            Ok(result) => Some(result),
            Err(e) => {
                log::error!("step 1: peer {} register failed: {e}", request.peer_id);
                if scheduler_options.disable_auto_back_source {
                    return Err(e.context(format!(
                        "register peer task failed ({}), auto back source disabled",
                        Code::ClientRegisterFail
                    )));
                }
                log::warn!(
                    "register peer task failed, peer id: {}, try to back source",
                    request.peer_id
                );
                need_back_source = true;
                None
            }
        };

        let task_id = match &register_result {
            Some(result) => result.task_id.clone(),
            None => crate::scheduler::task_id(&request.url, &request.url_meta),
        };
        log::info!(
            "step 1: task id: {task_id}, peer id: {}, back source: {need_back_source}",
            request.peer_id
        );

        let mut single_piece = None;
        let mut tiny_content = None;
        let mut stream = PeerPacketStream::Stub;
        if !need_back_source {
            let result = register_result.as_ref().expect("registration checked above");
            match result.size_scope {
                SizeScope::Tiny => {
                    log::info!("{task_id}/{} size scope: tiny", request.peer_id);
                    match &result.direct_piece {
                        DirectPiece::Content(content) => tiny_content = Some(content.clone()),
                        _ => bail!("scheduler returned tiny size scope without piece content"),
                    }
                }
                SizeScope::Small => {
                    log::info!("{task_id}/{} size scope: small", request.peer_id);
                    if let DirectPiece::Single(piece) = &result.direct_piece {
                        single_piece = Some(piece.clone());
                    }
                }
                SizeScope::Normal => {
                    log::info!("{task_id}/{} size scope: normal", request.peer_id);
                }
            }
            if tiny_content.is_none() {
                log::info!("step 2: start report peer {} piece result", request.peer_id);
                stream = scheduler.report_piece_result(&task_id, &request).await?;
            }
        }

        let limiter = per_peer_rate_limit.map(|rate| RateLimiter::new(rate, rate));
        let (peer_packet_ready_tx, peer_packet_ready_rx) = mpsc::channel(1);
        let (failed_piece_tx, failed_piece_rx) = mpsc::channel(DEFAULT_PIECE_CHAN_SIZE);
        let (progress_tx, progress_rx) = mpsc::channel(1);

        let task = Arc::new(PeerTask {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            peer_task_done: Arc::new(AtomicBool::new(false)),
            finish_latch: AtomicBool::new(false),
            peer_id: request.peer_id.clone(),
            task_id,
            request,
            scheduler_options,
            stream,
            downloader,
            storage,
            callback,
            limiter,
            need_back_source: AtomicBool::new(need_back_source),
            single_piece,
            tiny_content,
            total_pieces: AtomicI32::new(-1),
            content_length: AtomicI64::new(-1),
            completed_length: AtomicI64::new(0),
            used_traffic: AtomicI64::new(0),
            peer_packet: StdRwLock::new(None),
            parallel_count: AtomicI32::new(0),
            peer_packet_ready_tx,
            peer_packet_ready_rx: AsyncMutex::new(peer_packet_ready_rx),
            back_source_signal: CancellationToken::new(),
            piece_lock: StdMutex::new(()),
            ready_pieces: PieceBitmap::new(),
            requested_pieces: PieceBitmap::new(),
            failed: StdMutex::new(None),
            failed_piece_tx,
            failed_piece_rx: AsyncMutex::new(failed_piece_rx),
            progress_tx,
            progress_stop: CancellationToken::new(),
        });
        Ok((task, progress_rx))
    }

    /// Dispatches on the registration outcome and starts the long-lived
    /// loops. Returns immediately; progress flows on the channel handed out
    /// by [`PeerTask::new`].
    pub fn start(self: &Arc<Self>) {
        if self.tiny_content.is_some() {
            tokio::spawn(self.clone().store_tiny());
            return;
        }
        if self.need_back_source.load(Ordering::SeqCst) {
            self.content_length.store(-1, Ordering::SeqCst);
            let task = self.clone();
            tokio::spawn(async move {
                if let Err(e) = task.callback.init(&task).await {
                    log::error!("task {} init callback failed: {e}", task.task_id);
                }
                task.back_source().await;
            });
            return;
        }
        if self.single_piece.is_some() {
            tokio::spawn(self.clone().pull_single_piece());
            return;
        }
        tokio::spawn(self.clone().receive_peer_packet());
        tokio::spawn(self.clone().pull_pieces_from_peers());
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn request(&self) -> &TaskRequest {
        &self.request
    }

    pub fn context(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancelled exactly once, when the task reaches a terminal state.
    pub fn done_signal(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    pub fn content_length(&self) -> i64 {
        self.content_length.load(Ordering::SeqCst)
    }

    pub fn completed_length(&self) -> i64 {
        self.completed_length.load(Ordering::SeqCst)
    }

    pub fn total_pieces(&self) -> i32 {
        self.total_pieces.load(Ordering::SeqCst)
    }

    pub fn set_total_pieces(&self, total: i32) {
        self.total_pieces.fetch_max(total, Ordering::SeqCst);
    }

    pub fn ready_piece_count(&self) -> i32 {
        self.ready_pieces.settled()
    }

    pub fn add_traffic(&self, n: i64) {
        self.used_traffic.fetch_add(n, Ordering::SeqCst);
    }

    pub fn traffic(&self) -> i64 {
        self.used_traffic.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        let content_length = self.content_length.load(Ordering::SeqCst);
        content_length >= 0 && self.completed_length.load(Ordering::SeqCst) == content_length
    }

    /// Stores the now-known content length; when everything is already
    /// downloaded this finishes the task. The back-source path calls this
    /// once the origin body is fully consumed.
    pub async fn set_content_length(&self, len: i64) -> Result<()> {
        self.content_length.store(len, Ordering::SeqCst);
        if !self.is_completed() {
            return Ok(());
        }
        self.finish().await
    }

    fn set_failed(&self, code: Code, reason: impl Into<String>) {
        let mut failed = self.failed.lock().expect("failed lock poisoned");
        if failed.is_none() {
            *failed = Some((code, reason.into()));
        }
    }

    fn failed_snapshot(&self) -> (Code, String) {
        self.failed
            .lock()
            .expect("failed lock poisoned")
            .clone()
            .unwrap_or((Code::UnknownError, "unknown".to_string()))
    }

    fn acquire_finish(&self) -> bool {
        !self.finish_latch.swap(true, Ordering::SeqCst)
    }

    fn peer_packet_snapshot(&self) -> Option<Arc<PeerPacket>> {
        self.peer_packet
            .read()
            .expect("peer packet lock poisoned")
            .clone()
    }

    fn peer_packet_changed(&self, cur: &PeerPacket) -> bool {
        match self.peer_packet_snapshot() {
            Some(latest) => {
                let cur_main = cur.main_peer.as_ref().map(|p| p.peer_id.as_str());
                let latest_main = latest.main_peer.as_ref().map(|p| p.peer_id.as_str());
                cur_main != latest_main
            }
            None => false,
        }
    }

    /// Sends a piece result upstream. Once the task went back to source the
    /// scheduler is no longer interested and sends are suppressed.
    async fn send_piece_result(&self, result: PieceResult) -> Result<()> {
        if self.need_back_source.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stream.send(result).await?;
        Ok(())
    }

    /// Tiny tasks carry their whole content in the registration reply:
    /// store it, emit the one terminal progress event and stop. No
    /// scheduler stream is involved.
    async fn store_tiny(self: Arc<Self>) {
        let content = match &self.tiny_content {
            Some(content) => content.clone(),
            None => return,
        };
        if !self.acquire_finish() {
            return;
        }
        let len = content.len() as i64;
        self.content_length.store(len, Ordering::SeqCst);
        self.total_pieces.store(1, Ordering::SeqCst);
        let piece = PieceInfo {
            piece_num: 0,
            range_start: 0,
            range_size: len as u32,
            piece_md5: format!("{:x}", md5::compute(&content)),
            piece_style: PieceStyle::Plain,
        };
        let stored: Result<()> = async {
            self.storage.register_task(&self.task_id, len).await?;
            self.storage.write_piece(&self.task_id, &piece, content).await?;
            {
                let _guard = self.piece_lock.lock().expect("piece lock poisoned");
                self.requested_pieces.set(0);
                self.ready_pieces.set(0);
                self.completed_length.store(len, Ordering::SeqCst);
            }
            self.callback.done(&self).await?;
            Ok(())
        }
        .await;
        let state = match stored {
            Ok(()) => {
                log::info!("tiny task {} stored, {len} bytes", self.task_id);
                ProgressState {
                    success: true,
                    code: Code::Success,
                    msg: "success".to_string(),
                }
            }
            Err(e) => {
                log::error!("store tiny task {} failed: {e}", self.task_id);
                ProgressState {
                    success: false,
                    code: Code::ClientError,
                    msg: e.to_string(),
                }
            }
        };
        self.send_terminal_progress(state).await;
        self.done.cancel();
    }

    /// Small tasks get one known piece with the registration; try it first
    /// and only fall back to the peer-packet machinery when it fails. The
    /// coordinator loop is not running before this point.
    async fn pull_single_piece(self: Arc<Self>) {
        let single = self
            .single_piece
            .clone()
            .expect("single piece dispatch requires a descriptor");
        log::info!(
            "single piece, dest peer id: {}, piece num: {}, size: {}",
            single.dst_pid,
            single.piece_info.piece_num,
            single.piece_info.range_size
        );
        self.content_length
            .store(single.piece_info.range_size as i64, Ordering::SeqCst);
        self.total_pieces.store(1, Ordering::SeqCst);
        if let Err(e) = self.callback.init(&self).await {
            self.set_failed(Code::ClientError, e.to_string());
            self.clean_unfinished().await;
            return;
        }
        self.requested_pieces.set(single.piece_info.piece_num);
        let request = DownloadPieceRequest {
            task_id: self.task_id.clone(),
            dst_pid: single.dst_pid.clone(),
            dst_addr: single.dst_addr.clone(),
            piece: single.piece_info.clone(),
        };
        if self.downloader.download_piece(&self, &request).await {
            log::info!("single piece download success");
        } else {
            log::warn!("single piece download failed, switch to download from other peers");
            tokio::spawn(self.clone().receive_peer_packet());
            self.pull_pieces_from_peers().await;
        }
    }

    /// Coordinator loop: absorbs peer packets from the scheduler stream
    /// into the task and wakes the pull loop. Exits on stream close, an
    /// exit code, back-source escalation or task end.
    async fn receive_peer_packet(self: Arc<Self>) {
        loop {
            let received = tokio::select! {
                received = self.stream.recv() => received,
                _ = self.cancel.cancelled() => {
                    log::info!("context done, stop waiting peer packets");
                    break;
                }
                _ = self.done.cancelled() => {
                    log::info!("peer task done, stop waiting peer packets from scheduler");
                    break;
                }
            };
            let packet = match received {
                Ok(packet) => packet,
                Err(RecvError::EndOfStream) => {
                    log::debug!("peer packet stream closed");
                    break;
                }
                Err(RecvError::Code { code, message }) => {
                    if code == Code::SchedNeedBackSource {
                        log::info!("scheduler asks to download task {} from source", self.task_id);
                        self.need_back_source.store(true, Ordering::SeqCst);
                        self.back_source_signal.cancel();
                        return;
                    }
                    log::error!("receive peer packet failed: {message}");
                    self.set_failed(code, message);
                    self.cancel.cancel();
                    break;
                }
            };

            log::debug!("receive peer packet for peer {}: {packet:?}", self.peer_id);
            if !packet.code.is_success() {
                log::error!("receive peer packet with error: {}", packet.code);
                if packet.code.is_exit_code() {
                    let reason = exit_packet_reason(packet.code);
                    log::error!("{reason}");
                    self.set_failed(packet.code, reason);
                    self.cancel.cancel();
                    break;
                }
                continue;
            }
            if packet.main_peer.is_none() && packet.steal_peers.is_empty() {
                log::warn!("scheduler sent a peer packet with empty peers");
                continue;
            }
            log::info!(
                "receive new peer packet, main peer: {:?}, parallel count: {}",
                packet.main_peer.as_ref().map(|p| p.peer_id.as_str()),
                packet.parallel_count
            );
            self.parallel_count
                .store(packet.parallel_count, Ordering::SeqCst);
            *self.peer_packet.write().expect("peer packet lock poisoned") =
                Some(Arc::new(packet));
            // a signal already pending is just as good as this one
            let _ = self.peer_packet_ready_tx.try_send(());
        }
    }

    /// Pull loop wrapper: whatever way the loop exits, the failed piece
    /// channel closes and the fail path runs (a no-op after `finish`).
    async fn pull_pieces_from_peers(self: Arc<Self>) {
        self.clone().pull_pieces_loop().await;
        self.failed_piece_rx.lock().await.close();
        self.clean_unfinished().await;
    }

    async fn pull_pieces_loop(self: Arc<Self>) {
        match self.wait_first_peer_packet().await {
            ScheduleDecision::Ready(_) => {}
            ScheduleDecision::BackSource => {
                self.clone().back_source().await;
                return;
            }
            ScheduleDecision::Exit => {
                log::error!("task {} wait first peer packet error", self.task_id);
                return;
            }
        }

        let mut num: i32 = 0;
        let mut limit = DEFAULT_PIECE_CHAN_SIZE as u32;
        let mut initialized = false;
        let mut piece_request_tx: Option<Sender<DownloadPieceRequest>> = None;
        // a failed piece picked up but not yet re-dispatched; kept across
        // iterations so a second failure cannot shadow it
        let mut pending_retry: Option<i32> = None;

        loop {
            // 1. exit signals or an already failed piece, then the next batch
            if self.done.is_cancelled() {
                log::info!("peer task done, stop get pieces from peer");
                break;
            }
            if self.cancel.is_cancelled() {
                log::debug!("context done while pulling pieces");
                if !self.peer_task_done.load(Ordering::SeqCst) {
                    self.set_failed(Code::ClientContextCanceled, REASON_CONTEXT_CANCELED);
                }
                break;
            }
            if pending_retry.is_none() {
                if let Ok(failed) = self.failed_piece_rx.lock().await.try_recv() {
                    pending_retry = Some(failed);
                }
            }
            if let Some(failed) = pending_retry {
                log::warn!("download piece {failed} failed, retry");
                num = failed;
                limit = 1;
            }

            // 2. fetch the next batch of piece metadata
            log::debug!("try to get pieces, number: {num}, limit: {limit}");
            let piece_packet = match self.prepare_piece_tasks(num.max(0) as u32, limit).await {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("get piece task error: {e}, wait available peers from scheduler");
                    match self.wait_available_peer_packet().await {
                        ScheduleDecision::Ready(next) => {
                            num = next;
                            limit = DEFAULT_PIECE_CHAN_SIZE as u32;
                            continue;
                        }
                        ScheduleDecision::BackSource => {
                            self.clone().back_source().await;
                            return;
                        }
                        ScheduleDecision::Exit => break,
                    }
                }
            };

            if !initialized {
                initialized = true;
                match self.clone().init_piece_workers(&piece_packet).await {
                    Some(tx) => piece_request_tx = Some(tx),
                    None => break,
                }
            }

            if piece_packet.total_piece > self.total_pieces.load(Ordering::SeqCst) {
                self.total_pieces
                    .store(piece_packet.total_piece, Ordering::SeqCst);
                let _ = self.callback.update(&self).await;
                log::debug!("update total piece count: {}", piece_packet.total_piece);
            }

            // 3. hand the batch to the workers
            let tx = piece_request_tx.as_ref().expect("initialized above");
            self.dispatch_piece_requests(tx, &piece_packet).await;
            pending_retry = None;

            // 4. advance; once everything is requested only failed pieces
            //    are left to chase
            num = self.next_piece_num(num.max(0) as u32);
            if num != -1 {
                limit = DEFAULT_PIECE_CHAN_SIZE as u32;
                continue;
            }
            log::info!("all piece requests sent, just wait failed pieces");
            limit = 1;
            match self.wait_failed_piece().await {
                Some(failed) => pending_retry = Some(failed),
                None => break,
            }
        }
    }

    /// Latches the content length, runs the init callback and spawns the
    /// worker pool. The pool size comes from the first peer packet and is
    /// never resized, even when later packets announce a different count.
    async fn init_piece_workers(
        self: Arc<Self>,
        piece_packet: &PiecePacket,
    ) -> Option<Sender<DownloadPieceRequest>> {
        self.content_length
            .store(piece_packet.content_length, Ordering::SeqCst);
        if let Err(e) = self.callback.init(&self).await {
            log::error!("task {} init callback failed: {e}", self.task_id);
            self.set_failed(Code::ClientError, e.to_string());
            return None;
        }
        let parallel = self.parallel_count.load(Ordering::SeqCst).max(1);
        let (tx, rx) = mpsc::channel(DEFAULT_PIECE_CHAN_SIZE);
        let rx = Arc::new(AsyncMutex::new(rx));
        log::debug!("starting {parallel} piece download workers");
        for id in 0..parallel {
            tokio::spawn(self.clone().download_piece_worker(id, rx.clone()));
        }
        Some(tx)
    }

    async fn download_piece_worker(
        self: Arc<Self>,
        id: i32,
        requests: Arc<AsyncMutex<Receiver<DownloadPieceRequest>>>,
    ) {
        loop {
            let request = tokio::select! {
                request = async { requests.lock().await.recv().await } => match request {
                    Some(request) => request,
                    None => {
                        log::debug!("piece request channel closed, worker #{id} exit");
                        return;
                    }
                },
                _ = self.done.cancelled() => {
                    log::debug!("peer task done, worker #{id} exit");
                    return;
                }
                _ = self.cancel.cancelled() => {
                    log::debug!("peer task context done, worker #{id} exit");
                    return;
                }
            };
            if self.ready_pieces.is_set(request.piece.piece_num) {
                log::debug!("piece {} is already downloaded, skip", request.piece.piece_num);
                continue;
            }
            if let Some(limiter) = &self.limiter {
                if let Err(e) = limiter
                    .wait_n(request.piece.range_size as u64, &self.cancel)
                    .await
                {
                    log::error!("request limiter error: {e}");
                    let result = PieceResult {
                        task_id: self.task_id.clone(),
                        src_pid: self.peer_id.clone(),
                        dst_pid: request.dst_pid.clone(),
                        piece_num: request.piece.piece_num as i32,
                        success: false,
                        code: Code::ClientRequestLimitFail,
                        finished_count: 0,
                    };
                    let _ = self
                        .report_piece_result(PieceTaskResult {
                            piece: request.piece.clone(),
                            result,
                        })
                        .await;
                    self.set_failed(Code::ClientRequestLimitFail, e.to_string());
                    self.cancel.cancel();
                    return;
                }
            }
            log::debug!(
                "worker #{id} receive piece task, dest peer id: {}, piece num: {}, range start: {}, range size: {}",
                request.dst_pid,
                request.piece.piece_num,
                request.piece.range_start,
                request.piece.range_size
            );
            // download_piece reports the result to the task itself
            let success = self.downloader.download_piece(&self, &request).await;
            if !success {
                log::debug!("worker #{id} piece {} attempt failed", request.piece.piece_num);
            }
        }
    }

    async fn wait_first_peer_packet(&self) -> ScheduleDecision {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                log::error!("context done while waiting first peer packet");
                self.set_failed(Code::ClientContextCanceled, REASON_CONTEXT_CANCELED);
                ScheduleDecision::Exit
            }
            received = async { self.peer_packet_ready_rx.lock().await.recv().await } => {
                match received {
                    Some(()) => {
                        log::info!(
                            "new peer client ready, scheduler time cost: {}ms, main peer: {:?}",
                            self.callback.start_time().elapsed().as_millis(),
                            self.peer_packet_snapshot()
                                .and_then(|p| p.main_peer.as_ref().map(|m| m.peer_id.clone()))
                        );
                        ScheduleDecision::Ready(0)
                    }
                    None => ScheduleDecision::Exit,
                }
            }
            _ = self.back_source_signal.cancelled() => self.schedule_back_source(REASON_BACK_SOURCE),
            _ = tokio::time::sleep(self.scheduler_options.schedule_timeout) => {
                self.schedule_back_source(REASON_SCHEDULE_TIMEOUT)
            }
        }
    }

    async fn wait_available_peer_packet(&self) -> ScheduleDecision {
        tokio::select! {
            _ = self.done.cancelled() => {
                log::info!("peer task done, stop get pieces from peer");
                ScheduleDecision::Exit
            }
            _ = self.cancel.cancelled() => {
                log::debug!("context done while waiting available peer packet");
                if !self.peer_task_done.load(Ordering::SeqCst) {
                    self.set_failed(Code::ClientContextCanceled, REASON_CONTEXT_CANCELED);
                }
                ScheduleDecision::Exit
            }
            received = async { self.peer_packet_ready_rx.lock().await.recv().await } => {
                match received {
                    Some(()) => {
                        log::info!(
                            "new peer client ready, main peer: {:?}",
                            self.peer_packet_snapshot()
                                .and_then(|p| p.main_peer.as_ref().map(|m| m.peer_id.clone()))
                        );
                        // research from piece 0
                        ScheduleDecision::Ready(self.next_piece_num(0))
                    }
                    None => ScheduleDecision::Exit,
                }
            }
            _ = self.back_source_signal.cancelled() => self.schedule_back_source(REASON_BACK_SOURCE),
            _ = tokio::time::sleep(self.scheduler_options.schedule_timeout) => {
                self.schedule_back_source(REASON_RESCHEDULE_TIMEOUT)
            }
        }
    }

    fn schedule_back_source(&self, reason: &str) -> ScheduleDecision {
        if self.scheduler_options.disable_auto_back_source {
            log::error!("{reason}, auto back source disabled");
            self.set_failed(Code::ClientScheduleTimeout, reason);
            return ScheduleDecision::Exit;
        }
        log::error!("start download from source due to: {reason}");
        self.need_back_source.store(true, Ordering::SeqCst);
        ScheduleDecision::BackSource
    }

    async fn wait_failed_piece(&self) -> Option<i32> {
        if self.is_completed() {
            return None;
        }
        tokio::select! {
            _ = self.done.cancelled() => {
                log::info!("peer task done, stop wait failed pieces");
                None
            }
            _ = self.cancel.cancelled() => {
                if !self.peer_task_done.load(Ordering::SeqCst) {
                    self.set_failed(Code::ClientContextCanceled, REASON_CONTEXT_CANCELED);
                    log::error!("context done, progress is not done");
                } else {
                    log::debug!("context done, progress is already done");
                }
                None
            }
            failed = async { self.failed_piece_rx.lock().await.recv().await } => {
                match failed {
                    Some(failed) => {
                        log::warn!("download piece {failed} failed, retry");
                        Some(failed)
                    }
                    None => None,
                }
            }
        }
    }

    async fn dispatch_piece_requests(
        &self,
        tx: &Sender<DownloadPieceRequest>,
        piece_packet: &PiecePacket,
    ) {
        for piece in &piece_packet.piece_infos {
            log::info!(
                "get piece {} from {}/{}",
                piece.piece_num,
                piece_packet.dst_addr,
                piece_packet.dst_pid
            );
            if !self.requested_pieces.is_set(piece.piece_num) {
                self.requested_pieces.set(piece.piece_num);
            }
            if self.ready_pieces.is_set(piece.piece_num) {
                continue;
            }
            let request = DownloadPieceRequest {
                task_id: self.task_id.clone(),
                dst_pid: piece_packet.dst_pid.clone(),
                dst_addr: piece_packet.dst_addr.clone(),
                piece: piece.clone(),
            };
            tokio::select! {
                sent = tx.send(request) => {
                    if sent.is_err() {
                        log::warn!("piece request channel closed while dispatching");
                        return;
                    }
                }
                _ = self.done.cancelled() => {
                    log::warn!("peer task done, but still some piece request not processed");
                }
                _ = self.cancel.cancelled() => {
                    log::warn!("context done while dispatching piece requests");
                    if !self.peer_task_done.load(Ordering::SeqCst) {
                        self.set_failed(Code::ClientContextCanceled, REASON_CONTEXT_CANCELED);
                    }
                }
            }
        }
    }

    /// Gets the next batch of piece descriptors from the currently
    /// preferred peer: main first, then each steal peer in order. A peer
    /// packet replaced mid-attempt restarts selection from the new packet.
    async fn prepare_piece_tasks(&self, start_num: u32, limit: u32) -> Result<PiecePacket> {
        'prepare: loop {
            let packet = self
                .peer_packet_snapshot()
                .ok_or_else(|| anyhow!("no peer packet available"))?;
            self.parallel_count
                .store(packet.parallel_count, Ordering::SeqCst);
            let main_peer = packet
                .main_peer
                .clone()
                .ok_or_else(|| anyhow!("peer packet without main peer"))?;

            let mut last_err = anyhow!("no pieces from any peer");
            match self
                .prepare_piece_tasks_by_peer(&packet, &main_peer, start_num, limit)
                .await
            {
                Ok(piece_packet) => return Ok(piece_packet),
                Err(e) => {
                    if e.downcast_ref::<PeerPacketChanged>().is_some() {
                        continue 'prepare;
                    }
                    last_err = e;
                }
            }
            for peer in &packet.steal_peers {
                match self
                    .prepare_piece_tasks_by_peer(&packet, peer, start_num, limit)
                    .await
                {
                    Ok(piece_packet) => return Ok(piece_packet),
                    Err(e) => {
                        if e.downcast_ref::<PeerPacketChanged>().is_some() {
                            continue 'prepare;
                        }
                        last_err = e;
                    }
                }
            }
            return Err(last_err);
        }
    }

    async fn prepare_piece_tasks_by_peer(
        &self,
        cur_packet: &Arc<PeerPacket>,
        peer: &DestPeer,
        start_num: u32,
        limit: u32,
    ) -> Result<PiecePacket> {
        loop {
            log::debug!(
                "get piece task from peer {}, piece num: {start_num}, limit: {limit}",
                peer.peer_id
            );
            match self.get_piece_tasks(cur_packet, peer, start_num, limit).await {
                Ok(piece_packet) => {
                    log::info!(
                        "get piece task from peer {} ok, pieces length: {}",
                        peer.peer_id,
                        piece_packet.piece_infos.len()
                    );
                    return Ok(piece_packet);
                }
                Err(e) => {
                    if e.downcast_ref::<PeerPacketChanged>().is_some() {
                        return Err(e);
                    }
                    if self.cancel.is_cancelled() {
                        log::warn!("get piece task from peer {} canceled", peer.peer_id);
                        return Err(e);
                    }
                    let code = match e.downcast_ref::<RemoteCode>() {
                        Some(RemoteCode(code)) => *code,
                        None => Code::ClientPieceRequestFail,
                    };
                    log::error!(
                        "get piece task from peer {} error: {e}, code: {code}",
                        peer.peer_id
                    );
                    let result = PieceResult {
                        task_id: self.task_id.clone(),
                        src_pid: self.peer_id.clone(),
                        dst_pid: peer.peer_id.clone(),
                        piece_num: 0,
                        success: false,
                        code,
                        finished_count: -1,
                    };
                    if let Err(send_err) = self.send_piece_result(result).await {
                        log::error!("send piece result error: {send_err}");
                    }
                    if code == Code::CdnTaskNotFound && !self.peer_packet_changed(cur_packet) {
                        // the seed peer is still loading the task
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Metadata RPC with bounded retry. Only an empty batch retries; a
    /// transport error aborts to the next peer, a replaced peer packet
    /// aborts the whole selection round.
    async fn get_piece_tasks(
        &self,
        cur_packet: &Arc<PeerPacket>,
        peer: &DestPeer,
        start_num: u32,
        limit: u32,
    ) -> Result<PiecePacket> {
        let addr = peer.addr();
        let request = PieceTaskRequest {
            task_id: self.task_id.clone(),
            src_pid: self.peer_id.clone(),
            dst_pid: peer.peer_id.clone(),
            start_num,
            limit,
        };
        retry::run(
            &self.cancel,
            GET_PIECE_RETRY_INIT,
            GET_PIECE_RETRY_MAX,
            GET_PIECE_RETRY_ATTEMPTS,
            || {
                let addr = addr.clone();
                let request = request.clone();
                async move {
                    match self.downloader.get_piece_tasks(&addr, &request).await {
                        Err(e) => {
                            if self.peer_packet_changed(cur_packet) {
                                log::warn!(
                                    "get piece tasks with error: {e}, but peer packet changed, switch to new peer packet"
                                );
                                return Attempt::Abort(PeerPacketChanged.into());
                            }
                            Attempt::Abort(e)
                        }
                        Ok(piece_packet) if piece_packet.piece_infos.is_empty() => {
                            let result = PieceResult {
                                task_id: self.task_id.clone(),
                                src_pid: self.peer_id.clone(),
                                dst_pid: request.dst_pid.clone(),
                                piece_num: 0,
                                success: false,
                                code: Code::ClientWaitPieceReady,
                                finished_count: self.ready_pieces.settled(),
                            };
                            if let Err(e) = self.send_piece_result(result).await {
                                log::error!("send piece result error: {e}");
                            }
                            if self.peer_packet_changed(cur_packet) {
                                log::warn!(
                                    "get empty pieces and peer packet changed, switch to new peer packet"
                                );
                                return Attempt::Abort(PeerPacketChanged.into());
                            }
                            log::info!(
                                "peer {} returns success but with empty pieces, retry later",
                                request.dst_pid
                            );
                            Attempt::Retry(anyhow!("empty pieces"))
                        }
                        Ok(piece_packet) => Attempt::Done(piece_packet),
                    }
                }
            },
        )
        .await
    }

    fn next_piece_num(&self, cur: u32) -> i32 {
        if self.is_completed() {
            return -1;
        }
        let mut i = cur;
        while self.requested_pieces.is_set(i) {
            i += 1;
        }
        let total = self.total_pieces.load(Ordering::SeqCst);
        if total > 0 && i >= total as u32 {
            // double check from zero, the cursor may have skipped holes
            i = 0;
            while self.requested_pieces.is_set(i) {
                i += 1;
            }
            if i >= total as u32 {
                return -1;
            }
        }
        i as i32
    }

    /// Books the outcome of one piece attempt. Failures go to the failed
    /// piece channel for retry and never touch the bitmaps; a success sets
    /// the ready bit and the completed length together, reports upstream
    /// and emits a progress event. The last piece triggers `finish`.
    pub async fn report_piece_result(&self, result: PieceTaskResult) -> Result<()> {
        let PieceTaskResult {
            piece,
            result: mut piece_result,
        } = result;
        log::debug!(
            "report piece {} result, success: {}",
            piece.piece_num,
            piece_result.success
        );

        if !piece_result.success {
            piece_result.finished_count = self.ready_pieces.settled();
            let piece_num = piece_result.piece_num;
            if let Err(e) = self.send_piece_result(piece_result).await {
                log::error!("send piece result error: {e}");
            }
            let _ = self.failed_piece_tx.send(piece_num).await;
            log::error!("piece {} download failed, retry later", piece.piece_num);
            return Ok(());
        }

        {
            let _guard = self.piece_lock.lock().expect("piece lock poisoned");
            if self.ready_pieces.is_set(piece.piece_num) {
                log::warn!("piece {} is already reported, skipped", piece.piece_num);
                return Ok(());
            }
            self.requested_pieces.set(piece.piece_num);
            self.ready_pieces.set(piece.piece_num);
            self.completed_length
                .fetch_add(piece.range_size as i64, Ordering::SeqCst);
        }

        piece_result.finished_count = self.ready_pieces.settled();
        if let Err(e) = self.send_piece_result(piece_result).await {
            log::error!("send piece result error: {e}");
        }

        let event = ProgressEvent {
            state: ProgressState {
                success: true,
                code: Code::Success,
                msg: "downloading".to_string(),
            },
            task_id: self.task_id.clone(),
            peer_id: self.peer_id.clone(),
            content_length: self.content_length.load(Ordering::SeqCst),
            completed_length: self.completed_length.load(Ordering::SeqCst),
            done: false,
            done_ack: None,
        };
        tokio::select! {
            biased;
            _ = self.progress_stop.cancelled() => {}
            sent = self.progress_tx.send(event) => {
                if sent.is_ok() {
                    log::debug!(
                        "progress sent, {}/{}",
                        self.completed_length.load(Ordering::SeqCst),
                        self.content_length.load(Ordering::SeqCst)
                    );
                }
            }
            _ = self.cancel.cancelled() => {
                log::warn!("send progress failed, peer task context done");
                return Err(anyhow!("context canceled"));
            }
        }

        if !self.is_completed() {
            return Ok(());
        }
        self.finish().await
    }

    /// Origin fallback: the downloader fills storage piece-by-piece and the
    /// task completes through the same finish path.
    async fn back_source(self: Arc<Self>) {
        match self.downloader.download_source(&self, &self.request).await {
            Err(e) => {
                log::error!("download from source error: {e}");
                self.set_failed(Code::UnknownError, e.to_string());
            }
            Ok(()) => {
                log::info!("download from source ok");
                let _ = self.finish().await;
            }
        }
        self.clean_unfinished().await;
    }

    /// Successful terminal transition: end-of-piece sentinel upstream, the
    /// done callback (storage to destination), the terminal progress event.
    /// One-shot together with `clean_unfinished`.
    async fn finish(&self) -> Result<()> {
        if !self.acquire_finish() {
            return Ok(());
        }
        if let Err(e) = self
            .send_piece_result(PieceResult::end_of_piece(
                &self.task_id,
                &self.peer_id,
                self.ready_pieces.settled(),
            ))
            .await
        {
            log::error!("send end piece result error: {e}");
        }
        log::debug!("finish end piece result sent");

        let mut state = ProgressState {
            success: true,
            code: Code::Success,
            msg: "success".to_string(),
        };
        let mut done_err = None;
        if let Err(e) = self.callback.done(self).await {
            log::error!("peer task done callback failed: {e}");
            state = ProgressState {
                success: false,
                code: Code::ClientError,
                msg: e.to_string(),
            };
            done_err = Some(e);
        }
        log::info!(
            "try to send finish progress, completed length: {}, success: {}",
            self.completed_length.load(Ordering::SeqCst),
            state.success
        );
        self.send_terminal_progress(state).await;
        log::debug!("finished: close done channel");
        self.done.cancel();
        match done_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Failed terminal transition, one-shot together with `finish`. Always
    /// leaves the task context cancelled.
    async fn clean_unfinished(&self) {
        if self.acquire_finish() {
            if let Err(e) = self
                .send_piece_result(PieceResult::end_of_piece(
                    &self.task_id,
                    &self.peer_id,
                    self.ready_pieces.settled(),
                ))
                .await
            {
                log::error!("send end piece result error: {e}");
            }
            log::debug!("clean up end piece result sent");

            let (code, reason) = self.failed_snapshot();
            log::info!(
                "try to send unfinished progress, completed length: {}, code: {code}, reason: {reason}",
                self.completed_length.load(Ordering::SeqCst)
            );
            self.send_terminal_progress(ProgressState {
                success: false,
                code,
                msg: reason.clone(),
            })
            .await;
            if let Err(e) = self.callback.fail(self, code, &reason).await {
                log::error!("peer task fail callback failed: {e}");
            }
            log::debug!("clean unfinished: close done channel");
            self.done.cancel();
        }
        self.cancel.cancel();
    }

    async fn send_terminal_progress(&self, state: ProgressState) {
        let event = ProgressEvent {
            state,
            task_id: self.task_id.clone(),
            peer_id: self.peer_id.clone(),
            content_length: self.content_length.load(Ordering::SeqCst),
            completed_length: self.completed_length.load(Ordering::SeqCst),
            done: true,
            done_ack: Some(DoneAck::new(
                self.peer_task_done.clone(),
                self.progress_stop.clone(),
            )),
        };
        let sent = tokio::select! {
            biased;
            sent = self.progress_tx.send(event) => {
                match sent {
                    Ok(()) => {
                        log::info!("terminal progress sent");
                        true
                    }
                    Err(_) => {
                        log::warn!("terminal progress dropped, receiver gone");
                        false
                    }
                }
            }
            _ = self.cancel.cancelled() => {
                log::warn!("terminal progress not sent, context done");
                false
            }
        };
        if !sent {
            return;
        }
        // wait for the initiator to acknowledge
        tokio::select! {
            _ = self.progress_stop.cancelled() => log::debug!("progress stopped"),
            _ = self.cancel.cancelled() => {
                if self.peer_task_done.load(Ordering::SeqCst) {
                    log::debug!("progress stopped and context done");
                } else {
                    log::warn!("wait progress stopped failed, context done, but progress not stopped");
                }
            }
        }
    }
}

fn exit_packet_reason(code: Code) -> String {
    match code {
        Code::SchedPeerGone => REASON_PEER_GONE.to_string(),
        _ => format!("receive exit peer packet with code {code}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::timeout;

    use super::*;
    use crate::scheduler::{PacketEvent, PeerHost, RegisterResult, UrlMeta};
    use crate::storage::MemoryPieceStorage;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_request() -> TaskRequest {
        TaskRequest {
            url: "http://origin.test/blob".to_string(),
            url_meta: UrlMeta::default(),
            peer_id: "peer-src".to_string(),
            peer_host: PeerHost {
                uuid: "uuid-1".to_string(),
                ip: "127.0.0.1".to_string(),
                rpc_port: 65000,
                down_port: 65002,
                hostname: "test-host".to_string(),
                security_domain: String::new(),
                location: String::new(),
                idc: String::new(),
                net_topology: String::new(),
            },
        }
    }

    fn test_pieces(count: u32, size: u32) -> Vec<PieceInfo> {
        (0..count)
            .map(|piece_num| PieceInfo {
                piece_num,
                range_start: piece_num as u64 * size as u64,
                range_size: size,
                piece_md5: String::new(),
                piece_style: PieceStyle::Plain,
            })
            .collect()
    }

    fn dest_peer(peer_id: &str, ip: &str) -> DestPeer {
        DestPeer {
            peer_id: peer_id.to_string(),
            ip: ip.to_string(),
            down_port: 65002,
        }
    }

    fn peer_packet(main: Option<DestPeer>, steal: Vec<DestPeer>, parallel: i32, code: Code) -> PeerPacket {
        PeerPacket {
            task_id: "task-1".to_string(),
            src_pid: "peer-src".to_string(),
            parallel_count: parallel,
            main_peer: main,
            steal_peers: steal,
            code,
        }
    }

    struct StreamHandles {
        packet_tx: Sender<PacketEvent>,
        result_rx: Receiver<PieceResult>,
    }

    struct MockScheduler {
        register: StdMutex<Option<RegisterResult>>,
        handles: StdMutex<Option<StreamHandles>>,
    }

    impl MockScheduler {
        fn new(register: Option<RegisterResult>) -> Arc<Self> {
            Arc::new(MockScheduler {
                register: StdMutex::new(register),
                handles: StdMutex::new(None),
            })
        }

        fn take_handles(&self) -> Option<StreamHandles> {
            self.handles.lock().unwrap().take()
        }
    }

    #[async_trait]
    impl SchedulerClient for MockScheduler {
        async fn register_peer_task(&self, _request: &TaskRequest) -> Result<RegisterResult> {
            match self.register.lock().unwrap().clone() {
                Some(result) => Ok(result),
                None => Err(anyhow!("scheduler unreachable")),
            }
        }

        async fn report_piece_result(
            &self,
            _task_id: &str,
            _request: &TaskRequest,
        ) -> Result<PeerPacketStream> {
            let (result_tx, result_rx) = mpsc::channel(64);
            let (packet_tx, packet_rx) = mpsc::channel(16);
            *self.handles.lock().unwrap() = Some(StreamHandles {
                packet_tx,
                result_rx,
            });
            Ok(PeerPacketStream::real(result_tx, packet_rx))
        }
    }

    #[derive(Default, Clone)]
    struct PeerScript {
        pieces: Vec<PieceInfo>,
        total_piece: i32,
        content_length: i64,
        /// serve at most this many descriptors per batch
        serve_limit: Option<usize>,
        /// fail every call after this many
        fail_after_calls: Option<usize>,
    }

    #[derive(Default)]
    struct MockDownloader {
        peers: StdMutex<HashMap<String, PeerScript>>,
        calls: StdMutex<HashMap<String, usize>>,
        fail_pieces_once: StdMutex<HashSet<u32>>,
        source_len: u64,
        source_piece_size: u32,
    }

    impl MockDownloader {
        fn with_peers(peers: Vec<(&str, PeerScript)>) -> Arc<Self> {
            Arc::new(MockDownloader {
                peers: StdMutex::new(
                    peers
                        .into_iter()
                        .map(|(addr, script)| (addr.to_string(), script))
                        .collect(),
                ),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl PieceDownloader for MockDownloader {
        async fn get_piece_tasks(
            &self,
            addr: &str,
            request: &PieceTaskRequest,
        ) -> Result<PiecePacket> {
            let count = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(addr.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            let script = self
                .peers
                .lock()
                .unwrap()
                .get(addr)
                .cloned()
                .ok_or_else(|| anyhow!("unknown peer {addr}"))?;
            if let Some(max) = script.fail_after_calls {
                if count > max {
                    bail!("peer {addr} gone");
                }
            }
            let mut piece_infos: Vec<PieceInfo> = script
                .pieces
                .iter()
                .filter(|p| p.piece_num >= request.start_num)
                .take(request.limit as usize)
                .cloned()
                .collect();
            if let Some(cap) = script.serve_limit {
                piece_infos.truncate(cap);
            }
            Ok(PiecePacket {
                task_id: request.task_id.clone(),
                dst_pid: request.dst_pid.clone(),
                dst_addr: addr.to_string(),
                piece_infos,
                total_piece: script.total_piece,
                content_length: script.content_length,
                piece_md5_sign: String::new(),
            })
        }

        async fn download_piece(&self, task: &PeerTask, request: &DownloadPieceRequest) -> bool {
            let fail = self
                .fail_pieces_once
                .lock()
                .unwrap()
                .remove(&request.piece.piece_num);
            if !fail {
                task.add_traffic(request.piece.range_size as i64);
            }
            let result = PieceResult {
                task_id: task.task_id().to_string(),
                src_pid: task.peer_id().to_string(),
                dst_pid: request.dst_pid.clone(),
                piece_num: request.piece.piece_num as i32,
                success: !fail,
                code: if fail {
                    Code::ClientPieceDownloadFail
                } else {
                    Code::Success
                },
                finished_count: 0,
            };
            let _ = task
                .report_piece_result(PieceTaskResult {
                    piece: request.piece.clone(),
                    result,
                })
                .await;
            !fail
        }

        async fn download_source(&self, task: &PeerTask, _request: &TaskRequest) -> Result<()> {
            let mut piece_num = 0u32;
            let mut offset = 0u64;
            while offset < self.source_len {
                let len = (self.source_piece_size as u64).min(self.source_len - offset) as u32;
                let piece = PieceInfo {
                    piece_num,
                    range_start: offset,
                    range_size: len,
                    piece_md5: String::new(),
                    piece_style: PieceStyle::Plain,
                };
                let result = PieceResult {
                    task_id: task.task_id().to_string(),
                    src_pid: task.peer_id().to_string(),
                    dst_pid: String::new(),
                    piece_num: piece_num as i32,
                    success: true,
                    code: Code::Success,
                    finished_count: 0,
                };
                task.add_traffic(len as i64);
                let _ = task
                    .report_piece_result(PieceTaskResult { piece, result })
                    .await;
                offset += len as u64;
                piece_num += 1;
            }
            task.set_total_pieces(piece_num as i32);
            task.set_content_length(offset as i64).await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestCallback {
        inits: AtomicUsize,
        updates: AtomicUsize,
        dones: AtomicUsize,
        fails: StdMutex<Option<(Code, String)>>,
    }

    struct TestCallbackWithStart {
        start: Instant,
        counters: Arc<TestCallback>,
    }

    impl TestCallbackWithStart {
        fn new() -> (Arc<Self>, Arc<TestCallback>) {
            let counters = Arc::new(TestCallback::default());
            (
                Arc::new(TestCallbackWithStart {
                    start: Instant::now(),
                    counters: counters.clone(),
                }),
                counters,
            )
        }
    }

    #[async_trait]
    impl TaskCallback for TestCallbackWithStart {
        async fn init(&self, _task: &PeerTask) -> Result<()> {
            self.counters.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update(&self, _task: &PeerTask) -> Result<()> {
            self.counters.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn done(&self, _task: &PeerTask) -> Result<()> {
            self.counters.dones.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fail(&self, _task: &PeerTask, code: Code, reason: &str) -> Result<()> {
            *self.counters.fails.lock().unwrap() = Some((code, reason.to_string()));
            Ok(())
        }

        fn start_time(&self) -> Instant {
            self.start
        }
    }

    async fn build_task(
        scheduler: Arc<MockScheduler>,
        downloader: Arc<MockDownloader>,
        options: SchedulerOptions,
    ) -> (
        Arc<PeerTask>,
        Receiver<ProgressEvent>,
        Arc<TestCallback>,
    ) {
        let (callback, counters) = TestCallbackWithStart::new();
        let (task, progress) = PeerTask::new(
            test_request(),
            scheduler,
            downloader,
            Arc::new(MemoryPieceStorage::new()),
            callback,
            options,
            None,
        )
        .await
        .unwrap();
        (task, progress, counters)
    }

    /// Reads progress until the terminal event, returning the non-terminal
    /// count and the terminal event itself.
    async fn drain_progress(progress: &mut Receiver<ProgressEvent>) -> (usize, ProgressEvent) {
        let mut non_terminal = 0;
        loop {
            let event = timeout(WAIT, progress.recv())
                .await
                .expect("progress timed out")
                .expect("progress channel closed before terminal event");
            if event.done {
                return (non_terminal, event);
            }
            non_terminal += 1;
        }
    }

    fn collect_results(result_rx: &mut Receiver<PieceResult>) -> Vec<PieceResult> {
        let mut results = Vec::new();
        while let Ok(result) = result_rx.try_recv() {
            results.push(result);
        }
        results
    }

    fn strict_options() -> SchedulerOptions {
        SchedulerOptions {
            schedule_timeout: Duration::from_secs(3),
            disable_auto_back_source: true,
        }
    }

    #[tokio::test]
    async fn test_tiny_task_stores_inline_content() {
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Tiny,
            direct_piece: DirectPiece::Content(Bytes::from_static(b"HELLO")),
        }));
        let downloader = MockDownloader::with_peers(Vec::new());
        let (task, mut progress, counters) =
            build_task(scheduler.clone(), downloader, strict_options()).await;
        task.start();

        let (non_terminal, terminal) = drain_progress(&mut progress).await;
        assert_eq!(non_terminal, 0);
        assert!(terminal.state.success);
        assert_eq!(terminal.content_length, 5);
        assert_eq!(terminal.completed_length, 5);
        terminal.done_ack.unwrap().ack();

        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();
        // tiny never opens the scheduler stream
        assert!(scheduler.take_handles().is_none());
        assert_eq!(counters.dones.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_small_task_single_piece_success() {
        let piece = test_pieces(1, 1024).remove(0);
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Small,
            direct_piece: DirectPiece::Single(SinglePiece {
                dst_pid: "peer-1".to_string(),
                dst_addr: "10.0.0.1:65002".to_string(),
                piece_info: piece,
            }),
        }));
        let downloader = MockDownloader::with_peers(Vec::new());
        let (task, mut progress, counters) =
            build_task(scheduler.clone(), downloader, strict_options()).await;
        task.start();

        let (_, terminal) = drain_progress(&mut progress).await;
        assert!(terminal.state.success);
        assert_eq!(terminal.content_length, 1024);
        assert_eq!(terminal.completed_length, 1024);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();

        let mut handles = scheduler.take_handles().unwrap();
        let results = collect_results(&mut handles.result_rx);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].piece_num, 0);
        assert!(results[0].success);
        assert_eq!(results[0].finished_count, 1);
        assert_eq!(results[1].piece_num, crate::scheduler::END_OF_PIECE);
        assert_eq!(results[1].finished_count, 1);
        assert_eq!(counters.dones.load(Ordering::SeqCst), 1);
        assert_eq!(task.traffic(), 1024);
    }

    #[tokio::test]
    async fn test_small_task_falls_back_to_normal_on_failure() {
        let piece = test_pieces(1, 1024).remove(0);
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Small,
            direct_piece: DirectPiece::Single(SinglePiece {
                dst_pid: "peer-1".to_string(),
                dst_addr: "10.0.0.1:65002".to_string(),
                piece_info: piece,
            }),
        }));
        let downloader = MockDownloader::with_peers(vec![(
            "10.0.0.1:65002",
            PeerScript {
                pieces: test_pieces(1, 1024),
                total_piece: 1,
                content_length: 1024,
                ..Default::default()
            },
        )]);
        // the single-piece shortcut fails once, the retry goes through the
        // peer packet machinery
        downloader.fail_pieces_once.lock().unwrap().insert(0);
        let (task, mut progress, _counters) =
            build_task(scheduler.clone(), downloader, strict_options()).await;
        task.start();

        let handles = scheduler.take_handles().unwrap();
        handles
            .packet_tx
            .send(PacketEvent::Packet(peer_packet(
                Some(dest_peer("peer-1", "10.0.0.1")),
                Vec::new(),
                1,
                Code::Success,
            )))
            .await
            .unwrap();

        let (_, terminal) = drain_progress(&mut progress).await;
        assert!(terminal.state.success);
        assert_eq!(terminal.completed_length, 1024);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();
        assert_eq!(task.ready_piece_count(), 1);
    }

    #[tokio::test]
    async fn test_normal_task_four_pieces_two_workers() {
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Normal,
            direct_piece: DirectPiece::None,
        }));
        let downloader = MockDownloader::with_peers(vec![(
            "10.0.0.1:65002",
            PeerScript {
                pieces: test_pieces(4, 1024),
                total_piece: 4,
                content_length: 4096,
                ..Default::default()
            },
        )]);
        let (task, mut progress, counters) =
            build_task(scheduler.clone(), downloader, strict_options()).await;
        task.start();

        let mut handles = scheduler.take_handles().unwrap();
        handles
            .packet_tx
            .send(PacketEvent::Packet(peer_packet(
                Some(dest_peer("peer-1", "10.0.0.1")),
                Vec::new(),
                2,
                Code::Success,
            )))
            .await
            .unwrap();

        let (non_terminal, terminal) = drain_progress(&mut progress).await;
        assert_eq!(non_terminal, 4);
        assert!(terminal.state.success);
        assert_eq!(terminal.completed_length, 4096);
        assert_eq!(terminal.content_length, 4096);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();

        assert_eq!(task.ready_piece_count(), 4);
        assert_eq!(task.total_pieces(), 4);
        assert!(counters.updates.load(Ordering::SeqCst) >= 1);
        assert_eq!(counters.inits.load(Ordering::SeqCst), 1);

        let results = collect_results(&mut handles.result_rx);
        let successes: Vec<&PieceResult> =
            results.iter().filter(|r| r.success && r.piece_num >= 0).collect();
        let nums: HashSet<i32> = successes.iter().map(|r| r.piece_num).collect();
        assert_eq!(nums, HashSet::from([0, 1, 2, 3]));
        // at most one success per piece, finished count equals the ready
        // count at send time
        assert_eq!(successes.len(), 4);
        for result in &successes {
            assert!(result.finished_count >= 1 && result.finished_count <= 4);
        }
        let sentinel = results
            .iter()
            .find(|r| r.piece_num == crate::scheduler::END_OF_PIECE)
            .expect("end sentinel reported");
        assert_eq!(sentinel.finished_count, 4);
    }

    #[tokio::test]
    async fn test_peer_churn_switches_to_new_main_peer() {
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Normal,
            direct_piece: DirectPiece::None,
        }));
        let downloader = MockDownloader::with_peers(vec![
            (
                "10.0.0.1:65002",
                PeerScript {
                    pieces: test_pieces(4, 1024),
                    total_piece: 4,
                    content_length: 4096,
                    serve_limit: Some(2),
                    fail_after_calls: Some(1),
                },
            ),
            (
                "10.0.0.2:65002",
                PeerScript {
                    pieces: test_pieces(4, 1024),
                    total_piece: 4,
                    content_length: 4096,
                    ..Default::default()
                },
            ),
        ]);
        let (task, mut progress, _counters) =
            build_task(scheduler.clone(), downloader, strict_options()).await;
        task.start();

        let mut handles = scheduler.take_handles().unwrap();
        handles
            .packet_tx
            .send(PacketEvent::Packet(peer_packet(
                Some(dest_peer("peer-1", "10.0.0.1")),
                Vec::new(),
                1,
                Code::Success,
            )))
            .await
            .unwrap();

        // the first two pieces come from the first main peer
        let mut seen = 0;
        while seen < 2 {
            let event = timeout(WAIT, progress.recv()).await.unwrap().unwrap();
            assert!(!event.done);
            seen += 1;
        }

        // replace the main peer; the first one errors from now on
        handles
            .packet_tx
            .send(PacketEvent::Packet(peer_packet(
                Some(dest_peer("peer-2", "10.0.0.2")),
                vec![dest_peer("peer-1", "10.0.0.1")],
                1,
                Code::Success,
            )))
            .await
            .unwrap();

        let (_, terminal) = drain_progress(&mut progress).await;
        assert!(terminal.state.success);
        assert_eq!(terminal.completed_length, 4096);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();
        assert_eq!(task.ready_piece_count(), 4);
    }

    #[tokio::test]
    async fn test_back_source_on_schedule_timeout() {
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Normal,
            direct_piece: DirectPiece::None,
        }));
        let downloader = Arc::new(MockDownloader {
            source_len: 2048,
            source_piece_size: 1024,
            ..Default::default()
        });
        let options = SchedulerOptions {
            schedule_timeout: Duration::from_millis(200),
            disable_auto_back_source: false,
        };
        let (task, mut progress, counters) =
            build_task(scheduler.clone(), downloader, options).await;
        task.start();

        let (non_terminal, terminal) = drain_progress(&mut progress).await;
        assert_eq!(non_terminal, 2);
        assert!(terminal.state.success);
        assert_eq!(terminal.completed_length, 2048);
        assert_eq!(terminal.content_length, 2048);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();

        // nothing reaches the scheduler once the task went back to source
        let mut handles = scheduler.take_handles().unwrap();
        assert_matches!(handles.result_rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(counters.dones.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_scheduler_code_fails_task() {
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Normal,
            direct_piece: DirectPiece::None,
        }));
        let downloader = MockDownloader::with_peers(Vec::new());
        let (task, mut progress, counters) =
            build_task(scheduler.clone(), downloader, strict_options()).await;
        task.start();

        let handles = scheduler.take_handles().unwrap();
        handles
            .packet_tx
            .send(PacketEvent::Packet(peer_packet(
                None,
                Vec::new(),
                0,
                Code::SchedError,
            )))
            .await
            .unwrap();

        let (_, terminal) = drain_progress(&mut progress).await;
        assert!(!terminal.state.success);
        assert_eq!(terminal.state.code, Code::SchedError);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();

        let failed = counters.fails.lock().unwrap().clone();
        assert_matches!(failed, Some((Code::SchedError, _)));
    }

    #[tokio::test]
    async fn test_failed_piece_is_retried_until_success() {
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Normal,
            direct_piece: DirectPiece::None,
        }));
        let downloader = MockDownloader::with_peers(vec![(
            "10.0.0.1:65002",
            PeerScript {
                pieces: test_pieces(4, 1024),
                total_piece: 4,
                content_length: 4096,
                ..Default::default()
            },
        )]);
        downloader.fail_pieces_once.lock().unwrap().insert(1);
        let (task, mut progress, _counters) =
            build_task(scheduler.clone(), downloader, strict_options()).await;
        task.start();

        let handles = scheduler.take_handles().unwrap();
        handles
            .packet_tx
            .send(PacketEvent::Packet(peer_packet(
                Some(dest_peer("peer-1", "10.0.0.1")),
                Vec::new(),
                2,
                Code::Success,
            )))
            .await
            .unwrap();

        let (_, terminal) = drain_progress(&mut progress).await;
        assert!(terminal.state.success);
        assert_eq!(terminal.completed_length, 4096);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();
        assert_eq!(task.ready_piece_count(), 4);
    }

    #[tokio::test]
    async fn test_schedule_timeout_fails_when_back_source_disabled() {
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Normal,
            direct_piece: DirectPiece::None,
        }));
        let downloader = MockDownloader::with_peers(Vec::new());
        let options = SchedulerOptions {
            schedule_timeout: Duration::from_millis(100),
            disable_auto_back_source: true,
        };
        let (task, mut progress, counters) =
            build_task(scheduler.clone(), downloader, options).await;
        task.start();

        let (non_terminal, terminal) = drain_progress(&mut progress).await;
        assert_eq!(non_terminal, 0);
        assert!(!terminal.state.success);
        assert_eq!(terminal.state.code, Code::ClientScheduleTimeout);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();
        let failed = counters.fails.lock().unwrap().clone();
        assert_matches!(failed, Some((Code::ClientScheduleTimeout, _)));
    }

    #[tokio::test]
    async fn test_register_failure_backs_to_source() {
        let scheduler = MockScheduler::new(None);
        let downloader = Arc::new(MockDownloader {
            source_len: 1024,
            source_piece_size: 1024,
            ..Default::default()
        });
        let options = SchedulerOptions {
            schedule_timeout: Duration::from_secs(3),
            disable_auto_back_source: false,
        };
        let (task, mut progress, counters) =
            build_task(scheduler.clone(), downloader, options).await;
        task.start();

        let (_, terminal) = drain_progress(&mut progress).await;
        assert!(terminal.state.success);
        assert_eq!(terminal.completed_length, 1024);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();
        // the synthesized task id is the stable hash of url + meta
        let request = test_request();
        assert_eq!(
            task.task_id(),
            crate::scheduler::task_id(&request.url, &request.url_meta)
        );
        assert_eq!(counters.dones.load(Ordering::SeqCst), 1);
        // no stream was ever opened on the real scheduler
        assert!(scheduler.take_handles().is_none());
    }

    #[tokio::test]
    async fn test_register_failure_with_back_source_disabled_errors() {
        let scheduler = MockScheduler::new(None);
        let downloader = MockDownloader::with_peers(Vec::new());
        let (callback, _) = TestCallbackWithStart::new();
        let result = PeerTask::new(
            test_request(),
            scheduler,
            downloader,
            Arc::new(MemoryPieceStorage::new()),
            callback,
            strict_options(),
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_caller_cancel_is_terminal_with_context_code() {
        let scheduler = MockScheduler::new(Some(RegisterResult {
            task_id: "task-1".to_string(),
            size_scope: SizeScope::Normal,
            direct_piece: DirectPiece::None,
        }));
        let downloader = MockDownloader::with_peers(Vec::new());
        let (task, mut progress, _counters) =
            build_task(scheduler.clone(), downloader, strict_options()).await;
        task.start();

        task.context().cancel();
        let (_, terminal) = drain_progress(&mut progress).await;
        assert!(!terminal.state.success);
        assert_eq!(terminal.state.code, Code::ClientContextCanceled);
        terminal.done_ack.unwrap().ack();
        timeout(WAIT, task.done_signal().cancelled()).await.unwrap();
    }
}
