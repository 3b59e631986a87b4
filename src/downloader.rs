use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;

use crate::codes::Code;
use crate::scheduler::{PieceInfo, PiecePacket, PieceResult, PieceStyle, PieceTaskRequest, TaskRequest};
use crate::storage::PieceStorage;
use crate::task::peer_task::PeerTask;
use crate::task::{DownloadPieceRequest, PieceTaskResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PIECE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// A code the remote peer answered with instead of data. The pull loop
/// matches on this to decide between retrying the same peer and moving on.
#[derive(Debug, Error)]
#[error("remote peer returned {0}")]
pub struct RemoteCode(pub Code);

/// Fetches pieces from named remote peers and, as the fallback path, whole
/// content from the origin server.
///
/// `download_piece` and `download_source` report their outcome to the task
/// themselves: exactly one `report_piece_result` call per piece attempt.
#[async_trait]
pub trait PieceDownloader: Send + Sync {
    /// Asks a remote peer for a batch of piece descriptors. An empty batch
    /// in the reply means the peer has nothing ready yet.
    async fn get_piece_tasks(&self, addr: &str, request: &PieceTaskRequest)
    -> Result<PiecePacket>;

    /// Downloads one piece from a remote peer into storage. Returns whether
    /// the piece ended up stored.
    async fn download_piece(&self, task: &PeerTask, request: &DownloadPieceRequest) -> bool;

    /// Fills storage straight from the origin url, piece by piece, under
    /// the same progress contract as the p2p path.
    async fn download_source(&self, task: &PeerTask, request: &TaskRequest) -> Result<()>;
}

#[derive(Deserialize)]
struct PieceInfoDto {
    piece_num: u32,
    range_start: u64,
    range_size: u32,
    #[serde(default)]
    piece_md5: String,
}

#[derive(Deserialize)]
struct PiecePacketDto {
    task_id: String,
    dst_pid: String,
    dst_addr: String,
    piece_infos: Vec<PieceInfoDto>,
    total_piece: i32,
    content_length: i64,
    #[serde(default)]
    piece_md5_sign: String,
}

impl From<PiecePacketDto> for PiecePacket {
    fn from(dto: PiecePacketDto) -> Self {
        PiecePacket {
            task_id: dto.task_id,
            dst_pid: dto.dst_pid,
            dst_addr: dto.dst_addr,
            piece_infos: dto
                .piece_infos
                .into_iter()
                .map(|p| PieceInfo {
                    piece_num: p.piece_num,
                    range_start: p.range_start,
                    range_size: p.range_size,
                    piece_md5: p.piece_md5,
                    piece_style: PieceStyle::Plain,
                })
                .collect(),
            total_piece: dto.total_piece,
            content_length: dto.content_length,
            piece_md5_sign: dto.piece_md5_sign,
        }
    }
}

/// HTTP-backed downloader: ranged GETs against a peer's down-port for
/// pieces, a streamed GET against the origin for back-source.
pub struct HttpPieceDownloader {
    client: reqwest::Client,
    storage: Arc<dyn PieceStorage>,
    piece_size: u32,
}

impl HttpPieceDownloader {
    pub fn new(storage: Arc<dyn PieceStorage>, piece_size: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(HttpPieceDownloader {
            client,
            storage,
            piece_size,
        })
    }

    async fn fetch_piece(&self, request: &DownloadPieceRequest) -> Result<Bytes> {
        let piece = &request.piece;
        let url = format!(
            "http://{}/pieces/{}/{}",
            request.dst_addr, request.task_id, piece.piece_num
        );
        let range_end = piece.range_start + piece.range_size as u64 - 1;
        let response = tokio::time::timeout(
            PIECE_DOWNLOAD_TIMEOUT,
            self.client
                .get(&url)
                .header(
                    reqwest::header::RANGE,
                    format!("bytes={}-{}", piece.range_start, range_end),
                )
                .send(),
        )
        .await
        .context("piece download timed out")??;
        if !response.status().is_success() {
            bail!(
                "peer {} answered {} for piece {}",
                request.dst_addr,
                response.status(),
                piece.piece_num
            );
        }
        let body = tokio::time::timeout(PIECE_DOWNLOAD_TIMEOUT, response.bytes())
            .await
            .context("piece body timed out")??;
        if body.len() != piece.range_size as usize {
            bail!(
                "peer {} sent {} bytes for piece {}, descriptor says {}",
                request.dst_addr,
                body.len(),
                piece.piece_num,
                piece.range_size
            );
        }
        Ok(body)
    }

    async fn store_source_piece(
        &self,
        task: &PeerTask,
        piece_num: u32,
        range_start: u64,
        body: Bytes,
    ) -> Result<()> {
        let piece = source_piece_info(piece_num, range_start, &body);
        if let Some(limiter) = task.limiter() {
            limiter
                .wait_n(piece.range_size as u64, task.context())
                .await?;
        }
        self.storage
            .write_piece(task.task_id(), &piece, body)
            .await?;
        task.add_traffic(piece.range_size as i64);
        let result = PieceResult {
            task_id: task.task_id().to_string(),
            src_pid: task.peer_id().to_string(),
            dst_pid: String::new(),
            piece_num: piece.piece_num as i32,
            success: true,
            code: Code::Success,
            finished_count: 0, // filled by the task at send time
        };
        let _ = task
            .report_piece_result(PieceTaskResult {
                piece,
                result,
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl PieceDownloader for HttpPieceDownloader {
    async fn get_piece_tasks(
        &self,
        addr: &str,
        request: &PieceTaskRequest,
    ) -> Result<PiecePacket> {
        let url = format!(
            "http://{}/piece-tasks/{}?src={}&start={}&limit={}",
            addr, request.task_id, request.src_pid, request.start_num, request.limit
        );
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // the seed peer has not registered the task yet, the caller may
            // retry the same peer
            return Err(RemoteCode(Code::CdnTaskNotFound).into());
        }
        if !response.status().is_success() {
            bail!("peer {} answered {} for piece tasks", addr, response.status());
        }
        let dto: PiecePacketDto = response.json().await?;
        Ok(dto.into())
    }

    async fn download_piece(&self, task: &PeerTask, request: &DownloadPieceRequest) -> bool {
        let piece = &request.piece;
        let mut result = PieceResult {
            task_id: task.task_id().to_string(),
            src_pid: task.peer_id().to_string(),
            dst_pid: request.dst_pid.clone(),
            piece_num: piece.piece_num as i32,
            success: false,
            code: Code::ClientPieceDownloadFail,
            finished_count: 0,
        };
        let stored = match self.fetch_piece(request).await {
            Ok(body) => match self.storage.write_piece(task.task_id(), piece, body).await {
                Ok(()) => true,
                Err(e) => {
                    log::error!(
                        "store piece {} of task {} failed: {e}",
                        piece.piece_num,
                        request.task_id
                    );
                    false
                }
            },
            Err(e) => {
                log::error!(
                    "download piece {} of task {} from {} failed: {e}",
                    piece.piece_num,
                    request.task_id,
                    request.dst_addr
                );
                false
            }
        };
        if stored {
            task.add_traffic(piece.range_size as i64);
            result.success = true;
            result.code = Code::Success;
        }
        let _ = task
            .report_piece_result(PieceTaskResult {
                piece: piece.clone(),
                result,
            })
            .await;
        stored
    }

    async fn download_source(&self, task: &PeerTask, request: &TaskRequest) -> Result<()> {
        let mut builder = self.client.get(&request.url);
        if !request.url_meta.range.is_empty() {
            builder = builder.header(
                reqwest::header::RANGE,
                format!("bytes={}", request.url_meta.range),
            );
        }
        let response = builder.send().await?.error_for_status()?;
        if let Some(len) = response.content_length() {
            task.set_content_length(len as i64).await?;
        }

        let mut body = response.bytes_stream();
        let mut buffer = BytesMut::new();
        let mut piece_num = 0u32;
        let mut offset = 0u64;
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = task.context().cancelled() => bail!("context canceled"),
            };
            match chunk {
                Some(chunk) => {
                    buffer.extend_from_slice(&chunk.context("read source body")?);
                    while buffer.len() >= self.piece_size as usize {
                        let piece_body = buffer.split_to(self.piece_size as usize).freeze();
                        let len = piece_body.len() as u64;
                        self.store_source_piece(task, piece_num, offset, piece_body)
                            .await?;
                        piece_num += 1;
                        offset += len;
                    }
                }
                None => break,
            }
        }
        if !buffer.is_empty() {
            let piece_body = buffer.freeze();
            let len = piece_body.len() as u64;
            self.store_source_piece(task, piece_num, offset, piece_body)
                .await?;
            piece_num += 1;
            offset += len;
        }
        task.set_total_pieces(piece_num as i32);
        task.set_content_length(offset as i64).await?;
        log::info!(
            "source download of task {} complete, {piece_num} pieces, {offset} bytes",
            task.task_id()
        );
        Ok(())
    }
}

fn source_piece_info(piece_num: u32, range_start: u64, body: &Bytes) -> PieceInfo {
    PieceInfo {
        piece_num,
        range_start,
        range_size: body.len() as u32,
        piece_md5: format!("{:x}", md5::compute(body)),
        piece_style: PieceStyle::Plain,
    }
}
