use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::codes::Code;

/// Piece number carried by the final `PieceResult` of a task, informing the
/// scheduler the stream is over.
pub const END_OF_PIECE: i32 = -1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlMeta {
    /// Expected md5 of the whole content, hex encoded, empty when unknown.
    pub digest: String,
    pub tag: String,
    pub filter: String,
    pub range: String,
}

#[derive(Debug, Clone)]
pub struct PeerHost {
    pub uuid: String,
    pub ip: String,
    pub rpc_port: u16,
    pub down_port: u16,
    pub hostname: String,
    pub security_domain: String,
    pub location: String,
    pub idc: String,
    pub net_topology: String,
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub url: String,
    pub url_meta: UrlMeta,
    pub peer_id: String,
    pub peer_host: PeerHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeScope {
    /// Content small enough to come back inline with the registration.
    Tiny,
    /// One piece, one known source peer; no peer packet subscription needed.
    Small,
    /// The general case: peer-packet-driven piece pulling.
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStyle {
    Plain,
}

/// Piece descriptor as served by `get_piece_tasks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_num: u32,
    pub range_start: u64,
    pub range_size: u32,
    /// hex md5 of the piece body, empty when the source does not sign pieces
    pub piece_md5: String,
    pub piece_style: PieceStyle,
}

#[derive(Debug, Clone)]
pub struct SinglePiece {
    pub dst_pid: String,
    pub dst_addr: String,
    pub piece_info: PieceInfo,
}

#[derive(Debug, Clone)]
pub enum DirectPiece {
    /// Tiny tasks: the whole content, inline.
    Content(Bytes),
    /// Small tasks: the one piece and where to get it.
    Single(SinglePiece),
    None,
}

#[derive(Debug, Clone)]
pub struct RegisterResult {
    pub task_id: String,
    pub size_scope: SizeScope,
    pub direct_piece: DirectPiece,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestPeer {
    pub peer_id: String,
    pub ip: String,
    pub down_port: u16,
}

impl DestPeer {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.down_port)
    }
}

/// A scheduler-to-peer message naming the current main peer and the ordered
/// fallback peers. Replaced whole on every arrival; the latest wins.
#[derive(Debug, Clone)]
pub struct PeerPacket {
    pub task_id: String,
    pub src_pid: String,
    pub parallel_count: i32,
    pub main_peer: Option<DestPeer>,
    pub steal_peers: Vec<DestPeer>,
    pub code: Code,
}

/// One piece attempt reported upstream.
#[derive(Debug, Clone)]
pub struct PieceResult {
    pub task_id: String,
    pub src_pid: String,
    pub dst_pid: String,
    pub piece_num: i32,
    pub success: bool,
    pub code: Code,
    pub finished_count: i32,
}

impl PieceResult {
    pub fn end_of_piece(task_id: &str, peer_id: &str, finished_count: i32) -> Self {
        PieceResult {
            task_id: task_id.to_string(),
            src_pid: peer_id.to_string(),
            dst_pid: String::new(),
            piece_num: END_OF_PIECE,
            success: true,
            code: Code::Success,
            finished_count,
        }
    }
}

/// Request for a batch of piece descriptors from a remote peer.
#[derive(Debug, Clone)]
pub struct PieceTaskRequest {
    pub task_id: String,
    pub src_pid: String,
    pub dst_pid: String,
    pub start_num: u32,
    pub limit: u32,
}

/// Batch of piece descriptors from a remote peer. Empty `piece_infos` means
/// "not ready yet, retry later".
#[derive(Debug, Clone)]
pub struct PiecePacket {
    pub task_id: String,
    pub dst_pid: String,
    pub dst_addr: String,
    pub piece_infos: Vec<PieceInfo>,
    pub total_piece: i32,
    pub content_length: i64,
    pub piece_md5_sign: String,
}

#[derive(Debug, Error)]
pub enum RecvError {
    /// Clean remote close of the packet stream.
    #[error("peer packet stream closed")]
    EndOfStream,
    /// Scheduler-reported code; `Code::is_exit_code` decides whether the
    /// task dies with it.
    #[error("scheduler error {code}: {message}")]
    Code { code: Code, message: String },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("peer packet stream gone away")]
    GoneAway,
}

/// What the transport feeds into the receiving half of a packet stream.
#[derive(Debug)]
pub enum PacketEvent {
    Packet(PeerPacket),
    Error { code: Code, message: String },
}

/// Bidirectional stream facade over the scheduler connection. The stub
/// variant substitutes for a scheduler that could not be reached: it
/// fabricates `SchedNeedBackSource` on recv and silently discards sends, so
/// the normal dispatch path escalates to back-source on its own.
pub enum PeerPacketStream {
    Real {
        piece_result_tx: Sender<PieceResult>,
        packet_rx: Mutex<Receiver<PacketEvent>>,
    },
    Stub,
}

impl PeerPacketStream {
    pub fn real(piece_result_tx: Sender<PieceResult>, packet_rx: Receiver<PacketEvent>) -> Self {
        PeerPacketStream::Real {
            piece_result_tx,
            packet_rx: Mutex::new(packet_rx),
        }
    }

    pub async fn send(&self, result: PieceResult) -> Result<(), SendError> {
        match self {
            PeerPacketStream::Real {
                piece_result_tx, ..
            } => piece_result_tx
                .send(result)
                .await
                .map_err(|_| SendError::GoneAway),
            PeerPacketStream::Stub => Ok(()),
        }
    }

    pub async fn recv(&self) -> Result<PeerPacket, RecvError> {
        match self {
            PeerPacketStream::Real { packet_rx, .. } => {
                let mut rx = packet_rx.lock().await;
                match rx.recv().await {
                    Some(PacketEvent::Packet(packet)) => Ok(packet),
                    Some(PacketEvent::Error { code, message }) => {
                        Err(RecvError::Code { code, message })
                    }
                    None => Err(RecvError::EndOfStream),
                }
            }
            PeerPacketStream::Stub => Err(RecvError::Code {
                code: Code::SchedNeedBackSource,
                message: "no scheduler available, back to source".to_string(),
            }),
        }
    }
}

/// The peer-side contract of the scheduler service. The register call is
/// unary; `report_piece_result` opens the bidirectional stream the task
/// feeds results into and receives peer packets from.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn register_peer_task(&self, request: &TaskRequest) -> Result<RegisterResult>;

    async fn report_piece_result(
        &self,
        task_id: &str,
        request: &TaskRequest,
    ) -> Result<PeerPacketStream>;
}

/// Stable task id for a url + meta pair; used when registration fails and
/// the task has to name itself before backing to source.
pub fn task_id(url: &str, url_meta: &UrlMeta) -> String {
    let seed = format!(
        "{}|{}|{}|{}|{}",
        url, url_meta.filter, url_meta.tag, url_meta.range, url_meta.digest
    );
    format!("{:x}", md5::compute(seed.as_bytes()))
}

/// Unique peer id for one task instance on this host.
pub fn generate_peer_id(ip: &str) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();
    let one_char = || CHARSET[rng.random_range(0..CHARSET.len())] as char;
    let random_string: String = std::iter::repeat_with(one_char).take(12).collect();
    format!("{ip}-{}-{random_string}", std::process::id())
}
