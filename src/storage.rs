use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::scheduler::{PieceInfo, PiecePacket, PieceTaskRequest};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("task {0} not registered")]
    TaskNotFound(String),
    #[error("piece {piece_num} of task {task_id} not in storage")]
    PieceNotFound { task_id: String, piece_num: u32 },
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("piece {piece_num} has {actual} bytes, descriptor says {expected}")]
    SizeMismatch {
        piece_num: u32,
        expected: u32,
        actual: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Persists and serves pieces for the tasks this peer carries. Implementors
/// must allow concurrent writers: piece workers call `write_piece` in
/// parallel.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Creates the task entry. Registering an existing task updates its
    /// content length only.
    async fn register_task(&self, task_id: &str, content_length: i64) -> Result<(), StorageError>;

    /// Stores one piece. When the descriptor carries an md5 the body is
    /// verified first and a mismatch rejects the write.
    async fn write_piece(
        &self,
        task_id: &str,
        piece: &PieceInfo,
        data: Bytes,
    ) -> Result<(), StorageError>;

    async fn read_piece(&self, task_id: &str, piece_num: u32) -> Result<Bytes, StorageError>;

    /// Serves piece descriptors to another peer: pieces with number >=
    /// `start_num`, at most `limit`. An empty batch means "not ready yet".
    async fn get_pieces(&self, request: &PieceTaskRequest) -> Result<PiecePacket, StorageError>;

    /// Verifies the md5 of the whole stored content against `digest`
    /// (hex). An empty digest validates trivially.
    async fn validate_digest(&self, task_id: &str, digest: &str) -> Result<(), StorageError>;

    /// Copies the finished content to its destination file, creating parent
    /// directories as needed.
    async fn store_to_destination(&self, task_id: &str, dest: &Path) -> Result<(), StorageError>;
}

struct TaskEntry {
    content_length: i64,
    pieces: BTreeMap<u32, (PieceInfo, Bytes)>,
}

/// In-memory piece storage, enough for the binary and the tests. Pieces are
/// keyed by number; contiguous assembly happens only at store time.
pub struct MemoryPieceStorage {
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl MemoryPieceStorage {
    pub fn new() -> Self {
        MemoryPieceStorage {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    fn assemble(&self, task_id: &str) -> Result<Vec<u8>, StorageError> {
        let tasks = self.tasks.read().expect("storage lock poisoned");
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| StorageError::TaskNotFound(task_id.to_string()))?;
        let mut content = Vec::new();
        for (_, (piece, data)) in entry.pieces.iter() {
            // pieces are fixed-offset ranges, BTreeMap order is content order
            debug_assert_eq!(piece.range_start, content.len() as u64);
            content.extend_from_slice(data);
        }
        Ok(content)
    }
}

impl Default for MemoryPieceStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PieceStorage for MemoryPieceStorage {
    async fn register_task(&self, task_id: &str, content_length: i64) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().expect("storage lock poisoned");
        tasks
            .entry(task_id.to_string())
            .and_modify(|entry| entry.content_length = content_length)
            .or_insert_with(|| TaskEntry {
                content_length,
                pieces: BTreeMap::new(),
            });
        Ok(())
    }

    async fn write_piece(
        &self,
        task_id: &str,
        piece: &PieceInfo,
        data: Bytes,
    ) -> Result<(), StorageError> {
        if data.len() != piece.range_size as usize {
            return Err(StorageError::SizeMismatch {
                piece_num: piece.piece_num,
                expected: piece.range_size,
                actual: data.len(),
            });
        }
        if !piece.piece_md5.is_empty() {
            let actual = format!("{:x}", md5::compute(&data));
            if actual != piece.piece_md5 {
                return Err(StorageError::DigestMismatch {
                    expected: piece.piece_md5.clone(),
                    actual,
                });
            }
        }
        let mut tasks = self.tasks.write().expect("storage lock poisoned");
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| StorageError::TaskNotFound(task_id.to_string()))?;
        entry.pieces.insert(piece.piece_num, (piece.clone(), data));
        Ok(())
    }

    async fn read_piece(&self, task_id: &str, piece_num: u32) -> Result<Bytes, StorageError> {
        let tasks = self.tasks.read().expect("storage lock poisoned");
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| StorageError::TaskNotFound(task_id.to_string()))?;
        entry
            .pieces
            .get(&piece_num)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| StorageError::PieceNotFound {
                task_id: task_id.to_string(),
                piece_num,
            })
    }

    async fn get_pieces(&self, request: &PieceTaskRequest) -> Result<PiecePacket, StorageError> {
        let tasks = self.tasks.read().expect("storage lock poisoned");
        let entry = tasks
            .get(&request.task_id)
            .ok_or_else(|| StorageError::TaskNotFound(request.task_id.clone()))?;
        let piece_infos: Vec<PieceInfo> = entry
            .pieces
            .range(request.start_num..)
            .take(request.limit as usize)
            .map(|(_, (piece, _))| piece.clone())
            .collect();
        Ok(PiecePacket {
            task_id: request.task_id.clone(),
            dst_pid: request.dst_pid.clone(),
            dst_addr: String::new(),
            piece_infos,
            total_piece: if entry.content_length >= 0 {
                entry.pieces.len() as i32
            } else {
                -1
            },
            content_length: entry.content_length,
            piece_md5_sign: String::new(),
        })
    }

    async fn validate_digest(&self, task_id: &str, digest: &str) -> Result<(), StorageError> {
        if digest.is_empty() {
            return Ok(());
        }
        let content = self.assemble(task_id)?;
        let actual = format!("{:x}", md5::compute(&content));
        if actual != digest {
            return Err(StorageError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(())
    }

    async fn store_to_destination(&self, task_id: &str, dest: &Path) -> Result<(), StorageError> {
        let content = self.assemble(task_id)?;
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(dest, content).await?;
        Ok(())
    }
}
