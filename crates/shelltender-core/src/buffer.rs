//! Per-session output ring buffers with monotonic sequence numbers
//!
//! Each session owns a bounded ring of `(sequence, bytes)` chunks. The
//! sequence is assigned under the same per-session lock as the append and
//! eviction, so readers calling [`BufferManager::get_since`] always observe
//! a consistent prefix. Sequences are never reused within a session, and a
//! restored session is seeded past the highest sequence persisted on disk.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// Joined bytes of all retained chunks plus the last assigned sequence
/// (0 when nothing was ever appended).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub data: Vec<u8>,
    pub last_seq: u64,
}

/// Reply shape of [`BufferManager::get_since`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinceReply {
    /// Client already has everything up to `last_seq`.
    UpToDate { last_seq: u64 },
    /// Bytes of every chunk with sequence greater than the client's cursor.
    Incremental { data: Vec<u8>, last_seq: u64 },
    /// The cursor precedes the oldest retained chunk; the caller must treat
    /// this as a full replay.
    Gap { data: Vec<u8>, last_seq: u64 },
}

impl SinceReply {
    pub fn last_seq(&self) -> u64 {
        match self {
            SinceReply::UpToDate { last_seq }
            | SinceReply::Incremental { last_seq, .. }
            | SinceReply::Gap { last_seq, .. } => *last_seq,
        }
    }
}

#[derive(Debug)]
struct Chunk {
    seq: u64,
    data: Bytes,
}

#[derive(Debug)]
struct SessionBuffer {
    chunks: VecDeque<Chunk>,
    /// Last assigned sequence; 0 means none. Preserved across `clear`.
    last_seq: u64,
    retained_bytes: usize,
    capacity_bytes: usize,
}

impl SessionBuffer {
    fn new(capacity_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            last_seq: 0,
            retained_bytes: 0,
            capacity_bytes,
        }
    }

    fn append(&mut self, data: Bytes) -> u64 {
        self.last_seq += 1;
        self.retained_bytes += data.len();
        self.chunks.push_back(Chunk {
            seq: self.last_seq,
            data,
        });
        // Whole-chunk eviction: never splits a chunk, so multi-byte UTF-8
        // sequences inside one PTY read stay intact. The newest chunk is
        // always retained even when it alone exceeds capacity.
        while self.retained_bytes > self.capacity_bytes && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.retained_bytes -= evicted.data.len();
            }
        }
        self.last_seq
    }

    fn full(&self) -> BufferSnapshot {
        let mut data = Vec::with_capacity(self.retained_bytes);
        for chunk in &self.chunks {
            data.extend_from_slice(&chunk.data);
        }
        BufferSnapshot {
            data,
            last_seq: self.last_seq,
        }
    }

    fn since(&self, client_seq: u64) -> SinceReply {
        if client_seq >= self.last_seq {
            return SinceReply::UpToDate {
                last_seq: self.last_seq,
            };
        }
        let oldest = self.chunks.front().map(|c| c.seq);
        match oldest {
            // Chunks covering (client_seq, last_seq] are gone.
            None => SinceReply::Gap {
                data: Vec::new(),
                last_seq: self.last_seq,
            },
            Some(oldest_seq) if client_seq + 1 < oldest_seq => {
                let snapshot = self.full();
                SinceReply::Gap {
                    data: snapshot.data,
                    last_seq: snapshot.last_seq,
                }
            }
            Some(_) => {
                let mut data = Vec::new();
                for chunk in self.chunks.iter().filter(|c| c.seq > client_seq) {
                    data.extend_from_slice(&chunk.data);
                }
                SinceReply::Incremental {
                    data,
                    last_seq: self.last_seq,
                }
            }
        }
    }
}

/// Owner of every session's ring buffer.
pub struct BufferManager {
    buffers: RwLock<HashMap<String, Arc<Mutex<SessionBuffer>>>>,
    capacity_bytes: usize,
}

impl BufferManager {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity_bytes,
        }
    }

    fn entry(&self, session_id: &str) -> Arc<Mutex<SessionBuffer>> {
        if let Some(buffer) = self.buffers.read().unwrap().get(session_id) {
            return buffer.clone();
        }
        let mut buffers = self.buffers.write().unwrap();
        buffers
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionBuffer::new(self.capacity_bytes))))
            .clone()
    }

    /// Assign the next sequence and store the chunk. Returns `None` for
    /// zero-byte chunks: no sequence is burned and no frame should be sent.
    pub fn append(&self, session_id: &str, data: &[u8]) -> Option<u64> {
        if data.is_empty() {
            return None;
        }
        let entry = self.entry(session_id);
        let mut buffer = entry.lock().unwrap();
        Some(buffer.append(Bytes::copy_from_slice(data)))
    }

    pub fn get_full(&self, session_id: &str) -> BufferSnapshot {
        let entry = self.entry(session_id);
        let buffer = entry.lock().unwrap();
        buffer.full()
    }

    pub fn get_since(&self, session_id: &str, client_seq: u64) -> SinceReply {
        let entry = self.entry(session_id);
        let buffer = entry.lock().unwrap();
        buffer.since(client_seq)
    }

    /// Drop retained chunks but keep the sequence counter, so sequences are
    /// never reused within the session's lifetime.
    pub fn clear(&self, session_id: &str) {
        let entry = self.entry(session_id);
        let mut buffer = entry.lock().unwrap();
        buffer.chunks.clear();
        buffer.retained_bytes = 0;
    }

    /// Install persisted bytes for a restored session. The chunk takes the
    /// persisted high-water sequence, so the first live append is strictly
    /// greater than anything a client saw before the restart.
    pub fn seed(&self, session_id: &str, data: &[u8], persisted_seq: u64) {
        let entry = self.entry(session_id);
        let mut buffer = entry.lock().unwrap();
        buffer.chunks.clear();
        buffer.retained_bytes = data.len();
        buffer.last_seq = persisted_seq;
        if !data.is_empty() {
            buffer.chunks.push_back(Chunk {
                seq: persisted_seq,
                data: Bytes::copy_from_slice(data),
            });
        }
    }

    /// Forget the session entirely (kill path).
    pub fn remove(&self, session_id: &str) {
        self.buffers.write().unwrap().remove(session_id);
    }

    pub fn last_seq(&self, session_id: &str) -> u64 {
        self.buffers
            .read()
            .unwrap()
            .get(session_id)
            .map(|b| b.lock().unwrap().last_seq)
            .unwrap_or(0)
    }

    pub fn retained_bytes(&self, session_id: &str) -> usize {
        self.buffers
            .read()
            .unwrap()
            .get(session_id)
            .map(|b| b.lock().unwrap().retained_bytes)
            .unwrap_or(0)
    }
}
