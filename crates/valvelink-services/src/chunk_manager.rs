//! Chunk Manager — transport-agnostic fragmentation and reassembly of
//! application frames that exceed a link's MTU.
//!
//! One lock (`parking_lot::Mutex`) protects the fixed-capacity context
//! array; every public operation acquires it for the duration of the call.
//! Callers drive the wall clock: `receive`/`sweep_expired` take `now_ms`
//! explicitly rather than reading `Instant::now()` internally, which keeps
//! the reassembly logic itself deterministic and cheap to test.

use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use valvelink_core::wire::{chunk_flags, ChunkHeader, CHUNK_HEADER_LEN, MAX_CHUNKS_PER_FRAME};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid chunk size: {0}")]
    InvalidSize(String),
    #[error("no free reassembly context slots")]
    NoMem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Another chunk is still needed.
    Pending,
    /// This `chunk_idx` was already recorded; state was not mutated.
    Duplicate,
    /// The bitmap is full; the assembled frame is returned and the
    /// context released.
    Complete,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkManagerStats {
    pub active_contexts: usize,
    pub frames_sent: u64,
    pub frames_completed: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone)]
pub struct ChunkManagerConfig {
    /// Includes the 7-byte header.
    pub max_chunk_size: usize,
    /// 1..=8.
    pub max_concurrent_frames: usize,
    pub reassembly_timeout_ms: u64,
}

impl ChunkManagerConfig {
    fn effective_chunk_size(&self) -> usize {
        self.max_chunk_size - CHUNK_HEADER_LEN
    }
}

struct ReassemblyContext {
    frame_id: u16,
    created_at_ms: u64,
    received_bitmap: u8,
    total_chunks: u8,
    current_size: usize,
    buffer: Vec<u8>,
}

struct Inner {
    config: ChunkManagerConfig,
    contexts: Vec<ReassemblyContext>,
    stats: ChunkManagerStats,
}

pub struct ChunkManager {
    next_frame_id: AtomicU16,
    inner: Mutex<Inner>,
}

impl ChunkManager {
    pub fn new(config: ChunkManagerConfig) -> Self {
        assert!(config.max_concurrent_frames >= 1 && config.max_concurrent_frames <= 8);
        Self {
            next_frame_id: AtomicU16::new(1),
            inner: Mutex::new(Inner {
                config,
                contexts: Vec::new(),
                stats: ChunkManagerStats::default(),
            }),
        }
    }

    /// Reconfigure the effective chunk size, e.g. after a BLE MTU exchange.
    pub fn set_max_chunk_size(&self, max_chunk_size: usize) {
        self.inner.lock().config.max_chunk_size = max_chunk_size;
    }

    fn allocate_frame_id(&self) -> u16 {
        let id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            // 0 was skipped by wraparound; the *next* call will also see 0
            // from fetch_add's return, so nudge forward once more here.
            self.next_frame_id.store(2, Ordering::Relaxed);
            1
        } else {
            id
        }
    }

    /// Split `payload` into header-prefixed on-wire chunks.
    pub fn send(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, ChunkError> {
        let mut inner = self.inner.lock();
        let effective = inner.config.effective_chunk_size();
        let size = payload.len();
        let n = size.div_ceil(effective).max(1);
        if n > MAX_CHUNKS_PER_FRAME as usize {
            return Err(ChunkError::InvalidSize(format!(
                "{size} bytes needs {n} chunks, max is {MAX_CHUNKS_PER_FRAME}"
            )));
        }
        let frame_id = self.allocate_frame_id();

        let mut chunks = Vec::with_capacity(n);
        for i in 0..n {
            let start = i * effective;
            let end = (start + effective).min(size);
            let slice = &payload[start..end];
            let mut flags = chunk_flags::CHUNKED;
            flags |= if i == n - 1 { chunk_flags::FINAL } else { chunk_flags::MORE };
            let header = ChunkHeader {
                flags,
                chunk_idx: i as u8,
                total_chunks: n as u8,
                frame_id,
                chunk_size: slice.len() as u16,
            };
            let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + slice.len());
            buf.extend_from_slice(&header.encode());
            buf.extend_from_slice(slice);
            chunks.push(buf);
        }
        inner.stats.frames_sent += 1;
        Ok(chunks)
    }

    /// Feed one on-wire chunk. Returns the assembled frame on `Complete`.
    pub fn receive(
        &self,
        now_ms: u64,
        chunk: &[u8],
    ) -> Result<(ReceiveOutcome, Option<Vec<u8>>), ChunkError> {
        if chunk.len() < CHUNK_HEADER_LEN {
            return Err(ChunkError::InvalidSize(format!(
                "{} bytes shorter than header",
                chunk.len()
            )));
        }
        let header = ChunkHeader::decode(chunk)
            .map_err(|e| ChunkError::InvalidSize(e.to_string()))?;
        if header.total_chunks == 0 || header.total_chunks > MAX_CHUNKS_PER_FRAME {
            return Err(ChunkError::InvalidSize(format!(
                "total_chunks {} out of range",
                header.total_chunks
            )));
        }
        let payload = &chunk[CHUNK_HEADER_LEN..];
        if header.chunk_size as usize != payload.len() {
            return Err(ChunkError::InvalidSize(format!(
                "header declares {} bytes, got {}",
                header.chunk_size,
                payload.len()
            )));
        }

        let mut inner = self.inner.lock();
        let effective = inner.config.effective_chunk_size();
        let max_concurrent = inner.config.max_concurrent_frames;

        let idx = inner
            .contexts
            .iter()
            .position(|c| c.frame_id == header.frame_id);

        let idx = match idx {
            Some(i) => i,
            None => {
                if inner.contexts.len() >= max_concurrent {
                    return Err(ChunkError::NoMem);
                }
                let expected_size = header.total_chunks as usize * effective;
                inner.contexts.push(ReassemblyContext {
                    frame_id: header.frame_id,
                    created_at_ms: now_ms,
                    received_bitmap: 0,
                    total_chunks: header.total_chunks,
                    current_size: 0,
                    buffer: vec![0u8; expected_size],
                });
                inner.stats.active_contexts = inner.contexts.len();
                inner.contexts.len() - 1
            }
        };

        let bit = 1u8 << header.chunk_idx;
        if inner.contexts[idx].received_bitmap & bit != 0 {
            return Ok((ReceiveOutcome::Duplicate, None));
        }

        let offset = header.chunk_idx as usize * effective;
        {
            let ctx = &mut inner.contexts[idx];
            ctx.buffer[offset..offset + payload.len()].copy_from_slice(payload);
            ctx.received_bitmap |= bit;
            ctx.current_size += payload.len();
        }

        let full_mask = if header.total_chunks == 8 {
            0xFFu8
        } else {
            (1u8 << header.total_chunks) - 1
        };
        if inner.contexts[idx].received_bitmap == full_mask {
            let ctx = inner.contexts.remove(idx);
            inner.stats.active_contexts = inner.contexts.len();
            inner.stats.frames_completed += 1;
            let mut frame = ctx.buffer;
            frame.truncate(ctx.current_size);
            return Ok((ReceiveOutcome::Complete, Some(frame)));
        }

        Ok((ReceiveOutcome::Pending, None))
    }

    /// Release any context whose age exceeds the configured timeout.
    /// Returns how many were released.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let mut inner = self.inner.lock();
        let timeout = inner.config.reassembly_timeout_ms;
        let before = inner.contexts.len();
        inner
            .contexts
            .retain(|c| now_ms.saturating_sub(c.created_at_ms) <= timeout);
        let removed = before - inner.contexts.len();
        inner.stats.active_contexts = inner.contexts.len();
        inner.stats.timeouts += removed as u64;
        removed
    }

    pub fn stats(&self) -> ChunkManagerStats {
        self.inner.lock().stats.clone()
    }
}
