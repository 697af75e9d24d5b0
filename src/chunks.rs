//! Chunk upload sequencing for one recording session.
//!
//! Every captured audio chunk must reach the backend in order, with bounded
//! retries, before the turn's trailing (chunk-less) request may fire. The
//! queue itself never touches the network: the session driver calls
//! [`ChunkSession::take_next`], performs the upload through the gateway, and
//! feeds the outcome back via [`ChunkSession::on_upload_result`]. That keeps
//! exactly one upload in flight per session and makes the retry and
//! finalize-gate logic testable without a backend.

use std::collections::VecDeque;

use crate::error::ClientError;

/// One pending chunk upload. Owned exclusively by the queue until uploaded
/// or permanently failed; only the retry handler mutates `attempt`.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub audio: Vec<u8>,
    pub filename: String,
    pub session_id: String,
    pub chunk_index: u32,
    pub attempt: u32,
}

/// Result of one upload attempt, as judged by the gateway: HTTP 2xx plus an
/// accepted `status` is an ack, everything else is a rejection.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Acked,
    Rejected(String),
}

/// State of one contiguous recording's chunk uploads.
#[derive(Debug)]
pub struct ChunkSession {
    session_id: String,
    next_chunk_index: u32,
    queue: VecDeque<ChunkUpload>,
    acked: u32,
    failed: u32,
    in_flight: bool,
    finalize_pending: bool,
    finalize_filename: String,
    retry_limit: u32,
}

impl ChunkSession {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            session_id: new_session_id(),
            next_chunk_index: 0,
            queue: VecDeque::new(),
            acked: 0,
            failed: 0,
            in_flight: false,
            finalize_pending: false,
            finalize_filename: String::new(),
            retry_limit,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether any chunk was ever produced this turn.
    pub fn produced_any(&self) -> bool {
        self.next_chunk_index > 0
    }

    /// Assign the next chunk index and append to the tail.
    pub fn enqueue(&mut self, audio: Vec<u8>, filename: &str) -> u32 {
        let chunk_index = self.next_chunk_index;
        self.next_chunk_index += 1;
        self.queue.push_back(ChunkUpload {
            audio,
            filename: filename.to_string(),
            session_id: self.session_id.clone(),
            chunk_index,
            attempt: 0,
        });
        log::debug!(
            "Chunk {} queued for session {} ({} pending)",
            chunk_index,
            self.session_id,
            self.queue.len()
        );
        chunk_index
    }

    /// Pop the head item for upload. Returns `None` while another upload is
    /// in flight, keeping the pump serialized.
    pub fn take_next(&mut self) -> Option<ChunkUpload> {
        if self.in_flight {
            return None;
        }
        let item = self.queue.pop_front()?;
        self.in_flight = true;
        Some(item)
    }

    /// Apply the outcome of an upload attempt.
    ///
    /// Acks bump the counter. Rejections within the retry budget increment
    /// `attempt` and requeue at the *front*, so a failed chunk is retried
    /// before newer chunks. Beyond the budget the chunk is permanently
    /// dropped and the returned error vetoes the turn's finalize gate.
    pub fn on_upload_result(
        &mut self,
        mut item: ChunkUpload,
        outcome: UploadOutcome,
    ) -> Option<ClientError> {
        self.in_flight = false;
        match outcome {
            UploadOutcome::Acked => {
                self.acked += 1;
                log::debug!(
                    "Chunk {} acked ({}/{} for session {})",
                    item.chunk_index,
                    self.acked,
                    self.next_chunk_index,
                    self.session_id
                );
                None
            }
            UploadOutcome::Rejected(reason) => {
                if item.attempt < self.retry_limit {
                    item.attempt += 1;
                    log::warn!(
                        "Chunk {} upload failed ({}), retry {}/{}",
                        item.chunk_index,
                        reason,
                        item.attempt,
                        self.retry_limit
                    );
                    self.queue.push_front(item);
                    None
                } else {
                    self.failed += 1;
                    log::error!(
                        "Chunk {} dropped after {} attempts: {}",
                        item.chunk_index,
                        item.attempt + 1,
                        reason
                    );
                    Some(ClientError::ChunkUploadExhausted {
                        chunk_index: item.chunk_index,
                    })
                }
            }
        }
    }

    /// Request the finalize barrier: once every chunk is acknowledged, the
    /// trailing no-audio turn request may fire.
    pub fn request_finalize(&mut self, filename: &str) {
        self.finalize_pending = true;
        self.finalize_filename = filename.to_string();
    }

    pub fn finalize_filename(&self) -> &str {
        &self.finalize_filename
    }

    /// Whether the recording that owns this session has ended. A session
    /// with finalize requested never accepts chunks from a new recording.
    pub fn finalize_requested(&self) -> bool {
        self.finalize_pending
    }

    /// The finalize gate. All conditions must hold: finalize requested, queue
    /// drained, nothing in flight, no turn already out, at least one chunk
    /// produced, every chunk individually acknowledged, and zero permanent
    /// failures (one dropped chunk vetoes the whole turn).
    pub fn ready_to_finalize(&self, turn_in_flight: bool) -> bool {
        self.finalize_pending
            && self.queue.is_empty()
            && !self.in_flight
            && !turn_in_flight
            && self.produced_any()
            && self.acked == self.next_chunk_index
            && self.failed == 0
    }

    /// Whether a permanently-failed chunk has vetoed this session.
    pub fn vetoed(&self) -> bool {
        self.failed > 0
    }
}

/// Time-derived session id, unique per recording.
fn new_session_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("rec-{}-{}", millis, &suffix[..8])
}
