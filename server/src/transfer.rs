//! Transfer engine: per-transfer state machine, chunk buffers, and the
//! memory/concurrency governor.
//!
//! A transfer is offered, accepted or rejected, streamed as indexed base64
//! chunks, and finished exactly once. Buffers exist only while streaming;
//! every terminal transition frees them and returns the charged bytes to
//! the governor in the same critical section, so the governor's balance is
//! always the sum of `total_size` over transfers holding buffers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use beamdrop_shared::{FileMeta, RelayError};

use crate::registry::now_millis;

pub const MAX_MEMORY: u64 = 500 * 1024 * 1024;
pub const WARNING_THRESHOLD: u64 = 400 * 1024 * 1024;
pub const MAX_CONCURRENT_TRANSFERS: usize = 5;

/// Janitor expiry for any transfer record.
pub const TRANSFER_EXPIRY_MS: u64 = 60 * 60 * 1000;
/// Warning-level sweep drops streaming transfers older than this.
pub const WARNING_SWEEP_AGE_MS: u64 = 5 * 60 * 1000;
/// Emergency cleanup keeps only this many newest transfers buffered.
const EMERGENCY_KEEP: usize = 5;
/// Upper bound on a declared chunk count; `totalChunks` is client input.
const MAX_CHUNK_COUNT: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Streaming,
    Completed,
    Rejected,
    Errored,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Rejected
                | TransferStatus::Errored
                | TransferStatus::Cancelled
        )
    }
}

/// Dense indexed chunk buffer. `total_chunks` is fixed by the first chunk
/// seen; a later chunk disagreeing is a protocol violation.
struct ChunkTable {
    total_chunks: u32,
    received: u32,
    slots: Vec<Option<Vec<u8>>>,
}

enum ChunkInsert {
    Progress,
    Complete,
    IndexOutOfRange,
    DivergentTotal,
}

impl ChunkTable {
    fn new(total_chunks: u32) -> Self {
        ChunkTable {
            total_chunks,
            received: 0,
            slots: vec![None; total_chunks as usize],
        }
    }

    fn insert(&mut self, index: u32, total_chunks: u32, payload: Vec<u8>) -> ChunkInsert {
        if total_chunks != self.total_chunks {
            return ChunkInsert::DivergentTotal;
        }
        if index >= self.total_chunks {
            return ChunkInsert::IndexOutOfRange;
        }
        let slot = &mut self.slots[index as usize];
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(payload);
        if self.received == self.total_chunks {
            ChunkInsert::Complete
        } else {
            ChunkInsert::Progress
        }
    }

    fn get(&self, index: u32) -> Option<&[u8]> {
        self.slots
            .get(index as usize)
            .and_then(|s| s.as_deref())
    }

    fn is_complete(&self) -> bool {
        self.received == self.total_chunks
    }

    /// Concatenate all chunks in index order. Call only when complete.
    fn assemble(&self) -> Vec<u8> {
        let len = self.slots.iter().flatten().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for slot in self.slots.iter().flatten() {
            out.extend_from_slice(slot);
        }
        out
    }
}

pub struct Transfer {
    pub id: String,
    pub from_device_id: String,
    pub target_device_id: String,
    pub files: Vec<FileMeta>,
    pub total_size: u64,
    pub status: TransferStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    /// Monotonic recency order for the emergency keep-newest rule.
    seq: u64,
    chunks: Option<ChunkTable>,
    /// Bytes currently charged to the governor; zeroed exactly once.
    charged: u64,
}

impl Transfer {
    pub fn received_chunks(&self) -> u32 {
        self.chunks.as_ref().map(|c| c.received).unwrap_or(0)
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.chunks.as_ref().map(|c| c.total_chunks)
    }
}

/// Process-wide byte and concurrency accounting.
#[derive(Default)]
pub struct Governor {
    memory_in_flight: AtomicU64,
    active_transfers: AtomicUsize,
}

impl Governor {
    pub fn memory_in_flight(&self) -> u64 {
        self.memory_in_flight.load(Ordering::Relaxed)
    }

    pub fn active_transfers(&self) -> usize {
        self.active_transfers.load(Ordering::Relaxed)
    }
}

/// A transfer errored on behalf of a device; the other party gets told.
#[derive(Debug)]
pub struct FailedNotice {
    pub transfer_id: String,
    pub notify_device_id: String,
    pub error: RelayError,
}

/// What ingesting one chunk produced.
pub enum ChunkIngest {
    /// Unknown transfer id: dropped, never allocated retroactively.
    Unknown,
    /// Index outside `[0, totalChunks)`: dropped.
    IgnoredIndex,
    /// Protocol violation or undecodable payload; transfer is now errored.
    Violation { sender: String },
    Progress {
        sender: String,
        received: u32,
        total: u32,
        percent: u8,
    },
    Complete {
        sender: String,
        receiver: String,
        file_name: String,
        file_mime: Option<String>,
        total_chunks: u32,
        data_base64: String,
    },
}

pub struct IngestOutcome {
    pub result: ChunkIngest,
    /// Transfers evicted by a pressure sweep triggered by this chunk.
    pub evicted: Vec<FailedNotice>,
    /// Memory was above the hard cap: caller should also shed idle channels.
    pub emergency: bool,
}

#[derive(Debug)]
pub struct OfferOutcome {
    pub transfer_id: String,
    pub from_device_id: String,
    pub target_device_id: String,
    pub files: Vec<FileMeta>,
    pub total_size: u64,
    pub timestamp: u64,
}

#[derive(Default)]
pub struct TransferTable {
    transfers: RwLock<HashMap<String, Transfer>>,
    pub governor: Governor,
    seq: AtomicU64,
}

impl TransferTable {
    /// Record an offer. Caller-proposed ids are untrusted: an id already
    /// held by a live transfer gets replaced by a freshly minted one,
    /// except that the same sender re-offering to the same target is
    /// treated as a duplicate and answered with the existing transfer.
    pub fn offer(
        &self,
        from: &str,
        target: &str,
        proposed_id: Option<String>,
        files: Vec<FileMeta>,
    ) -> Result<OfferOutcome, RelayError> {
        if files.is_empty() {
            return Err(RelayError::AssemblyFailed);
        }
        let mut transfers = self.transfers.write();

        if self.governor.active_transfers() >= MAX_CONCURRENT_TRANSFERS {
            return Err(RelayError::MemoryExhausted);
        }

        let id = match proposed_id {
            Some(id) => match transfers.get(&id) {
                Some(existing) if !existing.status.is_terminal() => {
                    if existing.from_device_id == from && existing.target_device_id == target {
                        // Duplicate offer for an active transfer: answer
                        // with what we already have.
                        return Ok(OfferOutcome {
                            transfer_id: existing.id.clone(),
                            from_device_id: existing.from_device_id.clone(),
                            target_device_id: existing.target_device_id.clone(),
                            files: existing.files.clone(),
                            total_size: existing.total_size,
                            timestamp: existing.created_at,
                        });
                    }
                    // Collision with someone else's live transfer: mint.
                    format!("transfer-{}", Uuid::new_v4())
                }
                _ => id,
            },
            None => format!("transfer-{}", Uuid::new_v4()),
        };

        let total_size = files[0].size;
        let created_at = now_millis();
        let transfer = Transfer {
            id: id.clone(),
            from_device_id: from.to_string(),
            target_device_id: target.to_string(),
            files: files.clone(),
            total_size,
            status: TransferStatus::Pending,
            created_at,
            started_at: None,
            ended_at: None,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            chunks: None,
            charged: 0,
        };
        self.governor
            .active_transfers
            .fetch_add(1, Ordering::Relaxed);
        transfers.insert(id.clone(), transfer);

        Ok(OfferOutcome {
            transfer_id: id,
            from_device_id: from.to_string(),
            target_device_id: target.to_string(),
            files,
            total_size,
            timestamp: created_at,
        })
    }

    /// Receiver accepted; returns the sender id for the relay.
    pub fn accept(&self, id: &str) -> Option<String> {
        let mut transfers = self.transfers.write();
        let t = transfers.get_mut(id)?;
        if t.status == TransferStatus::Pending {
            t.status = TransferStatus::Accepted;
        }
        Some(t.from_device_id.clone())
    }

    /// Receiver rejected; transfer is erased. Returns the sender id.
    pub fn reject(&self, id: &str) -> Option<String> {
        let mut transfers = self.transfers.write();
        let mut t = transfers.remove(id)?;
        self.finish(&mut t, TransferStatus::Rejected);
        Some(t.from_device_id)
    }

    /// Buffer one chunk. First chunk allocates the table and charges the
    /// governor with the advertised size; completion assembles, frees and
    /// re-encodes once.
    pub fn ingest_chunk(
        &self,
        id: &str,
        from: &str,
        index: u32,
        total_chunks: u32,
        chunk_data: &str,
        file_size: Option<u64>,
    ) -> IngestOutcome {
        let mut transfers = self.transfers.write();

        let Some(t) = transfers.get_mut(id) else {
            debug!(transfer_id = id, "chunk for unknown transfer dropped");
            return IngestOutcome {
                result: ChunkIngest::Unknown,
                evicted: Vec::new(),
                emergency: false,
            };
        };
        if t.status.is_terminal() || t.from_device_id != from || total_chunks == 0 {
            debug!(transfer_id = id, "chunk dropped (terminal, foreign sender or zero total)");
            return IngestOutcome {
                result: ChunkIngest::Unknown,
                evicted: Vec::new(),
                emergency: false,
            };
        }
        if total_chunks > MAX_CHUNK_COUNT {
            let sender = t.from_device_id.clone();
            warn!(transfer_id = id, total_chunks, "declared chunk count over limit");
            self.finish(t, TransferStatus::Errored);
            drop(transfers);
            return self.after_pressure(IngestOutcome {
                result: ChunkIngest::Violation { sender },
                evicted: Vec::new(),
                emergency: false,
            });
        }

        if t.chunks.is_none() {
            if t.total_size == 0 {
                t.total_size = file_size.unwrap_or(0);
            }
            t.chunks = Some(ChunkTable::new(total_chunks));
            t.charged = t.total_size;
            t.status = TransferStatus::Streaming;
            t.started_at = Some(now_millis());
            self.governor
                .memory_in_flight
                .fetch_add(t.charged, Ordering::Relaxed);
        }

        let payload = match decode_chunk(chunk_data) {
            Some(bytes) => bytes,
            None => {
                let sender = t.from_device_id.clone();
                self.finish(t, TransferStatus::Errored);
                drop(transfers);
                return self.after_pressure(IngestOutcome {
                    result: ChunkIngest::Violation { sender },
                    evicted: Vec::new(),
                    emergency: false,
                });
            }
        };

        let table = t.chunks.as_mut().expect("allocated above");
        let result = match table.insert(index, total_chunks, payload) {
            ChunkInsert::DivergentTotal => {
                let sender = t.from_device_id.clone();
                warn!(transfer_id = id, "divergent totalChunks, erroring transfer");
                self.finish(t, TransferStatus::Errored);
                ChunkIngest::Violation { sender }
            }
            ChunkInsert::IndexOutOfRange => {
                debug!(transfer_id = id, index, "chunk index out of range, dropped");
                ChunkIngest::IgnoredIndex
            }
            ChunkInsert::Progress => {
                let received = table.received;
                let percent = ((received as u64 * 100) / total_chunks as u64) as u8;
                ChunkIngest::Progress {
                    sender: t.from_device_id.clone(),
                    received,
                    total: total_chunks,
                    percent,
                }
            }
            ChunkInsert::Complete => {
                let assembled = table.assemble();
                let data_base64 = STANDARD.encode(assembled);
                let sender = t.from_device_id.clone();
                let receiver = t.target_device_id.clone();
                let file_name = t.files[0].name.clone();
                let file_mime = t.files[0].mime.clone();
                self.finish(t, TransferStatus::Completed);
                ChunkIngest::Complete {
                    sender,
                    receiver,
                    file_name,
                    file_mime,
                    total_chunks,
                    data_base64,
                }
            }
        };

        drop(transfers);
        self.after_pressure(IngestOutcome {
            result,
            evicted: Vec::new(),
            emergency: false,
        })
    }

    /// Re-emit still-buffered chunks for the given indices. Unbuffered
    /// indices are silently dropped.
    pub fn missing_chunks(
        &self,
        id: &str,
        indices: &[u32],
    ) -> Option<(String, u32, Vec<(u32, String)>)> {
        let transfers = self.transfers.read();
        let t = transfers.get(id)?;
        let table = t.chunks.as_ref()?;
        let chunks: Vec<(u32, String)> = indices
            .iter()
            .filter_map(|&i| table.get(i).map(|bytes| (i, STANDARD.encode(bytes))))
            .collect();
        Some((t.target_device_id.clone(), table.total_chunks, chunks))
    }

    /// Legacy pull path: deliver the assembled payload while the buffers
    /// still exist (i.e. the stream is complete but not yet finished).
    pub fn download(&self, id: &str) -> Option<(String, Option<String>, String)> {
        let transfers = self.transfers.read();
        let t = transfers.get(id)?;
        let table = t.chunks.as_ref()?;
        if !table.is_complete() {
            return None;
        }
        Some((
            t.files[0].name.clone(),
            t.files[0].mime.clone(),
            STANDARD.encode(table.assemble()),
        ))
    }

    /// Sender id for relaying receiver-reported progress.
    pub fn sender_of(&self, id: &str) -> Option<String> {
        let transfers = self.transfers.read();
        transfers
            .get(id)
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.from_device_id.clone())
    }

    /// A party signalled completion; free buffers.
    pub fn complete_signal(&self, id: &str) {
        let mut transfers = self.transfers.write();
        if let Some(t) = transfers.get_mut(id) {
            self.finish(t, TransferStatus::Completed);
        }
    }

    /// Abort and delete a transfer.
    pub fn cancel(&self, id: &str) -> bool {
        let mut transfers = self.transfers.write();
        match transfers.remove(id) {
            Some(mut t) => {
                self.finish(&mut t, TransferStatus::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Force-release from the HTTP surface.
    pub fn force_release(&self, id: &str) -> bool {
        self.cancel(id)
    }

    /// A device's channel closed: error every live transfer it is part of
    /// and tell the surviving party.
    pub fn fail_for_device(&self, device_id: &str) -> Vec<FailedNotice> {
        let mut transfers = self.transfers.write();
        let mut notices = Vec::new();
        for t in transfers.values_mut() {
            if t.status.is_terminal() {
                continue;
            }
            if t.from_device_id == device_id {
                notices.push(FailedNotice {
                    transfer_id: t.id.clone(),
                    notify_device_id: t.target_device_id.clone(),
                    error: RelayError::SenderUnavailable,
                });
                self.finish(t, TransferStatus::Errored);
            } else if t.target_device_id == device_id {
                notices.push(FailedNotice {
                    transfer_id: t.id.clone(),
                    notify_device_id: t.from_device_id.clone(),
                    error: RelayError::TargetOffline,
                });
                self.finish(t, TransferStatus::Errored);
            }
        }
        notices
    }

    /// Janitor expiry: error live transfers past the deadline and drop
    /// terminal records of the same age.
    pub fn sweep_expired(&self, now: u64) -> usize {
        let mut transfers = self.transfers.write();
        let mut swept = 0;
        transfers.retain(|_, t| {
            if now.saturating_sub(t.created_at) <= TRANSFER_EXPIRY_MS {
                return true;
            }
            self.finish(t, TransferStatus::Errored);
            swept += 1;
            false
        });
        swept
    }

    pub fn len(&self) -> usize {
        self.transfers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.read().is_empty()
    }

    /// Terminal transition: idempotent, frees buffers and returns charged
    /// bytes exactly once.
    fn finish(&self, t: &mut Transfer, status: TransferStatus) {
        if t.status.is_terminal() {
            return;
        }
        t.status = status;
        t.ended_at = Some(now_millis());
        t.chunks = None;
        if t.charged > 0 {
            self.governor
                .memory_in_flight
                .fetch_sub(t.charged, Ordering::Relaxed);
            t.charged = 0;
        }
        self.governor
            .active_transfers
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Apply the governor's pressure rules after a charge.
    fn after_pressure(&self, mut outcome: IngestOutcome) -> IngestOutcome {
        let in_flight = self.governor.memory_in_flight();
        if in_flight > MAX_MEMORY {
            outcome.evicted = self.emergency_cleanup();
            outcome.emergency = true;
        } else if in_flight > WARNING_THRESHOLD {
            outcome.evicted = self.warning_sweep(now_millis());
        }
        outcome
    }

    /// Keep the newest transfers buffered, error everything older.
    fn emergency_cleanup(&self) -> Vec<FailedNotice> {
        let mut transfers = self.transfers.write();
        let mut buffered: Vec<(u64, String)> = transfers
            .values()
            .filter(|t| t.chunks.is_some())
            .map(|t| (t.seq, t.id.clone()))
            .collect();
        buffered.sort_by(|a, b| b.0.cmp(&a.0));
        let victims: Vec<String> = buffered
            .into_iter()
            .skip(EMERGENCY_KEEP)
            .map(|(_, id)| id)
            .collect();
        let mut notices = Vec::new();
        for id in victims {
            if let Some(t) = transfers.get_mut(&id) {
                notices.push(FailedNotice {
                    transfer_id: t.id.clone(),
                    notify_device_id: t.from_device_id.clone(),
                    error: RelayError::MemoryExhausted,
                });
                self.finish(t, TransferStatus::Errored);
            }
        }
        if !notices.is_empty() {
            warn!(
                released = notices.len(),
                in_flight = self.governor.memory_in_flight(),
                "emergency cleanup released transfer buffers"
            );
        }
        notices
    }

    /// Above the warning threshold: drop streaming transfers older than
    /// five minutes.
    fn warning_sweep(&self, now: u64) -> Vec<FailedNotice> {
        let mut transfers = self.transfers.write();
        let mut notices = Vec::new();
        for t in transfers.values_mut() {
            if t.chunks.is_some() && now.saturating_sub(t.created_at) > WARNING_SWEEP_AGE_MS {
                notices.push(FailedNotice {
                    transfer_id: t.id.clone(),
                    notify_device_id: t.from_device_id.clone(),
                    error: RelayError::MemoryExhausted,
                });
                self.finish(t, TransferStatus::Errored);
            }
        }
        notices
    }
}

/// Strip any data-URL prefix and non-alphabet bytes, then decode. Senders
/// are not trusted to produce clean base64.
fn decode_chunk(data: &str) -> Option<Vec<u8>> {
    let tail = match data.find(',') {
        Some(pos) => &data[pos + 1..],
        None => data,
    };
    let cleaned: String = tail
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '+' || *c == '/')
        .collect();
    if cleaned.is_empty() && !tail.trim_end_matches('=').is_empty() {
        return None;
    }
    STANDARD_NO_PAD.decode(cleaned.as_bytes()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, size: u64) -> FileMeta {
        FileMeta {
            name: name.to_string(),
            size,
            mime: Some("text/plain".to_string()),
        }
    }

    fn b64(s: &str) -> String {
        STANDARD.encode(s.as_bytes())
    }

    #[test]
    fn chunk_table_counts_and_assembles_in_index_order() {
        let mut table = ChunkTable::new(3);
        assert!(matches!(
            table.insert(2, 3, b"ghi".to_vec()),
            ChunkInsert::Progress
        ));
        assert!(matches!(
            table.insert(0, 3, b"abc".to_vec()),
            ChunkInsert::Progress
        ));
        assert_eq!(table.received, 2);
        assert!(matches!(
            table.insert(1, 3, b"def".to_vec()),
            ChunkInsert::Complete
        ));
        assert_eq!(table.assemble(), b"abcdefghi".to_vec());
    }

    #[test]
    fn duplicate_chunk_does_not_double_count() {
        let mut table = ChunkTable::new(2);
        table.insert(0, 2, b"aa".to_vec());
        table.insert(0, 2, b"aa".to_vec());
        assert_eq!(table.received, 1);
    }

    #[test]
    fn decode_chunk_strips_data_url_prefix() {
        let raw = format!("data:text/plain;base64,{}", b64("abc"));
        assert_eq!(decode_chunk(&raw).unwrap(), b"abc".to_vec());
    }

    #[test]
    fn decode_chunk_accepts_padded_and_unpadded() {
        assert_eq!(decode_chunk("YWJjZA==").unwrap(), b"abcd".to_vec());
        assert_eq!(decode_chunk("YWJjZA").unwrap(), b"abcd".to_vec());
        assert_eq!(decode_chunk("YW Jj\nZA==").unwrap(), b"abcd".to_vec());
    }

    #[test]
    fn offer_then_stream_out_of_order_completes_once() {
        let table = TransferTable::default();
        let offer = table
            .offer("device-a", "device-b", Some("t1".into()), vec![meta("x.txt", 9)])
            .unwrap();
        assert_eq!(offer.transfer_id, "t1");
        assert_eq!(table.governor.active_transfers(), 1);

        // Chunks arrive 2, 0, 1.
        let o = table.ingest_chunk("t1", "device-a", 2, 3, &b64("ghi"), Some(9));
        match o.result {
            ChunkIngest::Progress { received, total, percent, .. } => {
                assert_eq!((received, total, percent), (1, 3, 33));
            }
            _ => panic!("expected progress"),
        }
        assert_eq!(table.governor.memory_in_flight(), 9);

        let o = table.ingest_chunk("t1", "device-a", 0, 3, &b64("abc"), Some(9));
        assert!(matches!(o.result, ChunkIngest::Progress { percent: 66, .. }));

        let o = table.ingest_chunk("t1", "device-a", 1, 3, &b64("def"), Some(9));
        match o.result {
            ChunkIngest::Complete { receiver, data_base64, .. } => {
                assert_eq!(receiver, "device-b");
                assert_eq!(data_base64, b64("abcdefghi"));
            }
            _ => panic!("expected completion"),
        }

        // Terminal: buffers freed, balance restored, cap slot returned.
        assert_eq!(table.governor.memory_in_flight(), 0);
        assert_eq!(table.governor.active_transfers(), 0);
    }

    #[test]
    fn unknown_transfer_chunks_never_allocate() {
        let table = TransferTable::default();
        let o = table.ingest_chunk("nope", "device-a", 0, 3, &b64("abc"), Some(9));
        assert!(matches!(o.result, ChunkIngest::Unknown));
        assert_eq!(table.governor.memory_in_flight(), 0);
    }

    #[test]
    fn divergent_total_chunks_errors_and_releases() {
        let table = TransferTable::default();
        table
            .offer("device-a", "device-b", Some("t1".into()), vec![meta("x", 9)])
            .unwrap();
        table.ingest_chunk("t1", "device-a", 0, 3, &b64("abc"), Some(9));
        let o = table.ingest_chunk("t1", "device-a", 1, 4, &b64("def"), Some(9));
        assert!(matches!(o.result, ChunkIngest::Violation { .. }));
        assert_eq!(table.governor.memory_in_flight(), 0);
        // Re-entrant terminal transition is a no-op.
        table.complete_signal("t1");
        assert_eq!(table.governor.memory_in_flight(), 0);
    }

    #[test]
    fn missing_chunks_reemits_only_buffered() {
        let table = TransferTable::default();
        table
            .offer("device-a", "device-b", Some("t1".into()), vec![meta("x", 9)])
            .unwrap();
        table.ingest_chunk("t1", "device-a", 0, 3, &b64("abc"), Some(9));
        table.ingest_chunk("t1", "device-a", 2, 3, &b64("ghi"), Some(9));

        let (receiver, total, chunks) = table.missing_chunks("t1", &[0, 1, 2]).unwrap();
        assert_eq!(receiver, "device-b");
        assert_eq!(total, 3);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (0, b64("abc")));
        assert_eq!(chunks[1], (2, b64("ghi")));
    }

    #[test]
    fn concurrency_cap_rejects_sixth_offer() {
        let table = TransferTable::default();
        for i in 0..MAX_CONCURRENT_TRANSFERS {
            table
                .offer("device-a", "device-b", Some(format!("t{i}")), vec![meta("x", 1)])
                .unwrap();
        }
        let err = table
            .offer("device-a", "device-b", Some("t9".into()), vec![meta("x", 1)])
            .unwrap_err();
        assert_eq!(err, RelayError::MemoryExhausted);
    }

    #[test]
    fn foreign_id_collision_gets_minted_id() {
        let table = TransferTable::default();
        table
            .offer("device-a", "device-b", Some("t1".into()), vec![meta("x", 1)])
            .unwrap();
        let second = table
            .offer("device-c", "device-d", Some("t1".into()), vec![meta("y", 1)])
            .unwrap();
        assert_ne!(second.transfer_id, "t1");

        // Same sender re-offering is deduped to the live transfer.
        let dup = table
            .offer("device-a", "device-b", Some("t1".into()), vec![meta("x", 1)])
            .unwrap();
        assert_eq!(dup.transfer_id, "t1");
        assert_eq!(table.governor.active_transfers(), 2);
    }

    #[test]
    fn emergency_cleanup_keeps_five_newest() {
        let table = TransferTable::default();
        let size: u64 = 120 * 1024 * 1024;
        // Six streams of 120 MiB: the sixth pushes past the 500 MiB cap.
        // The cap admits five offers at a time, so finish one stream first.
        for i in 0..3 {
            table
                .offer("device-a", "device-b", Some(format!("t{i}")), vec![meta("x", size)])
                .unwrap();
            table.ingest_chunk(&format!("t{i}"), "device-a", 0, 2, &b64("zz"), None);
        }
        // 360 MiB in flight; the next charge crosses 400 MiB warning but
        // nothing is older than 5 minutes, then the following crosses 500.
        table
            .offer("device-a", "device-b", Some("t3".into()), vec![meta("x", size)])
            .unwrap();
        let o = table.ingest_chunk("t3", "device-a", 0, 2, &b64("zz"), None);
        assert!(!o.emergency);
        assert!(o.evicted.is_empty());

        table
            .offer("device-a", "device-b", Some("t4".into()), vec![meta("x", size)])
            .unwrap();
        let o = table.ingest_chunk("t4", "device-a", 0, 2, &b64("zz"), None);
        assert!(o.emergency);
        // Exactly five buffered transfers all fall inside the keep-newest
        // window, so none is evicted; the caller still sheds idle channels.
        assert!(o.evicted.is_empty());
        assert_eq!(table.governor.active_transfers(), 5);
        assert_eq!(table.governor.memory_in_flight(), 5 * size);
    }

    #[test]
    fn warning_sweep_drops_stale_streams() {
        let table = TransferTable::default();
        table
            .offer("device-a", "device-b", Some("old".into()), vec![meta("x", 10)])
            .unwrap();
        table.ingest_chunk("old", "device-a", 0, 2, &b64("zz"), None);
        table
            .offer("device-a", "device-b", Some("new".into()), vec![meta("y", 10)])
            .unwrap();
        table.ingest_chunk("new", "device-a", 0, 2, &b64("zz"), None);

        // Pretend the first stream has been sitting for six minutes.
        {
            let mut transfers = table.transfers.write();
            transfers.get_mut("old").unwrap().created_at -= WARNING_SWEEP_AGE_MS + 1000;
        }
        let notices = table.warning_sweep(now_millis());
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].transfer_id, "old");
        assert_eq!(table.governor.memory_in_flight(), 10);
    }

    #[test]
    fn peer_disconnect_errors_both_roles() {
        let table = TransferTable::default();
        table
            .offer("device-a", "device-b", Some("out".into()), vec![meta("x", 9)])
            .unwrap();
        table
            .offer("device-c", "device-a", Some("in".into()), vec![meta("y", 9)])
            .unwrap();
        table.ingest_chunk("out", "device-a", 0, 5, &b64("abc"), Some(9));

        let notices = table.fail_for_device("device-a");
        assert_eq!(notices.len(), 2);
        let for_b = notices.iter().find(|n| n.notify_device_id == "device-b").unwrap();
        assert_eq!(for_b.error, RelayError::SenderUnavailable);
        let for_c = notices.iter().find(|n| n.notify_device_id == "device-c").unwrap();
        assert_eq!(for_c.error, RelayError::TargetOffline);
        assert_eq!(table.governor.memory_in_flight(), 0);
        assert_eq!(table.governor.active_transfers(), 0);
    }

    #[test]
    fn reject_erases_and_cancel_deletes() {
        let table = TransferTable::default();
        table
            .offer("device-a", "device-b", Some("t1".into()), vec![meta("x", 9)])
            .unwrap();
        assert_eq!(table.reject("t1"), Some("device-a".to_string()));
        assert!(table.is_empty());

        table
            .offer("device-a", "device-b", Some("t2".into()), vec![meta("x", 9)])
            .unwrap();
        table.ingest_chunk("t2", "device-a", 0, 2, &b64("ab"), Some(9));
        assert!(table.cancel("t2"));
        assert!(table.is_empty());
        assert_eq!(table.governor.memory_in_flight(), 0);
    }

    #[test]
    fn sweep_expired_errors_old_transfers() {
        let table = TransferTable::default();
        table
            .offer("device-a", "device-b", Some("t1".into()), vec![meta("x", 9)])
            .unwrap();
        table.ingest_chunk("t1", "device-a", 0, 2, &b64("ab"), Some(9));
        assert_eq!(table.sweep_expired(now_millis() + TRANSFER_EXPIRY_MS + 1), 1);
        assert!(table.is_empty());
        assert_eq!(table.governor.memory_in_flight(), 0);
    }
}
