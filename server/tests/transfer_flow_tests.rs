//! Transfer engine flows: offer → accept → chunk stream → completion,
//! out-of-order arrival, gap recovery, and governor accounting.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use beamdrop_server::transfer::{ChunkIngest, TransferTable, MAX_CONCURRENT_TRANSFERS};
use beamdrop_shared::{FileMeta, RelayError};

fn meta(name: &str, size: u64) -> Vec<FileMeta> {
    vec![FileMeta {
        name: name.to_string(),
        size,
        mime: Some("text/plain".to_string()),
    }]
}

fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Happy-path small transfer: three chunks in order, one `fileComplete`
/// with the assembled payload, balance restored.
#[test]
fn small_transfer_in_order() {
    let table = TransferTable::default();
    let before = table.governor.memory_in_flight();

    let offer = table
        .offer("device-a1b", "device-c2d", Some("t1".into()), meta("x.txt", 9))
        .unwrap();
    assert_eq!(offer.transfer_id, "t1");
    assert_eq!(offer.total_size, 9);

    assert_eq!(table.accept("t1"), Some("device-a1b".to_string()));

    let parts: [&[u8]; 3] = [b"abc", b"def", b"ghi"];
    let mut completed = None;
    for (i, part) in parts.iter().enumerate() {
        let out = table.ingest_chunk("t1", "device-a1b", i as u32, 3, &b64(part), Some(9));
        if let ChunkIngest::Complete { data_base64, receiver, .. } = out.result {
            completed = Some((data_base64, receiver));
        }
    }

    let (data, receiver) = completed.expect("transfer should complete on the last chunk");
    assert_eq!(receiver, "device-c2d");
    assert_eq!(data, b64(b"abcdefghi"));
    assert_eq!(table.governor.memory_in_flight(), before);
}

/// Out-of-order arrival: chunks 2, 0, 1 produce the same payload, and
/// progress reflects receipt count, not the highest index.
#[test]
fn out_of_order_chunks_reassemble_identically() {
    let table = TransferTable::default();
    table
        .offer("device-a1b", "device-c2d", Some("t1".into()), meta("x.txt", 9))
        .unwrap();
    table.accept("t1");

    let order: [(u32, &[u8]); 3] = [(2, b"ghi"), (0, b"abc"), (1, b"def")];
    let mut percents = Vec::new();
    let mut payload = None;
    for (index, part) in order {
        let out = table.ingest_chunk("t1", "device-a1b", index, 3, &b64(part), Some(9));
        match out.result {
            ChunkIngest::Progress { percent, .. } => percents.push(percent),
            ChunkIngest::Complete { data_base64, .. } => {
                percents.push(100);
                payload = Some(data_base64);
            }
            other => panic!("unexpected outcome: {}", outcome_name(&other)),
        }
    }

    assert_eq!(percents, vec![33, 66, 100]);
    assert_eq!(payload.unwrap(), b64(b"abcdefghi"));
}

/// Round-trip law: any permutation of chunks with uneven sizes yields the
/// concatenation in index order.
#[test]
fn permuted_uneven_chunks_round_trip() {
    let parts: [&[u8]; 5] = [b"a", b"bc", b"def", b"gh", b"i"];
    let permutation = [3usize, 0, 4, 1, 2];

    let table = TransferTable::default();
    table
        .offer("device-a", "device-b", Some("t1".into()), meta("y.bin", 9))
        .unwrap();

    let mut payload = None;
    for &i in &permutation {
        let out = table.ingest_chunk("t1", "device-a", i as u32, 5, &b64(parts[i]), Some(9));
        if let ChunkIngest::Complete { data_base64, .. } = out.result {
            payload = Some(data_base64);
        }
    }
    assert_eq!(payload.unwrap(), b64(b"abcdefghi"));
}

/// Gap recovery: of a requested set, exactly the still-buffered indices
/// are re-emitted; the transfer completes once the sender fills the gap.
#[test]
fn missing_chunk_recovery() {
    let table = TransferTable::default();
    table
        .offer("device-a", "device-b", Some("t1".into()), meta("x.txt", 9))
        .unwrap();

    table.ingest_chunk("t1", "device-a", 0, 3, &b64(b"abc"), Some(9));
    table.ingest_chunk("t1", "device-a", 2, 3, &b64(b"ghi"), Some(9));

    // Receiver asks for 0 and 1; only 0 is buffered.
    let (receiver, total, chunks) = table.missing_chunks("t1", &[0, 1]).unwrap();
    assert_eq!(receiver, "device-b");
    assert_eq!(total, 3);
    assert_eq!(chunks, vec![(0, b64(b"abc"))]);

    // The sender fills the gap and the transfer completes.
    let out = table.ingest_chunk("t1", "device-a", 1, 3, &b64(b"def"), Some(9));
    assert!(matches!(out.result, ChunkIngest::Complete { .. }));
}

/// Completion is exactly-once: a straggler chunk after the terminal
/// transition is dropped, not re-completed.
#[test]
fn completion_is_exactly_once() {
    let table = TransferTable::default();
    table
        .offer("device-a", "device-b", Some("t1".into()), meta("x.txt", 3))
        .unwrap();

    let out = table.ingest_chunk("t1", "device-a", 0, 1, &b64(b"abc"), Some(3));
    assert!(matches!(out.result, ChunkIngest::Complete { .. }));

    let out = table.ingest_chunk("t1", "device-a", 0, 1, &b64(b"abc"), Some(3));
    assert!(matches!(out.result, ChunkIngest::Unknown));
    assert_eq!(table.governor.memory_in_flight(), 0);
}

/// Data-URL prefixes and whitespace survive sanitation.
#[test]
fn dirty_base64_is_normalized() {
    let table = TransferTable::default();
    table
        .offer("device-a", "device-b", Some("t1".into()), meta("x.txt", 6))
        .unwrap();

    let chunk0 = format!("data:application/octet-stream;base64,{}", b64(b"abc"));
    table.ingest_chunk("t1", "device-a", 0, 2, &chunk0, Some(6));
    let chunk1 = format!("{}\n", b64(b"def"));
    let out = table.ingest_chunk("t1", "device-a", 1, 2, &chunk1, Some(6));

    match out.result {
        ChunkIngest::Complete { data_base64, .. } => assert_eq!(data_base64, b64(b"abcdef")),
        other => panic!("unexpected outcome: {}", outcome_name(&other)),
    }
}

/// The receiver's decision frames flow back to the sender, and a rejected
/// transfer is erased.
#[test]
fn accept_and_reject_relay_to_sender() {
    let table = TransferTable::default();
    table
        .offer("device-a", "device-b", Some("t1".into()), meta("x.txt", 9))
        .unwrap();
    assert_eq!(table.accept("t1"), Some("device-a".to_string()));

    table
        .offer("device-a", "device-b", Some("t2".into()), meta("y.txt", 9))
        .unwrap();
    assert_eq!(table.reject("t2"), Some("device-a".to_string()));
    assert_eq!(table.reject("t2"), None);
    assert_eq!(table.len(), 1);
}

/// The concurrency cap holds across mixed terminal transitions.
#[test]
fn cap_frees_slots_on_terminal_transitions() {
    let table = TransferTable::default();
    for i in 0..MAX_CONCURRENT_TRANSFERS {
        table
            .offer("device-a", "device-b", Some(format!("t{i}")), meta("x", 1))
            .unwrap();
    }
    assert_eq!(
        table
            .offer("device-a", "device-b", None, meta("x", 1))
            .unwrap_err(),
        RelayError::MemoryExhausted
    );

    table.cancel("t0");
    table.reject("t1");
    table.complete_signal("t2");
    assert_eq!(table.governor.active_transfers(), 2);

    table
        .offer("device-a", "device-b", Some("t5".into()), meta("x", 1))
        .unwrap();
}

/// Receiver vanishing mid-stream: sender is told, buffers released,
/// governor decremented by the advertised size.
#[test]
fn receiver_disconnect_mid_stream() {
    let table = TransferTable::default();
    table
        .offer("device-a", "device-b", Some("t1".into()), meta("big.bin", 500))
        .unwrap();
    for i in 0..3u32 {
        table.ingest_chunk("t1", "device-a", i, 5, &b64(b"xx"), Some(500));
    }
    assert_eq!(table.governor.memory_in_flight(), 500);

    let notices = table.fail_for_device("device-b");
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].notify_device_id, "device-a");
    assert_eq!(notices[0].error, RelayError::TargetOffline);
    assert_eq!(table.governor.memory_in_flight(), 0);
    assert_eq!(table.governor.active_transfers(), 0);
}

fn outcome_name(outcome: &ChunkIngest) -> &'static str {
    match outcome {
        ChunkIngest::Unknown => "unknown",
        ChunkIngest::IgnoredIndex => "ignored-index",
        ChunkIngest::Violation { .. } => "violation",
        ChunkIngest::Progress { .. } => "progress",
        ChunkIngest::Complete { .. } => "complete",
    }
}
