use fieldgate::config::PersistenceConfig;
use fieldgate::packet::{Packet, QosLevel};
use fieldgate::spill::{encode_frame, SpillQueue};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

mod common;

fn spill_config(dir: &Path, max_file_size: u64, max_file_count: usize) -> PersistenceConfig {
    PersistenceConfig {
        path: dir.to_path_buf(),
        max_file_size,
        max_file_count,
    }
}

fn packet(n: u8) -> Packet {
    Packet::new("t", QosLevel::AtLeastOnce, vec![n; 8])
}

fn newest_spill_file(dir: &Path) -> std::path::PathBuf {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("spill-"))
        })
        .collect();
    paths.sort();
    paths.pop().unwrap()
}

#[test]
fn spill_checkpoint_restart_resumes_past_consumed_records() {
    let dir = tempfile::tempdir().unwrap();
    let config = spill_config(dir.path(), 4096, 8);

    let mut queue = SpillQueue::open(&config).unwrap();
    for n in 1..=5 {
        queue.append(&packet(n)).unwrap();
    }
    let first = queue.read_next().unwrap().unwrap();
    let second = queue.read_next().unwrap().unwrap();
    queue.mark_consumed(second.sequence).unwrap();
    assert_eq!(first.packet.payload, vec![1; 8]);
    queue.close().unwrap();

    // a fresh process sees only the unconsumed suffix, bytes and
    // sequence numbers intact, in order
    let mut queue = SpillQueue::open(&config).unwrap();
    let mut replayed = Vec::new();
    while let Some(record) = queue.read_next().unwrap() {
        assert_eq!(record.packet.topic, "t");
        replayed.push((record.sequence, record.packet.payload.clone()));
    }
    let expected: Vec<_> = (3u64..=5).map(|n| (n, vec![n as u8; 8])).collect();
    assert_eq!(replayed, expected);
    assert!(!queue.has_unread());
}

#[test]
fn spill_checkpoint_ring_evicts_oldest_files_first() {
    let dir = tempfile::tempdir().unwrap();
    // one 32-byte frame per file
    let config = spill_config(dir.path(), 40, 3);

    let mut queue = SpillQueue::open(&config).unwrap();
    let mut evictions = 0;
    for n in 1..=5 {
        let outcome = queue.append(&packet(n)).unwrap();
        if outcome.evicted.is_some() {
            evictions += 1;
        }
    }
    assert_eq!(evictions, 2);
    assert_eq!(queue.lost_files(), 2);
    assert_eq!(queue.file_count(), 3);

    // the survivors are the newest records, still in order
    let mut replayed = Vec::new();
    while let Some(record) = queue.read_next().unwrap() {
        replayed.push(record.packet.payload[0]);
    }
    assert_eq!(replayed, vec![3, 4, 5]);
}

#[test]
fn spill_checkpoint_torn_tail_is_truncated_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = spill_config(dir.path(), 4096, 8);

    let mut queue = SpillQueue::open(&config).unwrap();
    for n in 1..=3 {
        queue.append(&packet(n)).unwrap();
    }
    queue.close().unwrap();

    // simulate a crash mid-append: half a frame at the tail
    let frame = encode_frame(4, &packet(4));
    let path = newest_spill_file(dir.path());
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&frame[..frame.len() / 2]).unwrap();
    drop(file);

    let mut queue = SpillQueue::open(&config).unwrap();
    assert_eq!(queue.corrupt_records(), 1);
    let mut replayed = Vec::new();
    while let Some(record) = queue.read_next().unwrap() {
        replayed.push(record.packet.payload[0]);
    }
    assert_eq!(replayed, vec![1, 2, 3]);

    // appends resume on the clean boundary with a fresh sequence
    let outcome = queue.append(&packet(9)).unwrap();
    assert_eq!(outcome.sequence, 4);
    let record = queue.read_next().unwrap().unwrap();
    assert_eq!(record.packet.payload, vec![9; 8]);
}

#[test]
fn spill_checkpoint_reads_records_appended_after_eof() {
    let dir = tempfile::tempdir().unwrap();
    let config = spill_config(dir.path(), 4096, 8);

    let mut queue = SpillQueue::open(&config).unwrap();
    queue.append(&packet(1)).unwrap();
    assert_eq!(queue.read_next().unwrap().unwrap().sequence, 1);
    assert!(queue.read_next().unwrap().is_none());

    queue.append(&packet(2)).unwrap();
    assert!(queue.has_unread());
    assert_eq!(queue.read_next().unwrap().unwrap().sequence, 2);
}

#[test]
fn spill_checkpoint_acknowledged_files_are_pruned() {
    let dir = tempfile::tempdir().unwrap();
    let config = spill_config(dir.path(), 40, 8);

    let mut queue = SpillQueue::open(&config).unwrap();
    for n in 1..=4 {
        queue.append(&packet(n)).unwrap();
    }
    assert_eq!(queue.file_count(), 4);
    queue.read_next().unwrap().unwrap();
    queue.read_next().unwrap().unwrap();
    queue.mark_consumed(2).unwrap();
    // files holding only consumed records are gone; replay continues
    assert!(queue.file_count() < 4);
    assert_eq!(queue.read_next().unwrap().unwrap().sequence, 3);
}
