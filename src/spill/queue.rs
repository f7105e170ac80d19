use crate::config::PersistenceConfig;
use crate::packet::Packet;
use crate::spill::cursor::CursorFile;
use crate::spill::file::{self, SpillFileWriter};
use crate::spill::record::{encode_frame, SpillRecord};
use log::warn;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone)]
struct SpillFileRef {
    first_sequence: u64,
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub sequence: u64,
    /// Oldest file deleted to honor `max_file_count`. Its records are
    /// permanently lost; the bounded-loss policy under sustained
    /// disconnection, not a failure.
    pub evicted: Option<PathBuf>,
}

/// Durable, file-rotated FIFO queue of packets. Records are length-prefixed
/// CRC frames appended to `spill-<seq>.log` files; the replay position is
/// rebuilt after a crash from file names, frame contents, and the persisted
/// cursor alone.
#[derive(Debug)]
pub struct SpillQueue {
    dir: PathBuf,
    max_file_size: u64,
    max_file_count: usize,
    files: Vec<SpillFileRef>,
    writer: Option<SpillFileWriter>,
    next_sequence: u64,
    consumed: u64,
    acked: BTreeSet<u64>,
    cursor: CursorFile,
    read_idx: usize,
    read_off: usize,
    read_cache: Vec<u8>,
    read_cache_valid: bool,
    last_returned: u64,
    lost_files: u64,
    corrupt_records: u64,
}

impl SpillQueue {
    pub fn open(config: &PersistenceConfig) -> Result<Self, SpillError> {
        fs::create_dir_all(&config.path)?;
        let mut files = Vec::new();
        for entry in fs::read_dir(&config.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(first_sequence) = file::parse_file_name(name) {
                files.push(SpillFileRef {
                    first_sequence,
                    path: entry.path(),
                });
            }
        }
        files.sort_by_key(|f| f.first_sequence);

        let cursor = CursorFile::new(&config.path);
        let consumed = cursor.load();
        let mut next_sequence = consumed + 1;
        let mut corrupt_records = 0;

        // A crash mid-append leaves at most one torn frame at the tail of
        // the newest file. Cut it off so appends resume on a clean boundary.
        if let Some(last) = files.last() {
            let (last_sequence, valid_len, torn) = scan_tail(&last.path)?;
            if torn {
                warn!(
                    "truncating torn spill record at {} offset {valid_len}",
                    last.path.display()
                );
                let file = OpenOptions::new().write(true).open(&last.path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
                corrupt_records += 1;
            }
            match last_sequence {
                Some(sequence) => next_sequence = next_sequence.max(sequence + 1),
                None => next_sequence = next_sequence.max(last.first_sequence),
            }
        }

        Ok(Self {
            dir: config.path.clone(),
            max_file_size: config.max_file_size,
            max_file_count: config.max_file_count,
            files,
            writer: None,
            next_sequence,
            consumed,
            acked: BTreeSet::new(),
            cursor,
            read_idx: 0,
            read_off: 0,
            read_cache: Vec::new(),
            read_cache_valid: false,
            last_returned: consumed,
            lost_files: 0,
            corrupt_records,
        })
    }

    /// Appends a packet as the next sequence-numbered record. The record is
    /// flushed to stable storage before this returns.
    pub fn append(&mut self, packet: &Packet) -> Result<AppendOutcome, SpillError> {
        let sequence = self.next_sequence;
        let frame = encode_frame(sequence, packet);
        self.ensure_writer()?;
        let mut evicted = None;
        let needs_rotation = {
            let writer = self.writer.as_ref().expect("writer ensured above");
            !writer.is_empty() && writer.len() + frame.len() as u64 > self.max_file_size
        };
        if needs_rotation {
            let sealed = self.writer.take().expect("writer ensured above");
            sealed.seal()?;
            let writer = SpillFileWriter::create(&self.dir, sequence)?;
            self.files.push(SpillFileRef {
                first_sequence: sequence,
                path: writer.path().to_path_buf(),
            });
            self.writer = Some(writer);
            evicted = self.enforce_file_limit()?;
        }
        self.writer
            .as_mut()
            .expect("writer ensured above")
            .append(&frame)?;
        self.next_sequence += 1;
        Ok(AppendOutcome { sequence, evicted })
    }

    /// Returns records in file-creation then in-file sequence order,
    /// skipping already-consumed sequences. Does not remove bytes from
    /// disk. A malformed frame discards the rest of its file and replay
    /// continues with the next one.
    pub fn read_next(&mut self) -> Result<Option<SpillRecord>, SpillError> {
        loop {
            let Some(file_ref) = self.files.get(self.read_idx) else {
                return Ok(None);
            };
            let is_active = self.read_idx + 1 == self.files.len();
            if !self.read_cache_valid {
                self.read_cache = fs::read(&file_ref.path)?;
                self.read_cache_valid = true;
            } else if self.read_off >= self.read_cache.len() && is_active {
                // the active file may have grown since the last load
                self.read_cache = fs::read(&file_ref.path)?;
            }
            while self.read_off < self.read_cache.len() {
                match SpillRecord::decode(&self.read_cache[self.read_off..]) {
                    Ok((record, used)) => {
                        self.read_off += used;
                        if record.sequence <= self.consumed {
                            continue;
                        }
                        self.last_returned = record.sequence;
                        return Ok(Some(record));
                    }
                    Err(err) => {
                        warn!(
                            "corrupt spill record in {}: {err}; discarding rest of file",
                            file_ref.path.display()
                        );
                        self.corrupt_records += 1;
                        self.read_off = self.read_cache.len();
                        break;
                    }
                }
            }
            if self.read_idx + 1 < self.files.len() {
                self.read_idx += 1;
                self.read_off = 0;
                self.read_cache_valid = false;
                continue;
            }
            return Ok(None);
        }
    }

    /// Persists the replay low-water mark. Restart resumes exactly after
    /// the highest consumed sequence; fully-acknowledged sealed files are
    /// deleted. Callers that receive acknowledgements one record at a time
    /// should use [`acknowledge`](Self::acknowledge) instead, which refuses
    /// to move the mark past a still-unacknowledged record.
    pub fn mark_consumed(&mut self, sequence: u64) -> Result<(), SpillError> {
        if sequence <= self.consumed {
            return Ok(());
        }
        self.consumed = sequence;
        self.cursor.store(sequence)?;
        self.prune_consumed()?;
        Ok(())
    }

    /// Records one acknowledged replay sequence. The low-water mark advances
    /// only over contiguous runs of acknowledged sequences, so acks arriving
    /// out of order never skip an earlier record that is still in flight.
    /// Sequences below the oldest surviving file were evicted and cannot be
    /// re-read, so they do not hold the mark back.
    pub fn acknowledge(&mut self, sequence: u64) -> Result<(), SpillError> {
        if sequence <= self.consumed {
            return Ok(());
        }
        self.acked.insert(sequence);
        let evicted_below = self
            .files
            .first()
            .map_or(self.consumed, |f| f.first_sequence.saturating_sub(1));
        let mut advanced = self.consumed.max(evicted_below);
        while self.acked.contains(&(advanced + 1)) {
            advanced += 1;
        }
        self.acked = self.acked.split_off(&(advanced + 1));
        if advanced > self.consumed {
            self.consumed = advanced;
            self.cursor.store(advanced)?;
            self.prune_consumed()?;
        }
        Ok(())
    }

    /// Resets the in-memory read position to just past the low-water mark.
    /// Called on reconnect so unacknowledged records are re-read.
    pub fn rewind(&mut self) {
        self.read_idx = 0;
        self.read_off = 0;
        self.read_cache_valid = false;
        self.last_returned = self.consumed;
    }

    /// True when sequences exist past the last one handed out by
    /// `read_next` (or past the low-water mark after a rewind).
    pub fn has_unread(&self) -> bool {
        self.next_sequence.saturating_sub(1) > self.last_returned.max(self.consumed)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Files evicted by the ring limit since open.
    pub fn lost_files(&self) -> u64 {
        self.lost_files
    }

    /// Malformed or torn records discarded since open.
    pub fn corrupt_records(&self) -> u64 {
        self.corrupt_records
    }

    /// Completes the in-progress file write before shutdown.
    pub fn close(mut self) -> Result<(), SpillError> {
        if let Some(writer) = self.writer.take() {
            writer.seal()?;
        }
        Ok(())
    }

    fn ensure_writer(&mut self) -> Result<(), SpillError> {
        if self.writer.is_some() {
            return Ok(());
        }
        if let Some(last) = self.files.last() {
            let len = fs::metadata(&last.path)?.len();
            if len < self.max_file_size {
                self.writer = Some(SpillFileWriter::reopen(
                    last.path.clone(),
                    last.first_sequence,
                )?);
                return Ok(());
            }
        }
        let writer = SpillFileWriter::create(&self.dir, self.next_sequence)?;
        self.files.push(SpillFileRef {
            first_sequence: self.next_sequence,
            path: writer.path().to_path_buf(),
        });
        self.writer = Some(writer);
        Ok(())
    }

    fn enforce_file_limit(&mut self) -> Result<Option<PathBuf>, SpillError> {
        if self.files.len() <= self.max_file_count {
            return Ok(None);
        }
        let oldest = self.files.remove(0);
        fs::remove_file(&oldest.path)?;
        self.lost_files += 1;
        warn!(
            "spill ring full: evicted {} and its records",
            oldest.path.display()
        );
        if self.read_idx > 0 {
            self.read_idx -= 1;
        } else {
            self.read_off = 0;
        }
        self.read_cache_valid = false;
        Ok(Some(oldest.path))
    }

    fn prune_consumed(&mut self) -> Result<(), SpillError> {
        while self.files.len() > 1 && self.files[1].first_sequence <= self.consumed + 1 {
            let acked = self.files.remove(0);
            fs::remove_file(&acked.path)?;
            if self.read_idx > 0 {
                self.read_idx -= 1;
            } else {
                self.read_off = 0;
            }
            self.read_cache_valid = false;
        }
        Ok(())
    }
}

fn scan_tail(path: &std::path::Path) -> io::Result<(Option<u64>, u64, bool)> {
    let bytes = fs::read(path)?;
    let mut off = 0usize;
    let mut last_sequence = None;
    while off < bytes.len() {
        match SpillRecord::decode(&bytes[off..]) {
            Ok((record, used)) => {
                last_sequence = Some(record.sequence);
                off += used;
            }
            Err(_) => return Ok((last_sequence, off as u64, true)),
        }
    }
    Ok((last_sequence, off as u64, false))
}

#[derive(Debug, Error)]
pub enum SpillError {
    #[error("spill I/O error: {0}")]
    Io(#[from] io::Error),
}
