use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "spill-";
const FILE_SUFFIX: &str = ".log";

/// Builds the file name for the spill file whose first record carries
/// `first_sequence`.
pub fn file_name(first_sequence: u64) -> String {
    format!("{FILE_PREFIX}{first_sequence:020}{FILE_SUFFIX}")
}

/// Parses a spill file name back into its first-record sequence. Replay
/// order is derivable from names alone.
pub fn parse_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    stem.parse().ok()
}

/// Append-only spill file writer. Every append is flushed to stable storage
/// before it returns; a record is durable once `append` succeeds.
#[derive(Debug)]
pub struct SpillFileWriter {
    path: PathBuf,
    file: File,
    len: u64,
    first_sequence: u64,
}

impl SpillFileWriter {
    pub fn create(dir: &Path, first_sequence: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name(first_sequence));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            len: 0,
            first_sequence,
        })
    }

    /// Reopens an existing file for continued appends after a restart.
    pub fn reopen(path: PathBuf, first_sequence: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(false)
            .open(&path)?;
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path,
            file,
            len,
            first_sequence,
        })
    }

    pub fn append(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)?;
        self.file.sync_data()?;
        self.len += frame.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_sequence(&self) -> u64 {
        self.first_sequence
    }

    /// Completes any buffered write before the file is closed.
    pub fn seal(self) -> io::Result<()> {
        self.file.sync_all()
    }
}
