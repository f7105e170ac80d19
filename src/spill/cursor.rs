use crc32fast::Hasher as Crc32Hasher;
use log::warn;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

const CURSOR_FILE: &str = "cursor";
const CURSOR_TMP: &str = "cursor.tmp";
const CURSOR_LEN: usize = 8 + 4;

/// Persisted replay low-water mark: the highest acknowledged spill sequence.
/// Written atomically (tmp + rename) and only after the records it covers
/// are already durable, so a crash can never make the cursor point past an
/// unwritten record.
#[derive(Debug)]
pub struct CursorFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl CursorFile {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CURSOR_FILE),
            tmp_path: dir.join(CURSOR_TMP),
        }
    }

    /// Loads the persisted mark. A missing or unreadable cursor resumes from
    /// zero: under at-least-once delivery a lost cursor means re-delivery,
    /// never a gap.
    pub fn load(&self) -> u64 {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!("failed to read spill cursor: {err}");
                return 0;
            }
        };
        if bytes.len() != CURSOR_LEN {
            warn!("spill cursor has unexpected length {}", bytes.len());
            return 0;
        }
        let sequence = u64::from_le_bytes(bytes[0..8].try_into().expect("length checked"));
        let stored_crc = u32::from_le_bytes(bytes[8..12].try_into().expect("length checked"));
        let mut hasher = Crc32Hasher::new();
        hasher.update(&bytes[0..8]);
        if hasher.finalize() != stored_crc {
            warn!("spill cursor failed CRC check, resuming from zero");
            return 0;
        }
        sequence
    }

    pub fn store(&self, sequence: u64) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(CURSOR_LEN);
        bytes.extend_from_slice(&sequence.to_le_bytes());
        let mut hasher = Crc32Hasher::new();
        hasher.update(&sequence.to_le_bytes());
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
        fs::write(&self.tmp_path, &bytes)?;
        File::open(&self.tmp_path)?.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}
