//! Log writer

use super::{CatalogRecord, LogRecord, SyncPolicy, WalConfig};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Appends records to a log file
pub struct WalWriter<R = CatalogRecord> {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
    _record: PhantomData<fn(&R)>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    bytes_written: u64,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl<R: LogRecord> WalWriter<R> {
    /// Open the log for appending, discarding anything past `valid_len`
    /// (a torn tail found during replay).
    pub fn open(config: WalConfig, valid_len: u64) -> Result<Self> {
        if let Some(dir) = config.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&config.path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let file = Self::open_append(&config.path)?;

        Ok(Self {
            config,
            inner: Mutex::new(WalWriterInner {
                file: BufWriter::new(file),
                bytes_written: valid_len,
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
            _record: PhantomData,
        })
    }

    /// Append a record, returning its offset in the log
    pub fn append(&self, record: &R) -> Result<u64> {
        let serialized = record.serialize_with_checksum()?;
        let mut inner = self.inner.lock();

        inner.file.write_all(&serialized)?;
        let offset = inner.bytes_written;
        inner.bytes_written += serialized.len() as u64;
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        } else {
            inner.file.flush()?;
        }

        Ok(offset)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Current log size in bytes
    pub fn len(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Replace the whole log with `records`.
    ///
    /// The snapshot is written to a sibling temp file, synced, then renamed
    /// over the log so a crash leaves either the old or the new log intact.
    pub fn rewrite(&self, records: &[R]) -> Result<u64> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)?;

        let tmp_path = Self::temp_path(&self.config.path);
        let mut written = 0u64;
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                let serialized = record.serialize_with_checksum()?;
                tmp.write_all(&serialized)?;
                written += serialized.len() as u64;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.config.path)?;

        inner.file = BufWriter::new(Self::open_append(&self.config.path)?);
        inner.bytes_written = written;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();

        Ok(written)
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn sync_inner(inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn open_append(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        path.with_file_name(name)
    }
}
