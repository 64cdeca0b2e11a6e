//! Local durable buffer.
//!
//! Every consumed message is mirrored to disk before it enters a batch, so a
//! crash between consumption and checkpoint loses nothing: on restart the
//! entries above the committed offsets are replayed.
//!
//! Layout:
//!
//! ```text
//! <dir>/.lock                                   exclusive flock held while open
//! <dir>/partition-<p>/<first offset, 20 digits>.log   JSON lines, one per message
//! ```
//!
//! A segment holds at most `segment_rows` entries. Purging deletes whole
//! segments below the committed offset and rewrites the boundary segment
//! through a temp file and a rename.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kafka_types::{Offset, Partition, RawRecord};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TopicConfig;
use crate::error::{BufferLockedError, Error, Result};

const LOCK_FILE: &str = ".lock";
const PARTITION_PREFIX: &str = "partition-";
const SEGMENT_SUFFIX: &str = ".log";
const TMP_SUFFIX: &str = ".tmp";

/// One buffered message, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBufferEntry {
    pub partition: Partition,
    pub offset: Offset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl LocalBufferEntry {
    pub fn from_raw(raw: &RawRecord) -> Self {
        Self {
            partition: raw.partition,
            offset: raw.offset,
            key: raw.key.as_ref().map(|k| STANDARD.encode(k)),
            value: raw.value.as_ref().map(|v| STANDARD.encode(v)),
            timestamp: raw.timestamp,
        }
    }

    pub fn to_raw(&self) -> io::Result<RawRecord> {
        let decode = |field: &Option<String>| -> io::Result<Option<Vec<u8>>> {
            field
                .as_ref()
                .map(|s| STANDARD.decode(s))
                .transpose()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        };
        Ok(RawRecord {
            partition: self.partition,
            offset: self.offset,
            key: decode(&self.key)?,
            value: decode(&self.value)?,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    first_offset: Offset,
    last_offset: Offset,
    rows: usize,
}

#[derive(Debug)]
struct PartitionLog {
    dir: PathBuf,
    segments: Vec<Segment>,
    /// Append handle of the last segment
    active: Option<File>,
}

fn segment_path(dir: &Path, first_offset: Offset) -> PathBuf {
    dir.join(format!("{first_offset:020}{SEGMENT_SUFFIX}"))
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Read the entries of a segment, stopping at the first line that does not
/// parse. Returns the entries, the byte length of the valid prefix and
/// whether anything followed that prefix.
fn read_segment(path: &Path) -> io::Result<(Vec<LocalBufferEntry>, u64, bool)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Ok((entries, valid_len, false));
        }
        if !line.ends_with('\n') {
            return Ok((entries, valid_len, true));
        }
        match serde_json::from_str::<LocalBufferEntry>(line.trim_end()) {
            Ok(entry) => {
                entries.push(entry);
                valid_len += read as u64;
            }
            Err(_) => return Ok((entries, valid_len, true)),
        }
    }
}

impl PartitionLog {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            segments: Vec::new(),
            active: None,
        }
    }

    /// Rebuild segment metadata from disk. A torn tail left by a crash is
    /// cut off so later appends start on a clean line.
    fn load(dir: PathBuf) -> io::Result<Self> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                fs::remove_file(&path)?;
            } else if name.ends_with(SEGMENT_SUFFIX) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut log = Self::new(dir);
        for path in paths {
            let (entries, valid_len, torn) = read_segment(&path)?;
            if torn {
                warn!(
                    "Discarding torn entry at the end of local store segment {}",
                    path.display()
                );
                OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
            }
            match (entries.first(), entries.last()) {
                (Some(first), Some(last)) => log.segments.push(Segment {
                    path,
                    first_offset: first.offset,
                    last_offset: last.offset,
                    rows: entries.len(),
                }),
                _ => fs::remove_file(&path)?,
            }
        }
        Ok(log)
    }

    fn append(&mut self, entry: &LocalBufferEntry, segment_rows: usize) -> io::Result<()> {
        let roll = self
            .segments
            .last()
            .map_or(true, |segment| segment.rows >= segment_rows);

        if roll {
            fs::create_dir_all(&self.dir)?;
            let path = segment_path(&self.dir, entry.offset);
            let file = OpenOptions::new().append(true).create(true).open(&path)?;
            sync_dir(&self.dir)?;
            debug!("Opened local store segment {}", path.display());
            self.segments.push(Segment {
                path,
                first_offset: entry.offset,
                last_offset: entry.offset,
                rows: 0,
            });
            self.active = Some(file);
        }

        if self.active.is_none() {
            if let Some(segment) = self.segments.last() {
                self.active = Some(OpenOptions::new().append(true).open(&segment.path)?);
            }
        }

        let (Some(file), Some(segment)) = (self.active.as_mut(), self.segments.last_mut()) else {
            return Err(io::Error::other("local store segment is not open"));
        };

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;

        segment.last_offset = segment.last_offset.max(entry.offset);
        segment.rows += 1;
        Ok(())
    }

    fn purge(&mut self, committed: Offset) -> io::Result<()> {
        if self.segments.is_empty() {
            return Ok(());
        }
        let mut kept = Vec::with_capacity(self.segments.len());
        let last_index = self.segments.len().saturating_sub(1);
        let mut active_touched = false;

        for (index, segment) in std::mem::take(&mut self.segments).into_iter().enumerate() {
            if segment.last_offset <= committed {
                fs::remove_file(&segment.path)?;
                active_touched |= index == last_index;
            } else if segment.first_offset <= committed {
                kept.push(self.rewrite(segment, committed)?);
                active_touched |= index == last_index;
            } else {
                kept.push(segment);
            }
        }

        if active_touched {
            self.active = None;
        }
        self.segments = kept;
        sync_dir(&self.dir)
    }

    /// Rewrite a segment without its entries at or below `committed`.
    fn rewrite(&self, segment: Segment, committed: Offset) -> io::Result<Segment> {
        let (entries, _, _) = read_segment(&segment.path)?;
        let remaining: Vec<_> = entries.into_iter().filter(|e| e.offset > committed).collect();

        let first_offset = remaining.first().map_or(committed + 1, |e| e.offset);
        let path = segment_path(&self.dir, first_offset);
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp_name);

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            for entry in &remaining {
                let mut line = serde_json::to_vec(entry)?;
                line.push(b'\n');
                file.write_all(&line)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        if path != segment.path {
            fs::remove_file(&segment.path)?;
        }

        Ok(Segment {
            path,
            first_offset,
            last_offset: segment.last_offset,
            rows: remaining.len(),
        })
    }

    fn entries(&self) -> io::Result<Vec<LocalBufferEntry>> {
        let mut entries = Vec::new();
        for segment in &self.segments {
            let (mut read, _, torn) = read_segment(&segment.path)?;
            if torn {
                warn!(
                    "Skipping unreadable entry in local store segment {}",
                    segment.path.display()
                );
            }
            entries.append(&mut read);
        }
        entries.sort_by_key(|e| e.offset);
        entries.dedup_by_key(|e| e.offset);
        Ok(entries)
    }
}

/// Disk mirror of consumed but not yet checkpointed messages.
#[derive(Debug)]
pub struct LocalBuffer {
    dir: PathBuf,
    segment_rows: usize,
    partitions: Mutex<HashMap<Partition, Arc<Mutex<PartitionLog>>>>,
    _lock: Flock<File>,
}

impl LocalBuffer {
    /// Open the local store configured for the run.
    pub fn for_config(config: &TopicConfig) -> Result<Self> {
        Self::open(&config.local_store_dir, config.local_store_batch_size_rows)
    }

    /// Open (or create) the buffer directory and take its exclusive lock.
    pub fn open(dir: impl Into<PathBuf>, segment_rows: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        let lock = match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => return Err(BufferLockedError { dir }.into()),
            Err((_, errno)) => return Err(Error::Buffer(io::Error::from(errno))),
        };

        let mut partitions = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let partition = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(PARTITION_PREFIX))
                .and_then(|p| p.parse::<Partition>().ok());
            if let (Some(partition), true) = (partition, path.is_dir()) {
                let log = PartitionLog::load(path)?;
                partitions.insert(partition, Arc::new(Mutex::new(log)));
            }
        }

        debug!(
            "Opened local store {} with {} partition(s)",
            dir.display(),
            partitions.len()
        );

        Ok(Self {
            dir,
            segment_rows: segment_rows.max(1),
            partitions: Mutex::new(partitions),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn partition_log(&self, partition: Partition) -> Arc<Mutex<PartitionLog>> {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(partitions.entry(partition).or_insert_with(|| {
            let dir = self.dir.join(format!("{PARTITION_PREFIX}{partition}"));
            Arc::new(Mutex::new(PartitionLog::new(dir)))
        }))
    }

    fn existing_logs(&self) -> BTreeMap<Partition, Arc<Mutex<PartitionLog>>> {
        let partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        partitions
            .iter()
            .map(|(&p, log)| (p, Arc::clone(log)))
            .collect()
    }

    /// Durably append an entry. Returns once the entry is on disk.
    pub fn append(&self, entry: &LocalBufferEntry) -> Result<()> {
        let log = self.partition_log(entry.partition);
        let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
        log.append(entry, self.segment_rows)?;
        Ok(())
    }

    /// Drop every entry of `partition` at or below `offset`.
    pub fn purge_committed(&self, partition: Partition, offset: Offset) -> Result<()> {
        let Some(log) = self.existing_logs().remove(&partition) else {
            return Ok(());
        };
        let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
        log.purge(offset)?;
        Ok(())
    }

    /// All buffered entries, ordered by partition then offset.
    pub fn replay_pending(&self) -> Result<Vec<LocalBufferEntry>> {
        let mut entries = Vec::new();
        for (_, log) in self.existing_logs() {
            let log = log.lock().unwrap_or_else(|e| e.into_inner());
            entries.extend(log.entries()?);
        }
        Ok(entries)
    }
}
