//! # Write-Ahead Audit Log
//!
//! **Crash-safe storage for drop records**
//!
//! Every batch of drop records is written as one transaction. If the server
//! crashes mid-batch, recovery on the next open keeps committed batches and
//! discards the rest, so a grant is either fully recorded or not at all.
//!
//! ## Guarantees
//!
//! 1. **Durability**: once `commit()` returns, the batch is on disk
//! 2. **Atomicity**: a batch is recovered whole or not at all
//! 3. **Integrity**: every record carries a CRC32; a torn tail is dropped
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "LFAL"]
//! [4 bytes: version]
//! [8 bytes: LSN at last compaction]
//!
//! Entry format:
//! [8 bytes: LSN (Log Sequence Number)]
//! [1 byte: record type (BEGIN/OP/COMMIT/ROLLBACK)]
//! [4 bytes: payload length]
//! [N bytes: payload (encoded DropRecord)]
//! [4 bytes: CRC32 of above]
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::audit::{AuditIndex, AuditQuery, AuditSink, DropRecord, GrantKey, SlotRef};
use crate::context::{DropSource, DropSourceKind, EventId};
use crate::error::{LootError, LootResult};
use crate::quality::Quality;

/// Magic bytes identifying an audit log file.
const WAL_MAGIC: &[u8; 4] = b"LFAL";

/// Current format version.
const WAL_VERSION: u32 = 1;

/// Header length in bytes.
const HEADER_LEN: u64 = 16;

fn io_failure(what: &str, e: &std::io::Error) -> LootError {
    LootError::PersistenceFailure(format!("{what}: {e}"))
}

/// WAL record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Begin a batch.
    Begin = 1,
    /// One drop record within a batch.
    Operation = 2,
    /// Commit the batch (durable).
    Commit = 3,
    /// Abandon the batch.
    Rollback = 4,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Begin),
            2 => Some(Self::Operation),
            3 => Some(Self::Commit),
            4 => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// A WAL entry on disk.
#[derive(Clone, Debug)]
pub struct WalEntry {
    /// Log Sequence Number (unique, monotonic).
    pub lsn: u64,
    /// Entry type.
    pub record_type: RecordType,
    /// Payload data.
    pub payload: Vec<u8>,
}

// =============================================================================
// DropRecord codec
// =============================================================================

/// Encoded size of a drop record.
const RECORD_LEN: usize = 8 + 1 + 4 + 4 + 2 + 8 + 1 + 8 + 4 + 1 + 1 + 4 + 2 + 8 + 4;

/// Encodes a drop record as fixed-width little-endian fields.
#[must_use]
pub fn encode_record(record: &DropRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_LEN);
    let (slot_tag, slot_id) = match record.key.slot {
        SlotRef::Pool(id) => (0u8, id),
        SlotRef::World(id) => (1u8, id),
    };
    buf.extend_from_slice(&record.key.event_id.to_le_bytes());
    buf.push(slot_tag);
    buf.extend_from_slice(&slot_id.to_le_bytes());
    buf.extend_from_slice(&record.key.item_id.to_le_bytes());
    buf.extend_from_slice(&record.key.sequence.to_le_bytes());
    buf.extend_from_slice(&record.receiver_id.to_le_bytes());
    buf.push(u8::from(record.team_id.is_some()));
    buf.extend_from_slice(&record.team_id.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&record.quantity.to_le_bytes());
    buf.push(record.quality as u8);
    buf.push(record.source.kind as u8);
    buf.extend_from_slice(&record.source.id.to_le_bytes());
    buf.extend_from_slice(&record.player_level.to_le_bytes());
    buf.extend_from_slice(&record.recorded_at.timestamp().to_le_bytes());
    buf.extend_from_slice(&record.recorded_at.timestamp_subsec_nanos().to_le_bytes());
    buf
}

/// Little-endian cursor over a payload.
struct Fields<'a>(&'a [u8]);

impl Fields<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let head: [u8; N] = self.0.get(..N)?.try_into().ok()?;
        self.0 = &self.0[N..];
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.take().map(i64::from_le_bytes)
    }
}

/// Decodes a payload written by [`encode_record`].
#[must_use]
pub fn decode_record(data: &[u8]) -> Option<DropRecord> {
    if data.len() != RECORD_LEN {
        return None;
    }
    let mut f = Fields(data);
    let event_id = f.u64()?;
    let slot = match (f.u8()?, f.u32()?) {
        (0, id) => SlotRef::Pool(id),
        (1, id) => SlotRef::World(id),
        _ => return None,
    };
    let key_item = f.u32()?;
    let sequence = f.u16()?;
    let receiver_id = f.u64()?;
    let has_team = f.u8()? != 0;
    let team = f.u64()?;
    let quantity = f.u32()?;
    let quality = Quality::from_u8(f.u8()?)?;
    let kind = DropSourceKind::from_u8(f.u8()?)?;
    let source_id = f.u32()?;
    let player_level = f.u16()?;
    let secs = f.i64()?;
    let nanos = f.u32()?;
    let recorded_at = DateTime::<Utc>::from_timestamp(secs, nanos)?;

    Some(DropRecord {
        key: GrantKey { event_id, slot, item_id: key_item, sequence },
        receiver_id,
        team_id: has_team.then_some(team),
        item_id: key_item,
        quantity,
        quality,
        source: DropSource { kind, id: source_id },
        player_level,
        recorded_at,
    })
}

// =============================================================================
// Transactions
// =============================================================================

/// Transaction handle for one batch.
pub struct Transaction<'a> {
    wal: &'a WriteAheadLog,
    /// Transaction id (LSN of the BEGIN entry).
    pub txn_id: u64,
    operations: usize,
    finalized: bool,
}

impl Transaction<'_> {
    /// Appends one payload to the batch.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the write fails.
    pub fn add_operation(&mut self, payload: &[u8]) -> LootResult<()> {
        self.wal.write_entry(RecordType::Operation, payload)?;
        self.operations += 1;
        Ok(())
    }

    /// Commits the batch and syncs it to disk. Returns the number of
    /// operations committed.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the write or sync fails.
    pub fn commit(mut self) -> LootResult<usize> {
        self.wal.write_entry(RecordType::Commit, &[])?;
        self.wal.sync()?;
        self.finalized = true;
        Ok(self.operations)
    }

    /// Abandons the batch.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the write fails.
    pub fn rollback(mut self) -> LootResult<()> {
        self.finalized = true;
        self.wal.write_entry(RecordType::Rollback, &[])?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finalized {
            // Best effort: recovery discards an unterminated batch anyway.
            let _ = self.wal.write_entry(RecordType::Rollback, &[]);
        }
    }
}

// =============================================================================
// WriteAheadLog
// =============================================================================

/// Append-only transactional log file.
pub struct WriteAheadLog {
    path: PathBuf,
    current_lsn: AtomicU64,
    file: Mutex<BufWriter<File>>,
}

impl WriteAheadLog {
    /// Opens or creates a log file and recovers it.
    ///
    /// Returns the log and the payloads of every committed operation, in
    /// commit order. Uncommitted batches and a torn tail are discarded.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the file cannot be opened or has a
    /// foreign header.
    pub fn open(path: impl AsRef<Path>) -> LootResult<(Self, Vec<Vec<u8>>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_failure("failed to create log directory", &e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_failure("failed to open audit log", &e))?;

        let len = file
            .metadata()
            .map_err(|e| io_failure("failed to read log metadata", &e))?
            .len();
        let mut writer = BufWriter::new(file);
        if len == 0 {
            write_header(&mut writer, 0)?;
            writer.flush().map_err(|e| io_failure("failed to write header", &e))?;
        }

        let (committed, next_lsn, valid_len) = Self::recover(&path)?;

        // Drop a torn tail so new entries are not appended after garbage.
        let on_disk = writer
            .get_ref()
            .metadata()
            .map_err(|e| io_failure("failed to read log metadata", &e))?
            .len();
        if valid_len < on_disk {
            warn!(
                path = %path.display(),
                discarded_bytes = on_disk - valid_len,
                "truncating torn audit log tail"
            );
            writer
                .get_ref()
                .set_len(valid_len)
                .map_err(|e| io_failure("failed to truncate torn tail", &e))?;
        }

        let wal = Self {
            path,
            current_lsn: AtomicU64::new(next_lsn),
            file: Mutex::new(writer),
        };
        Ok((wal, committed))
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begins a new transaction.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the BEGIN entry cannot be written.
    pub fn begin_transaction(&self) -> LootResult<Transaction<'_>> {
        let txn_id = self.write_entry(RecordType::Begin, &[])?;
        Ok(Transaction { wal: self, txn_id, operations: 0, finalized: false })
    }

    fn write_entry(&self, record_type: RecordType, payload: &[u8]) -> LootResult<u64> {
        let mut file = self.file.lock();
        let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst);
        file.write_all(&frame(lsn, record_type, payload)?)
            .map_err(|e| io_failure("audit log write failed", &e))?;
        Ok(lsn)
    }

    fn sync(&self) -> LootResult<()> {
        let mut file = self.file.lock();
        file.flush().map_err(|e| io_failure("audit log flush failed", &e))?;
        file.get_ref()
            .sync_data()
            .map_err(|e| io_failure("audit log sync failed", &e))?;
        Ok(())
    }

    /// Replays the file. Returns committed payloads, the next LSN and the
    /// byte length of the valid prefix.
    fn recover(path: &Path) -> LootResult<(Vec<Vec<u8>>, u64, u64)> {
        let file = File::open(path).map_err(|e| io_failure("failed to open log for recovery", &e))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| io_failure("failed to read log magic", &e))?;
        if &magic != WAL_MAGIC {
            return Err(LootError::PersistenceFailure(format!(
                "{} is not an audit log",
                path.display()
            )));
        }
        let mut version = [0u8; 4];
        reader
            .read_exact(&mut version)
            .map_err(|e| io_failure("failed to read log version", &e))?;
        let version = u32::from_le_bytes(version);
        if version != WAL_VERSION {
            return Err(LootError::PersistenceFailure(format!(
                "unsupported audit log version {version}"
            )));
        }
        let mut base_lsn = [0u8; 8];
        reader
            .read_exact(&mut base_lsn)
            .map_err(|e| io_failure("failed to read log LSN", &e))?;
        let mut next_lsn = u64::from_le_bytes(base_lsn);

        let mut committed = Vec::new();
        // Batches are written one at a time, so at most one is open.
        let mut open: Option<Vec<Vec<u8>>> = None;
        let mut valid_len = HEADER_LEN;
        let mut discarded = 0usize;

        while let Some(entry) = Self::read_entry(&mut reader) {
            next_lsn = next_lsn.max(entry.lsn + 1);
            valid_len += 8 + 1 + 4 + entry.payload.len() as u64 + 4;
            match entry.record_type {
                RecordType::Begin => {
                    if open.replace(Vec::new()).is_some() {
                        discarded += 1;
                    }
                }
                RecordType::Operation => {
                    if let Some(ops) = open.as_mut() {
                        ops.push(entry.payload);
                    }
                }
                RecordType::Commit => {
                    if let Some(ops) = open.take() {
                        committed.extend(ops);
                    }
                }
                RecordType::Rollback => {
                    if open.take().is_some() {
                        discarded += 1;
                    }
                }
            }
        }
        if open.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(batches = discarded, "audit log recovery discarded uncommitted batches");
        }

        Ok((committed, next_lsn, valid_len))
    }

    /// Reads one entry; `None` at end of file or on a torn or corrupt entry.
    fn read_entry(reader: &mut impl Read) -> Option<WalEntry> {
        let mut head = [0u8; 13];
        reader.read_exact(&mut head).ok()?;
        let lsn = u64::from_le_bytes(head[0..8].try_into().ok()?);
        let record_type = RecordType::from_u8(head[8])?;
        let len = u32::from_le_bytes(head[9..13].try_into().ok()?) as usize;
        // Entries are empty or hold one record.
        if len > RECORD_LEN {
            return None;
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).ok()?;
        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc).ok()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc) {
            return None;
        }
        Some(WalEntry { lsn, record_type, payload })
    }

    /// Rewrites the log as a single committed batch of `payloads`, dropping
    /// rollbacks and framing overhead. The new file replaces the old one
    /// atomically.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the new file cannot be written.
    pub fn compact(&self, payloads: &[Vec<u8>]) -> LootResult<()> {
        let mut file = self.file.lock();
        let tmp = self.path.with_extension("compact");
        let base = self.current_lsn.load(Ordering::SeqCst);

        {
            let out = File::create(&tmp).map_err(|e| io_failure("failed to create compacted log", &e))?;
            let mut out = BufWriter::new(out);
            write_header(&mut out, base)?;
            let mut lsn = base;
            let mut entry = |kind: RecordType, payload: &[u8]| -> LootResult<()> {
                let bytes = frame(lsn, kind, payload)?;
                lsn += 1;
                out.write_all(&bytes)
                    .map_err(|e| io_failure("compaction write failed", &e))
            };
            entry(RecordType::Begin, &[])?;
            for payload in payloads {
                entry(RecordType::Operation, payload)?;
            }
            entry(RecordType::Commit, &[])?;
            self.current_lsn.store(lsn, Ordering::SeqCst);
            out.flush().map_err(|e| io_failure("compaction flush failed", &e))?;
            out.get_ref()
                .sync_all()
                .map_err(|e| io_failure("compaction sync failed", &e))?;
        }

        file.flush().map_err(|e| io_failure("audit log flush failed", &e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_failure("failed to replace audit log", &e))?;
        let reopened = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| io_failure("failed to reopen audit log", &e))?;
        *file = BufWriter::new(reopened);

        info!(records = payloads.len(), "audit log compacted");
        Ok(())
    }
}

/// Serializes one entry: LSN, type, length, payload, CRC32 of all of it.
fn frame(lsn: u64, record_type: RecordType, payload: &[u8]) -> LootResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| LootError::PersistenceFailure("payload too large".to_string()))?;
    let mut entry = Vec::with_capacity(8 + 1 + 4 + payload.len() + 4);
    entry.extend_from_slice(&lsn.to_le_bytes());
    entry.push(record_type as u8);
    entry.extend_from_slice(&len.to_le_bytes());
    entry.extend_from_slice(payload);
    let crc = crc32fast::hash(&entry);
    entry.extend_from_slice(&crc.to_le_bytes());
    Ok(entry)
}

fn write_header(out: &mut impl Write, base_lsn: u64) -> LootResult<()> {
    out.write_all(WAL_MAGIC)
        .and_then(|()| out.write_all(&WAL_VERSION.to_le_bytes()))
        .and_then(|()| out.write_all(&base_lsn.to_le_bytes()))
        .map_err(|e| io_failure("failed to write log header", &e))
}

// =============================================================================
// WalAuditLog
// =============================================================================

/// Audit sink backed by a [`WriteAheadLog`], with an in-memory index for
/// queries.
pub struct WalAuditLog {
    wal: WriteAheadLog,
    index: RwLock<AuditIndex>,
}

impl WalAuditLog {
    /// Opens or creates the log and loads every committed record.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> LootResult<Self> {
        let (wal, payloads) = WriteAheadLog::open(path)?;
        let mut records = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            match decode_record(payload) {
                Some(record) => records.push(record),
                None => warn!(bytes = payload.len(), "skipping undecodable audit record"),
            }
        }

        let mut index = AuditIndex::new();
        index.extend(records);
        info!(path = %wal.path().display(), records = index.len(), "audit log opened");
        Ok(Self { wal, index: RwLock::new(index) })
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Copy of every record in append order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DropRecord> {
        self.index.read().records().to_vec()
    }

    /// Rewrites the file to hold exactly the stored records.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the file cannot be rewritten.
    pub fn compact(&self) -> LootResult<()> {
        let index = self.index.write();
        let payloads: Vec<Vec<u8>> = index.records().iter().map(encode_record).collect();
        self.wal.compact(&payloads)
    }
}

impl AuditSink for WalAuditLog {
    fn append(&self, records: &[DropRecord]) -> LootResult<usize> {
        // The write lock serializes batches, so the file never interleaves them.
        let mut index = self.index.write();
        let fresh = index.unseen(records);
        if fresh.is_empty() {
            return Ok(0);
        }

        let write = || -> LootResult<usize> {
            let mut txn = self.wal.begin_transaction()?;
            for record in &fresh {
                txn.add_operation(&encode_record(record))?;
            }
            txn.commit()
        };
        let added = write().map_err(|e| {
            error!(error = %e, records = fresh.len(), "audit batch not persisted");
            e
        })?;

        index.extend(fresh);
        Ok(added)
    }

    fn records_for_slot(&self, event_id: EventId, slot: SlotRef) -> Vec<DropRecord> {
        self.index.read().for_slot(event_id, slot)
    }

    fn query(&self, query: &AuditQuery) -> Vec<DropRecord> {
        self.index.read().query(query)
    }
}
