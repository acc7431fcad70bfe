//! An in-memory [`Store`], mainly useful for testing.
//!
//! Changes are applied immediately and rolled back from an undo list when a
//! transaction aborts. Locking is no-wait: touching a row, a unique key or the
//! end of a stripe locked by another transaction fails with
//! [`StoreError::Deadlock`]. The log records of a transaction are appended
//! when it commits, followed by its commit record, after which subscribers of
//! the tables it wrote to are notified.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    ops::Bound,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    BlobSet, CommitNotice, DataOp, Direction, IndexKey, LockStats, LogBody, LogRecord, Lsn, Priority, ProgressKey,
    ProgressValue, Result, RowId, RowWrite, ScanCursor, SeqNum, Store, StoreError, StoredRow, StripeCursor, TxnId,
    UpdateImage, UpdateOp,
};

/// Log bytes accounted per record on top of the record's image.
const RECORD_OVERHEAD: usize = 32;

/// Default number of log records per log file.
const DEFAULT_LOG_FILE_RECORDS: u32 = 1024;

/// Initialize `env_logger` for tests, honoring `RUST_LOG`.
pub fn enable_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// A row as currently present in a [`MemStore`] table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowSnapshot {
    pub id: RowId,
    pub record: Vec<u8>,
    pub blobs: BlobSet,
}

#[derive(Clone, Debug)]
struct MemRow {
    id: RowId,
    record: Vec<u8>,
    blobs: BlobSet,
    keys: Vec<IndexKey>,
}

impl MemRow {
    fn primary_key(&self) -> Vec<u8> {
        self.keys
            .iter()
            .find(|k| k.index == 0)
            .map(|k| k.key.clone())
            .unwrap_or_default()
    }

    fn unique_keys(&self) -> impl Iterator<Item = &IndexKey> {
        self.keys.iter().filter(|k| k.unique)
    }
}

#[derive(Default)]
struct Table {
    /// Rows keyed by [`RowId::base`].
    rows: BTreeMap<RowId, MemRow>,
    /// index number -> key -> row bases
    indexes: BTreeMap<usize, BTreeMap<Vec<u8>, BTreeSet<RowId>>>,
    row_locks: BTreeMap<RowId, TxnId>,
    next_seq: u64,
}

impl Table {
    fn add_row(&mut self, row: MemRow) {
        let base = row.id.base();
        for k in &row.keys {
            self.indexes
                .entry(k.index)
                .or_default()
                .entry(k.key.clone())
                .or_default()
                .insert(base);
        }
        self.next_seq = self.next_seq.max(row.id.seq());
        self.rows.insert(base, row);
    }

    fn remove_row(&mut self, base: RowId) -> Option<MemRow> {
        let row = self.rows.remove(&base)?;
        for k in &row.keys {
            if let Some(index) = self.indexes.get_mut(&k.index) {
                if let Some(bases) = index.get_mut(&k.key) {
                    bases.remove(&base);
                    if bases.is_empty() {
                        index.remove(&k.key);
                    }
                }
            }
        }
        Some(row)
    }

    fn snapshot(&self, base: RowId) -> Option<StoredRow> {
        self.rows.get(&base).map(|row| StoredRow {
            id: row.id,
            record: row.record.clone(),
            index_key: row.primary_key(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Lock {
    Row { table: String, row: RowId },
    Key { table: String, index: usize, key: Vec<u8> },
    StripeEnd { table: String, stripe: u8 },
}

enum Undo {
    Inserted { table: String, id: RowId },
    Removed { table: String, row: MemRow },
    Replaced { table: String, new: RowId, old: MemRow },
}

enum Image {
    None,
    Add(Vec<u8>),
    Delete(Vec<u8>),
    Update(UpdateImage),
}

impl Image {
    fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Add(bytes) | Self::Delete(bytes) => bytes.len(),
            Self::Update(img) => img.prev.len() + img.next.len(),
        }
    }
}

/// Transaction handle of a [`MemStore`].
pub struct MemTxn {
    id: TxnId,
    priority: Priority,
    locks: Vec<Lock>,
    undo: Vec<Undo>,
    log: Vec<(LogBody, Image)>,
    tables: BTreeSet<String>,
    progress: Vec<(String, ProgressKey, Option<ProgressValue>)>,
    log_bytes: usize,
}

impl MemTxn {
    pub fn id(&self) -> TxnId {
        self.id
    }

    fn log(&mut self, body: LogBody, image: Image) {
        self.log_bytes += RECORD_OVERHEAD + image.len();
        self.log.push((body, image));
    }
}

fn table_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn conflict(stats: &mut LockStats) -> StoreError {
    stats.deadlocks += 1;
    stats.lock_waits += 1;
    StoreError::Deadlock
}

struct Inner {
    tables: HashMap<String, Table>,
    log: Vec<LogRecord>,
    images: HashMap<Lsn, Image>,
    records_written: u64,
    last_commit: Lsn,
    next_txnid: u64,
    seqnum: u64,
    locks: HashMap<Lock, TxnId>,
    subscribers: HashMap<String, Vec<Sender<CommitNotice>>>,
    /// Notices withheld from subscribers, if delivery is on hold.
    held_notices: Option<Vec<(String, CommitNotice)>>,
    progress: BTreeMap<(String, ProgressKey), ProgressValue>,
    pinned: HashMap<String, u32>,
    quiesced: HashSet<String>,
    stats: LockStats,
    incoherent_nodes: usize,
    disk_headroom_pct: f64,
    inject_deadlocks: u32,
    replication_waits: u64,
}

impl Inner {
    fn notify(&mut self, table: &str, notice: CommitNotice) {
        if let Some(subscribers) = self.subscribers.get_mut(table) {
            subscribers.retain(|tx| tx.send(notice).is_ok());
        }
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(&table_key(name))
            .ok_or_else(|| StoreError::NoSuchTable(name.to_owned()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(&table_key(name))
            .ok_or_else(|| StoreError::NoSuchTable(name.to_owned()))
    }

    fn next_lsn(&mut self, file_records: u32) -> Lsn {
        let n = self.records_written;
        self.records_written += 1;
        let file_records = u64::from(file_records.max(1));
        Lsn::new((n / file_records) as u32 + 1, (n % file_records) as u32 + 1)
    }

    /// Fail low priority transactions while injected deadlocks remain.
    fn fault(&mut self, txn: &MemTxn) -> Result<()> {
        if txn.priority == Priority::Low && self.inject_deadlocks > 0 {
            self.inject_deadlocks -= 1;
            return Err(conflict(&mut self.stats));
        }
        Ok(())
    }

    fn check_writable(&self, table: &str) -> Result<()> {
        if self.quiesced.contains(&table_key(table)) {
            return Err(StoreError::TableLocked(table.to_owned()));
        }
        Ok(())
    }

    fn lock_row(&mut self, txn: &mut MemTxn, table: &str, base: RowId) -> Result<()> {
        let key = table_key(table);
        let t = self
            .tables
            .get_mut(&key)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_owned()))?;
        match t.row_locks.get(&base).copied() {
            Some(owner) if owner == txn.id => Ok(()),
            Some(_) => Err(conflict(&mut self.stats)),
            None => {
                t.row_locks.insert(base, txn.id);
                txn.locks.push(Lock::Row { table: key, row: base });
                Ok(())
            }
        }
    }

    fn lock(&mut self, txn: &mut MemTxn, lock: Lock) -> Result<()> {
        match self.locks.get(&lock).copied() {
            Some(owner) if owner == txn.id => Ok(()),
            Some(_) => Err(conflict(&mut self.stats)),
            None => {
                self.locks.insert(lock.clone(), txn.id);
                txn.locks.push(lock);
                Ok(())
            }
        }
    }

    /// New rows cannot enter a stripe whose end another transaction has
    /// scanned.
    fn check_stripe_end(&mut self, txn: &MemTxn, table: &str, stripe: u8) -> Result<()> {
        let lock = Lock::StripeEnd {
            table: table_key(table),
            stripe,
        };
        match self.locks.get(&lock) {
            Some(owner) if *owner != txn.id => Err(conflict(&mut self.stats)),
            _ => Ok(()),
        }
    }

    /// Lock the unique keys in `keys` and check none of them is used by a row
    /// other than `except`.
    fn check_keys(&mut self, txn: &mut MemTxn, table: &str, keys: &[IndexKey], except: Option<RowId>) -> Result<()> {
        for k in keys.iter().filter(|k| k.unique) {
            self.lock(
                txn,
                Lock::Key {
                    table: table_key(table),
                    index: k.index,
                    key: k.key.clone(),
                },
            )?;
            let taken = self
                .table(table)?
                .indexes
                .get(&k.index)
                .and_then(|index| index.get(&k.key))
                .is_some_and(|bases| bases.iter().any(|base| Some(*base) != except));
            if taken {
                return Err(StoreError::DuplicateKey {
                    table: table.to_owned(),
                    index: k.index,
                });
            }
        }
        Ok(())
    }

    fn lock_keys_of(&mut self, txn: &mut MemTxn, table: &str, row: &MemRow) -> Result<()> {
        for k in row.unique_keys() {
            self.lock(
                txn,
                Lock::Key {
                    table: table_key(table),
                    index: k.index,
                    key: k.key.clone(),
                },
            )?;
        }
        Ok(())
    }

    fn scan_next(&mut self, txn: &mut MemTxn, table: &str, cursor: &ScanCursor) -> Result<Option<StoredRow>> {
        self.fault(txn)?;
        let me = txn.id;
        let t = self
            .tables
            .get(&table_key(table))
            .ok_or_else(|| StoreError::NoSuchTable(table.to_owned()))?;

        let (next, index_key) = match cursor {
            ScanCursor::Stripe { stripe, after } => {
                let lower = match after {
                    StripeCursor::Pending => Bound::Unbounded,
                    StripeCursor::At(id) => Bound::Excluded(id.base()),
                    StripeCursor::Done => return Ok(None),
                };
                let next = t
                    .rows
                    .range((lower, Bound::Unbounded))
                    .map(|(base, _)| *base)
                    .find(|base| base.stripe() == *stripe);
                // Rows inserted or deleted by uncommitted transactions leave
                // their lock behind, whether or not the row is present.
                let upper = next.map_or(Bound::Unbounded, Bound::Included);
                let gap_locked = t
                    .row_locks
                    .range((lower, upper))
                    .any(|(base, owner)| base.stripe() == *stripe && *owner != me);
                if gap_locked {
                    return Err(conflict(&mut self.stats));
                }
                if next.is_none() {
                    self.lock(
                        txn,
                        Lock::StripeEnd {
                            table: table_key(table),
                            stripe: *stripe,
                        },
                    )?;
                    return Ok(None);
                }
                (next, None)
            }
            ScanCursor::Dump { after } => {
                let lower = after.map_or(Bound::Unbounded, |id| Bound::Excluded(id.base()));
                let next = t.rows.range((lower, Bound::Unbounded)).map(|(base, _)| *base).next();
                let upper = next.map_or(Bound::Unbounded, Bound::Included);
                if t.row_locks.range((lower, upper)).any(|(_, owner)| *owner != me) {
                    return Err(conflict(&mut self.stats));
                }
                (next, None)
            }
            ScanCursor::Index { after } => {
                let next = t.indexes.get(&0).and_then(|index| {
                    index
                        .iter()
                        .flat_map(|(key, bases)| bases.iter().map(move |base| (key, *base)))
                        .find(|(key, base)| match after {
                            None => true,
                            Some((after_key, after_id)) => {
                                (key.as_slice(), *base) > (after_key.as_slice(), after_id.base())
                            }
                        })
                        .map(|(key, base)| (key.clone(), base))
                });
                match next {
                    Some((key, base)) => (Some(base), Some(key)),
                    None => (None, None),
                }
            }
        };

        let Some(base) = next else {
            return Ok(None);
        };
        self.lock_row(txn, table, base)?;
        let row = self.table(table)?.snapshot(base).map(|mut row| {
            if let Some(key) = index_key {
                row.index_key = key;
            }
            row
        });
        Ok(row)
    }

    fn insert_row(&mut self, txn: &mut MemTxn, table: &str, row: RowWrite) -> Result<()> {
        self.fault(txn)?;
        self.check_writable(table)?;
        let base = row.id.base();
        self.check_stripe_end(txn, table, row.id.stripe())?;
        self.lock_row(txn, table, base)?;
        if self.table(table)?.rows.contains_key(&base) {
            return Err(StoreError::Exists {
                table: table.to_owned(),
                row: row.id,
            });
        }
        self.check_keys(txn, table, &row.keys, None)?;

        txn.log(
            LogBody::Add(DataOp {
                table: table.to_owned(),
                dtafile: 0,
                genid: row.id,
                len: row.record.len() as u32,
            }),
            Image::Add(row.record.clone()),
        );
        for (blob_no, data) in row.blobs.iter() {
            txn.log(
                LogBody::Add(DataOp {
                    table: table.to_owned(),
                    dtafile: blob_no as u8 + 1,
                    genid: row.id,
                    len: data.len() as u32,
                }),
                Image::Add(data.to_vec()),
            );
        }

        let id = row.id;
        self.table_mut(table)?.add_row(MemRow {
            id,
            record: row.record,
            blobs: row.blobs,
            keys: row.keys,
        });
        txn.undo.push(Undo::Inserted {
            table: table_key(table),
            id,
        });
        txn.tables.insert(table_key(table));
        trace!("insert table={table} row={id} txn={}", txn.id);
        Ok(())
    }

    fn delete_row(&mut self, txn: &mut MemTxn, table: &str, id: RowId) -> Result<()> {
        self.fault(txn)?;
        self.check_writable(table)?;
        let base = id.base();
        self.lock_row(txn, table, base)?;
        let Some(existing) = self.table(table)?.rows.get(&base).cloned() else {
            return Err(StoreError::NotFound {
                table: table.to_owned(),
                row: id,
            });
        };
        self.lock_keys_of(txn, table, &existing)?;

        txn.log(
            LogBody::Delete(DataOp {
                table: table.to_owned(),
                dtafile: 0,
                genid: existing.id,
                len: existing.record.len() as u32,
            }),
            Image::Delete(existing.record.clone()),
        );
        for (blob_no, data) in existing.blobs.iter() {
            txn.log(
                LogBody::Delete(DataOp {
                    table: table.to_owned(),
                    dtafile: blob_no as u8 + 1,
                    genid: existing.id,
                    len: data.len() as u32,
                }),
                Image::Delete(data.to_vec()),
            );
        }

        if let Some(row) = self.table_mut(table)?.remove_row(base) {
            txn.undo.push(Undo::Removed {
                table: table_key(table),
                row,
            });
        }
        txn.tables.insert(table_key(table));
        trace!("delete table={table} row={id} txn={}", txn.id);
        Ok(())
    }

    fn update_row(&mut self, txn: &mut MemTxn, table: &str, old: RowId, row: RowWrite) -> Result<()> {
        self.fault(txn)?;
        self.check_writable(table)?;
        let inplace = old.same_row(row.id);
        self.lock_row(txn, table, old.base())?;
        if !inplace {
            self.check_stripe_end(txn, table, row.id.stripe())?;
            self.lock_row(txn, table, row.id.base())?;
        }
        let t = self.table(table)?;
        let Some(prev) = t.rows.get(&old.base()).cloned() else {
            return Err(StoreError::NotFound {
                table: table.to_owned(),
                row: old,
            });
        };
        if !inplace && t.rows.contains_key(&row.id.base()) {
            return Err(StoreError::Exists {
                table: table.to_owned(),
                row: row.id,
            });
        }
        self.lock_keys_of(txn, table, &prev)?;
        self.check_keys(txn, table, &row.keys, Some(old.base()))?;

        txn.log(
            LogBody::Update(UpdateOp {
                table: table.to_owned(),
                dtafile: 0,
                old_genid: prev.id,
                new_genid: row.id,
                old_dta_len: prev.record.len() as u32,
            }),
            Image::Update(UpdateImage {
                prev: prev.record.clone(),
                next: row.record.clone(),
            }),
        );
        for (blob_no, data) in row.blobs.iter() {
            let dtafile = blob_no as u8 + 1;
            match prev.blobs.get(blob_no) {
                Some(old_data) => {
                    // A relocated blob without a before-image carries the new
                    // image in `prev`.
                    let image = if old_data.is_empty() && !inplace {
                        UpdateImage {
                            prev: data.to_vec(),
                            next: Vec::new(),
                        }
                    } else {
                        UpdateImage {
                            prev: old_data.to_vec(),
                            next: data.to_vec(),
                        }
                    };
                    txn.log(
                        LogBody::Update(UpdateOp {
                            table: table.to_owned(),
                            dtafile,
                            old_genid: prev.id,
                            new_genid: row.id,
                            old_dta_len: old_data.len() as u32,
                        }),
                        Image::Update(image),
                    );
                }
                None => txn.log(
                    LogBody::Add(DataOp {
                        table: table.to_owned(),
                        dtafile,
                        genid: row.id,
                        len: data.len() as u32,
                    }),
                    Image::Add(data.to_vec()),
                ),
            }
        }
        for (blob_no, old_data) in prev.blobs.iter().filter(|(no, _)| !row.blobs.contains(*no)) {
            txn.log(
                LogBody::Delete(DataOp {
                    table: table.to_owned(),
                    dtafile: blob_no as u8 + 1,
                    genid: prev.id,
                    len: old_data.len() as u32,
                }),
                Image::Delete(old_data.to_vec()),
            );
        }

        let new = row.id;
        let t = self.table_mut(table)?;
        t.remove_row(old.base());
        t.add_row(MemRow {
            id: row.id,
            record: row.record,
            blobs: row.blobs,
            keys: row.keys,
        });
        txn.undo.push(Undo::Replaced {
            table: table_key(table),
            new,
            old: prev,
        });
        txn.tables.insert(table_key(table));
        trace!("update table={table} old={old} new={new} txn={}", txn.id);
        Ok(())
    }

    fn upgrade_row(&mut self, txn: &mut MemTxn, table: &str, id: RowId, record: Vec<u8>) -> Result<()> {
        self.fault(txn)?;
        self.check_writable(table)?;
        self.lock_row(txn, table, id.base())?;
        let t = self.table_mut(table)?;
        let Some(row) = t.rows.get_mut(&id.base()) else {
            return Err(StoreError::NotFound {
                table: table.to_owned(),
                row: id,
            });
        };
        let old = row.clone();
        row.record = record;
        txn.undo.push(Undo::Replaced {
            table: table_key(table),
            new: old.id,
            old,
        });
        txn.log(LogBody::Other, Image::None);
        txn.tables.insert(table_key(table));
        Ok(())
    }

    fn rollback(&mut self, txn: &mut MemTxn) {
        while let Some(undo) = txn.undo.pop() {
            match undo {
                Undo::Inserted { table, id } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.remove_row(id.base());
                    }
                }
                Undo::Removed { table, row } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.add_row(row);
                    }
                }
                Undo::Replaced { table, new, old } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.remove_row(new.base());
                        t.add_row(old);
                    }
                }
            }
        }
        self.release(txn);
    }

    fn release(&mut self, txn: &mut MemTxn) {
        for lock in txn.locks.drain(..) {
            match lock {
                Lock::Row { table, row } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.row_locks.remove(&row);
                    }
                }
                other => {
                    self.locks.remove(&other);
                }
            }
        }
    }

    fn commit(&mut self, mut txn: MemTxn, file_records: u32) -> Result<SeqNum> {
        if let Some(table) = txn.tables.iter().find(|t| self.quiesced.contains(*t)).cloned() {
            self.rollback(&mut txn);
            return Err(StoreError::TableLocked(table));
        }

        let txnid = txn.id;
        let mut prev_lsn = None;
        for (body, image) in txn.log.drain(..) {
            let lsn = self.next_lsn(file_records);
            self.images.insert(lsn, image);
            self.log.push(LogRecord {
                lsn,
                txnid,
                prev_lsn,
                body,
            });
            prev_lsn = Some(lsn);
        }
        if prev_lsn.is_some() {
            let lsn = self.next_lsn(file_records);
            self.log.push(LogRecord {
                lsn,
                txnid,
                prev_lsn,
                body: LogBody::Commit,
            });
            self.last_commit = lsn;
            let notice = CommitNotice { lsn, txnid };
            for table in &txn.tables {
                if let Some(held) = self.held_notices.as_mut() {
                    held.push((table.clone(), notice));
                } else {
                    self.notify(table, notice);
                }
            }
        }

        for (table, key, value) in txn.progress.drain(..) {
            match value {
                Some(value) => self.progress.insert((table, key), value),
                None => self.progress.remove(&(table, key)),
            };
        }

        self.release(&mut txn);
        self.seqnum += 1;
        Ok(SeqNum(self.seqnum))
    }
}

/// An in-memory [`Store`].
pub struct MemStore {
    inner: Mutex<Inner>,
    log_file_records: u32,
    lock_desired: AtomicBool,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_log_file_records(DEFAULT_LOG_FILE_RECORDS)
    }

    /// Create a store whose log rolls over to a new file every `n` records.
    pub fn with_log_file_records(n: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tables: HashMap::new(),
                log: Vec::new(),
                images: HashMap::new(),
                records_written: 0,
                last_commit: Lsn::ZERO,
                next_txnid: 1,
                seqnum: 0,
                locks: HashMap::new(),
                subscribers: HashMap::new(),
                held_notices: None,
                progress: BTreeMap::new(),
                pinned: HashMap::new(),
                quiesced: HashSet::new(),
                stats: LockStats::default(),
                incoherent_nodes: 0,
                disk_headroom_pct: 100.0,
                inject_deadlocks: 0,
                replication_waits: 0,
            }),
            log_file_records: n,
            lock_desired: AtomicBool::new(false),
        }
    }

    /// Create an empty table. Does nothing if the table exists.
    pub fn create_table(&self, name: &str) {
        self.inner.lock().tables.entry(table_key(name)).or_default();
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.inner.lock().table(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// All rows of `table` in row id order.
    pub fn rows(&self, table: &str) -> Vec<RowSnapshot> {
        let inner = self.inner.lock();
        let Ok(t) = inner.table(table) else {
            return Vec::new();
        };
        t.rows
            .values()
            .map(|row| RowSnapshot {
                id: row.id,
                record: row.record.clone(),
                blobs: row.blobs.clone(),
            })
            .collect()
    }

    pub fn row(&self, table: &str, id: RowId) -> Option<RowSnapshot> {
        let inner = self.inner.lock();
        let row = inner.table(table).ok()?.rows.get(&id.base())?;
        Some(RowSnapshot {
            id: row.id,
            record: row.record.clone(),
            blobs: row.blobs.clone(),
        })
    }

    pub fn set_incoherent_nodes(&self, n: usize) {
        self.inner.lock().incoherent_nodes = n;
    }

    pub fn set_disk_headroom_pct(&self, pct: f64) {
        self.inner.lock().disk_headroom_pct = pct;
    }

    /// Make the next `n` lock acquisitions of low priority transactions fail
    /// with [`StoreError::Deadlock`].
    pub fn inject_deadlocks(&self, n: u32) {
        self.inner.lock().inject_deadlocks = n;
    }

    /// While `hold` is true, commit notices are queued instead of delivered.
    /// Releasing the hold delivers them in commit order.
    pub fn hold_commit_notices(&self, hold: bool) {
        let mut inner = self.inner.lock();
        if hold {
            inner.held_notices.get_or_insert_with(Vec::new);
        } else if let Some(held) = inner.held_notices.take() {
            for (table, notice) in held {
                inner.notify(&table, notice);
            }
        }
    }

    pub fn set_lock_desired(&self, desired: bool) {
        self.lock_desired.store(desired, Ordering::Relaxed);
    }

    pub fn pinned_log(&self, table: &str) -> Option<u32> {
        self.inner.lock().pinned.get(&table_key(table)).copied()
    }

    pub fn is_quiesced(&self, table: &str) -> bool {
        self.inner.lock().quiesced.contains(&table_key(table))
    }

    /// Number of times [`Store::wait_for_seqnum`] was called.
    pub fn replication_waits(&self) -> u64 {
        self.inner.lock().replication_waits
    }

    pub fn log_len(&self) -> usize {
        self.inner.lock().log.len()
    }
}

impl Store for MemStore {
    type Txn = MemTxn;

    fn begin_txn(&self, priority: Priority) -> Result<MemTxn> {
        let mut inner = self.inner.lock();
        let id = TxnId(inner.next_txnid);
        inner.next_txnid += 1;
        Ok(MemTxn {
            id,
            priority,
            locks: Vec::new(),
            undo: Vec::new(),
            log: Vec::new(),
            tables: BTreeSet::new(),
            progress: Vec::new(),
            log_bytes: 0,
        })
    }

    fn commit_txn(&self, txn: MemTxn) -> Result<SeqNum> {
        self.inner.lock().commit(txn, self.log_file_records)
    }

    fn abort_txn(&self, mut txn: MemTxn) {
        debug!("abort txn={}", txn.id);
        self.inner.lock().rollback(&mut txn);
    }

    fn txn_log_bytes(&self, txn: &MemTxn) -> usize {
        txn.log_bytes
    }

    fn scan_next(&self, txn: &mut MemTxn, table: &str, cursor: &ScanCursor) -> Result<Option<StoredRow>> {
        self.inner.lock().scan_next(txn, table, cursor)
    }

    fn fetch_row(&self, txn: &mut MemTxn, table: &str, id: RowId) -> Result<Option<StoredRow>> {
        let mut inner = self.inner.lock();
        inner.lock_row(txn, table, id.base())?;
        Ok(inner.table(table)?.snapshot(id.base()))
    }

    fn fetch_blobs(&self, txn: &mut MemTxn, table: &str, id: RowId) -> Result<BlobSet> {
        let mut inner = self.inner.lock();
        inner.fault(txn)?;
        inner.lock_row(txn, table, id.base())?;
        inner
            .table(table)?
            .rows
            .get(&id.base())
            .map(|row| row.blobs.clone())
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_owned(),
                row: id,
            })
    }

    fn insert_row(&self, txn: &mut MemTxn, table: &str, row: RowWrite) -> Result<()> {
        self.inner.lock().insert_row(txn, table, row)
    }

    fn update_row(&self, txn: &mut MemTxn, table: &str, old: RowId, row: RowWrite) -> Result<()> {
        self.inner.lock().update_row(txn, table, old, row)
    }

    fn upgrade_row(&self, txn: &mut MemTxn, table: &str, id: RowId, record: Vec<u8>) -> Result<()> {
        self.inner.lock().upgrade_row(txn, table, id, record)
    }

    fn delete_row(&self, txn: &mut MemTxn, table: &str, id: RowId) -> Result<()> {
        self.inner.lock().delete_row(txn, table, id)
    }

    fn key_exists(&self, txn: &mut MemTxn, table: &str, index: usize, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        let me = txn.id;
        let t = inner.table(table)?;
        let Some(bases) = t.indexes.get(&index).and_then(|index| index.get(key)) else {
            return Ok(false);
        };
        let locked = bases
            .iter()
            .any(|base| t.row_locks.get(base).is_some_and(|owner| *owner != me));
        if locked {
            return Err(conflict(&mut inner.stats));
        }
        Ok(true)
    }

    fn next_row_id(&self, table: &str, stripe: u8) -> Result<RowId> {
        let mut inner = self.inner.lock();
        let t = inner.table_mut(table)?;
        t.next_seq += 1;
        Ok(RowId::new(t.next_seq, stripe))
    }

    fn log_get(&self, lsn: Lsn, direction: Direction) -> Result<Option<LogRecord>> {
        let inner = self.inner.lock();
        let log = &inner.log;
        let idx = match direction {
            Direction::Set => {
                let i = log.partition_point(|r| r.lsn < lsn);
                if !log.get(i).is_some_and(|r| r.lsn == lsn) {
                    return Err(StoreError::LogNotFound { lsn });
                }
                Some(i)
            }
            Direction::Next => {
                let i = log.partition_point(|r| r.lsn <= lsn);
                (i < log.len()).then_some(i)
            }
            Direction::Prev => log.partition_point(|r| r.lsn < lsn).checked_sub(1),
            Direction::First => (!log.is_empty()).then_some(0),
            Direction::Last => log.len().checked_sub(1),
        };
        Ok(idx.map(|i| log[i].clone()))
    }

    fn last_commit_lsn(&self) -> Lsn {
        self.inner.lock().last_commit
    }

    fn reconstruct_add(&self, lsn: Lsn) -> Result<Vec<u8>> {
        match self.inner.lock().images.get(&lsn) {
            Some(Image::Add(bytes)) => Ok(bytes.clone()),
            Some(_) => Err(StoreError::Corrupt(format!("not an add record: {lsn}"))),
            None => Err(StoreError::LogNotFound { lsn }),
        }
    }

    fn reconstruct_delete(&self, lsn: Lsn) -> Result<Vec<u8>> {
        match self.inner.lock().images.get(&lsn) {
            Some(Image::Delete(bytes)) => Ok(bytes.clone()),
            Some(_) => Err(StoreError::Corrupt(format!("not a delete record: {lsn}"))),
            None => Err(StoreError::LogNotFound { lsn }),
        }
    }

    fn reconstruct_update(&self, lsn: Lsn) -> Result<UpdateImage> {
        match self.inner.lock().images.get(&lsn) {
            Some(Image::Update(img)) => Ok(img.clone()),
            Some(_) => Err(StoreError::Corrupt(format!("not an update record: {lsn}"))),
            None => Err(StoreError::LogNotFound { lsn }),
        }
    }

    fn subscribe_commits(&self, table: &str) -> Receiver<CommitNotice> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner
            .lock()
            .subscribers
            .entry(table_key(table))
            .or_default()
            .push(tx);
        rx
    }

    fn unsubscribe_commits(&self, table: &str) {
        self.inner.lock().subscribers.remove(&table_key(table));
    }

    fn pin_log(&self, table: &str, file: u32) {
        debug!("pin log table={table} file={file}");
        self.inner.lock().pinned.insert(table_key(table), file);
    }

    fn quiesce_writes(&self, table: &str) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        inner.table(table)?;
        inner.quiesced.insert(table_key(table));
        Ok(inner.last_commit)
    }

    fn resume_writes(&self, table: &str) {
        self.inner.lock().quiesced.remove(&table_key(table));
    }

    fn swap_tables(&self, a: &str, b: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let ta = inner
            .tables
            .remove(&table_key(a))
            .ok_or_else(|| StoreError::NoSuchTable(a.to_owned()))?;
        let Some(tb) = inner.tables.remove(&table_key(b)) else {
            inner.tables.insert(table_key(a), ta);
            return Err(StoreError::NoSuchTable(b.to_owned()));
        };
        inner.tables.insert(table_key(a), tb);
        inner.tables.insert(table_key(b), ta);
        Ok(())
    }

    fn save_progress(
        &self,
        txn: Option<&mut MemTxn>,
        table: &str,
        key: ProgressKey,
        value: ProgressValue,
    ) -> Result<()> {
        match txn {
            Some(txn) => txn.progress.push((table_key(table), key, Some(value))),
            None => {
                self.inner.lock().progress.insert((table_key(table), key), value);
            }
        }
        Ok(())
    }

    fn load_progress(&self, table: &str, key: ProgressKey) -> Result<Option<ProgressValue>> {
        Ok(self.inner.lock().progress.get(&(table_key(table), key)).copied())
    }

    fn delete_progress(&self, txn: Option<&mut MemTxn>, table: &str, key: ProgressKey) -> Result<()> {
        match txn {
            Some(txn) => txn.progress.push((table_key(table), key, None)),
            None => {
                self.inner.lock().progress.remove(&(table_key(table), key));
            }
        }
        Ok(())
    }

    fn list_progress(&self, table: &str) -> Result<Vec<(ProgressKey, ProgressValue)>> {
        let table = table_key(table);
        Ok(self
            .inner
            .lock()
            .progress
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|((_, key), value)| (*key, *value))
            .collect())
    }

    fn wait_for_seqnum(&self, _seqnum: SeqNum, _timeout: Duration) -> Result<()> {
        self.inner.lock().replication_waits += 1;
        Ok(())
    }

    fn incoherent_nodes(&self) -> usize {
        self.inner.lock().incoherent_nodes
    }

    fn lock_stats(&self) -> LockStats {
        self.inner.lock().stats
    }

    fn disk_headroom_pct(&self) -> f64 {
        self.inner.lock().disk_headroom_pct
    }

    fn lock_desired(&self) -> bool {
        self.lock_desired.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const T: &str = "t1";

    fn row(id: RowId, data: &[u8]) -> RowWrite {
        RowWrite {
            id,
            record: data.to_vec(),
            blobs: BlobSet::new(),
            keys: vec![IndexKey {
                index: 0,
                key: data.to_vec(),
                unique: true,
            }],
        }
    }

    fn store() -> MemStore {
        enable_logging();
        let store = MemStore::with_log_file_records(4);
        store.create_table(T);
        store
    }

    fn commit_insert(store: &MemStore, id: RowId, data: &[u8]) {
        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store.insert_row(&mut txn, T, row(id, data)).unwrap();
        store.commit_txn(txn).unwrap();
    }

    #[test]
    fn conflicting_writers_deadlock() {
        let store = store();
        let id = RowId::new(1, 0);
        let mut a = store.begin_txn(Priority::Normal).unwrap();
        store.insert_row(&mut a, T, row(id, b"a")).unwrap();

        let mut b = store.begin_txn(Priority::Normal).unwrap();
        assert!(matches!(
            store.delete_row(&mut b, T, id),
            Err(StoreError::Deadlock)
        ));
        let mut scan = store.begin_txn(Priority::Low).unwrap();
        let cursor = ScanCursor::Stripe {
            stripe: 0,
            after: StripeCursor::Pending,
        };
        assert!(matches!(
            store.scan_next(&mut scan, T, &cursor),
            Err(StoreError::Deadlock)
        ));
        store.abort_txn(b);
        store.abort_txn(scan);
        store.commit_txn(a).unwrap();

        assert_eq!(store.row_count(T), 1);
        assert_eq!(store.lock_stats().deadlocks, 2);
    }

    #[test]
    fn abort_restores_rows_and_keys() {
        let store = store();
        let id = RowId::new(1, 0);
        commit_insert(&store, id, b"a");

        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store.delete_row(&mut txn, T, id).unwrap();
        store.insert_row(&mut txn, T, row(RowId::new(2, 0), b"a")).unwrap();
        store.abort_txn(txn);

        assert_eq!(store.rows(T).iter().map(|r| r.id).collect::<Vec<_>>(), vec![id]);
        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        assert!(matches!(
            store.insert_row(&mut txn, T, row(RowId::new(3, 0), b"a")),
            Err(StoreError::DuplicateKey { index: 0, .. })
        ));
        assert!(matches!(
            store.insert_row(&mut txn, T, row(id, b"b")),
            Err(StoreError::Exists { .. })
        ));
        store.abort_txn(txn);
    }

    #[test]
    fn stripe_end_blocks_inserts() {
        let store = store();
        commit_insert(&store, RowId::new(1, 0), b"a");

        let mut scan = store.begin_txn(Priority::Low).unwrap();
        let cursor = ScanCursor::Stripe {
            stripe: 0,
            after: StripeCursor::At(RowId::new(1, 0)),
        };
        assert_eq!(store.scan_next(&mut scan, T, &cursor).unwrap(), None);

        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        assert!(matches!(
            store.insert_row(&mut txn, T, row(RowId::new(2, 0), b"b")),
            Err(StoreError::Deadlock)
        ));
        store
            .insert_row(&mut txn, T, row(RowId::new(2, 1), b"b"))
            .unwrap();
        store.commit_txn(txn).unwrap();
        store.commit_txn(scan).unwrap();

        commit_insert(&store, RowId::new(3, 0), b"c");
        assert_eq!(store.row_count(T), 3);
    }

    #[test]
    fn commit_appends_chained_records_and_notifies() {
        let store = store();
        let rx = store.subscribe_commits("T1");
        let id = RowId::new(7, 2);
        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        let mut write = row(id, b"x");
        write.blobs.insert(0, b"blob".to_vec());
        store.insert_row(&mut txn, T, write).unwrap();
        let txnid = txn.id();
        store.commit_txn(txn).unwrap();

        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.txnid, txnid);
        assert_eq!(store.last_commit_lsn(), notice.lsn);

        let commit = store.log_get(notice.lsn, Direction::Set).unwrap().unwrap();
        assert_eq!(commit.body, LogBody::Commit);
        let blob = store.log_get(commit.prev_lsn.unwrap(), Direction::Set).unwrap().unwrap();
        assert_eq!(blob.dtafile(), Some(1));
        assert_eq!(store.reconstruct_add(blob.lsn).unwrap(), b"blob".to_vec());
        let first = store.log_get(blob.prev_lsn.unwrap(), Direction::Set).unwrap().unwrap();
        assert_eq!(first.prev_lsn, None);
        assert_eq!(first.genid(), Some(id));
        assert_eq!(store.log_get(Lsn::ZERO, Direction::Next).unwrap(), Some(first));
    }

    #[test]
    fn held_notices_are_delivered_on_release() {
        let store = store();
        let rx = store.subscribe_commits(T);
        store.hold_commit_notices(true);
        commit_insert(&store, RowId::new(1, 0), b"a");
        let first = store.last_commit_lsn();
        commit_insert(&store, RowId::new(2, 0), b"b");
        assert!(rx.try_recv().is_err());
        assert!(store.log_get(first, Direction::Set).unwrap().is_some());

        store.hold_commit_notices(false);
        let lsns: Vec<Lsn> = rx.try_iter().map(|notice| notice.lsn).collect();
        assert_eq!(lsns, vec![first, store.last_commit_lsn()]);
    }

    #[test]
    fn relocated_empty_blob_update_carries_new_image_in_prev() {
        let store = store();
        let id = RowId::new(1, 0);
        let mut write = row(id, b"a");
        write.blobs.insert(0, Vec::new());
        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store.insert_row(&mut txn, T, write).unwrap();
        store.commit_txn(txn).unwrap();

        let new = RowId::new(5, 0);
        let mut write = row(new, b"a");
        write.blobs.insert(0, b"new".to_vec());
        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store.update_row(&mut txn, T, id, write).unwrap();
        store.commit_txn(txn).unwrap();

        let commit = store.log_get(Lsn::ZERO, Direction::Last).unwrap().unwrap();
        let blob = store.log_get(commit.prev_lsn.unwrap(), Direction::Set).unwrap().unwrap();
        let op = blob.body.as_update().unwrap();
        assert_eq!(op.old_dta_len, 0);
        assert!(!op.is_inplace());
        let img = store.reconstruct_update(blob.lsn).unwrap();
        assert_eq!(img.prev, b"new".to_vec());
        assert!(img.next.is_empty());
    }

    #[test]
    fn progress_writes_follow_the_txn() {
        let store = store();
        let key = ProgressKey::StripeWatermark(1);
        let value = ProgressValue::Cursor(StripeCursor::Done);

        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store.save_progress(Some(&mut txn), T, key, value).unwrap();
        store.abort_txn(txn);
        assert_eq!(store.load_progress(T, key).unwrap(), None);

        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store.save_progress(Some(&mut txn), T, key, value).unwrap();
        store.commit_txn(txn).unwrap();
        assert_eq!(store.high_watermark_row_id(T, 1).unwrap(), StripeCursor::Done);
        assert_eq!(store.list_progress(T).unwrap(), vec![(key, value)]);
    }

    #[test]
    fn quiesced_table_rejects_commits() {
        let store = store();
        let mut txn = store.begin_txn(Priority::Normal).unwrap();
        store.insert_row(&mut txn, T, row(RowId::new(1, 0), b"a")).unwrap();
        store.quiesce_writes(T).unwrap();
        assert!(matches!(store.commit_txn(txn), Err(StoreError::TableLocked(_))));
        assert_eq!(store.row_count(T), 0);

        store.resume_writes(T);
        commit_insert(&store, RowId::new(1, 0), b"a");
        assert_eq!(store.row_count(T), 1);
    }

    #[test]
    fn log_rolls_over_files() {
        let store = store();
        for i in 1..=3 {
            commit_insert(&store, RowId::new(i, 0), &[i as u8]);
        }
        // Two records per commit, four per file.
        assert_eq!(store.log_len(), 6);
        assert_eq!(store.last_commit_lsn(), Lsn::new(2, 2));
    }
}
