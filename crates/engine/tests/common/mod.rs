#![allow(dead_code)]

use std::{sync::Arc, thread, time::Duration};

use livesc_engine::{
    odh,
    tagmap::TagMap,
    Column, ColumnType, IndexDef, Options, ProgressSink, ProgressSnapshot, SchemaChangeError, SchemaChangeRequest,
    SchemaHistory, TableDef, Value,
};
use livesc_store::{BlobSet, IndexKey, MemStore, Priority, RowId, RowWrite, Store, StoreError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

pub use livesc_store::mem::enable_logging;

pub const SOURCE: &str = "orders";
pub const TARGET: &str = "new_orders";

fn unique(name: &str, column: usize) -> IndexDef {
    IndexDef {
        name: name.into(),
        columns: vec![column],
        unique: true,
        predicate: None,
    }
}

pub fn source_def() -> TableDef {
    TableDef::new(
        SOURCE,
        1,
        vec![
            Column::new("id", ColumnType::Int),
            Column::new("sku", ColumnType::Text(16)),
            Column::new("qty", ColumnType::Int).nullable(),
        ],
    )
    .with_index(unique("pk", 0))
    .with_index(unique("by_sku", 1))
}

/// Wider `sku`, plus a new column with a default.
pub fn target_def() -> TableDef {
    TableDef::new(
        TARGET,
        2,
        vec![
            Column::new("id", ColumnType::Int),
            Column::new("sku", ColumnType::Text(24)),
            Column::new("qty", ColumnType::Int).nullable(),
            Column::new("note", ColumnType::Text(8)).with_default(Value::Text("n/a".into())),
        ],
    )
    .compressed()
    .with_index(unique("pk", 0))
    .with_index(unique("by_sku", 1))
}

pub fn values(n: i64) -> Vec<Value> {
    vec![Value::Int(n), Value::Text(format!("sku-{n}")), Value::Int(n % 7)]
}

/// Id of the `n`th row of a table filled by [`Fixture::fill`]. Only even
/// sequence numbers are used, leaving room for rows inserted behind a
/// converter.
pub fn row_id(n: u64, stripes: u8) -> RowId {
    RowId::new(2 * n, (n % stripes as u64) as u8)
}

pub fn write(def: &TableDef, id: RowId, values: &[Value]) -> RowWrite {
    let encoded = def.encode(values).unwrap();
    let keys = def
        .indexes
        .iter()
        .enumerate()
        .map(|(i, index)| IndexKey {
            index: i,
            key: def.index_key(i, &encoded),
            unique: index.unique,
        })
        .collect();
    RowWrite {
        id,
        record: odh::pack(def.version, &encoded, def.compressed),
        blobs: BlobSet::new(),
        keys,
    }
}

pub fn decode(def: &TableDef, record: &[u8]) -> Vec<Value> {
    let unpacked = odh::unpack(record).unwrap();
    assert_eq!(unpacked.version, def.version, "record of unexpected version");
    def.decode(&unpacked.payload).unwrap()
}

/// Options suitable for tests: report after every row and don't wait long.
pub fn test_options() -> Options {
    Options {
        report_interval: Duration::ZERO,
        redo_wait_timeout: Duration::from_millis(20),
        find_txn_interval: Duration::from_millis(1),
        retry_sleep_min: Duration::from_millis(1),
        retry_sleep_max: Duration::from_millis(5),
        ..Options::default()
    }
}

pub struct Fixture {
    pub store: Arc<MemStore>,
    pub source: TableDef,
    pub target: TableDef,
    pub stripes: u8,
}

impl Fixture {
    pub fn new(stripes: u8) -> Self {
        enable_logging();
        let store = Arc::new(MemStore::new());
        store.create_table(SOURCE);
        store.create_table(TARGET);
        Self {
            store,
            source: source_def(),
            target: target_def(),
            stripes,
        }
    }

    /// Insert rows `1..=n` in one transaction.
    pub fn fill(&self, n: u64) {
        let mut txn = self.store.begin_txn(Priority::Normal).unwrap();
        for i in 1..=n {
            let row = write(&self.source, row_id(i, self.stripes), &values(i as i64));
            self.store.insert_row(&mut txn, SOURCE, row).unwrap();
        }
        self.store.commit_txn(txn).unwrap();
    }

    pub fn history(&self) -> Arc<SchemaHistory> {
        Arc::new(SchemaHistory::new(self.source.clone()))
    }

    pub fn request(&self) -> SchemaChangeRequest {
        SchemaChangeRequest::new(self.history(), Arc::new(self.target.clone())).with_stripes(self.stripes)
    }

    pub fn app(&self) -> App {
        App {
            store: self.store.clone(),
            def: self.source.clone(),
        }
    }

    /// Assert that the target table holds exactly the converted rows of the
    /// source table.
    pub fn assert_converted(&self) {
        let map = TagMap::new(Arc::new(self.source.clone()), Arc::new(self.target.clone())).unwrap();
        let expected: Vec<(RowId, Vec<Value>)> = self
            .store
            .rows(SOURCE)
            .into_iter()
            .map(|row| (row.id, map.convert(&decode(&self.source, &row.record)).unwrap()))
            .collect();
        let actual: Vec<(RowId, Vec<Value>)> = self
            .store
            .rows(TARGET)
            .into_iter()
            .map(|row| (row.id, decode(&self.target, &row.record)))
            .collect();
        assert_eq!(expected, actual);
    }
}

/// Writes to the source table the way an application would, retrying lock
/// conflicts.
pub struct App {
    pub store: Arc<MemStore>,
    pub def: TableDef,
}

impl App {
    fn run<T>(&self, mut f: impl FnMut(&MemStore, &mut <MemStore as Store>::Txn) -> Result<T, StoreError>) -> T {
        loop {
            let mut txn = self.store.begin_txn(Priority::Normal).unwrap();
            match f(&self.store, &mut txn) {
                Ok(res) => {
                    self.store.commit_txn(txn).unwrap();
                    return res;
                }
                Err(StoreError::Deadlock) => {
                    self.store.abort_txn(txn);
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("application write failed: {e}"),
            }
        }
    }

    pub fn insert_at(&self, id: RowId, n: i64) {
        self.run(|store, txn| store.insert_row(txn, SOURCE, write(&self.def, id, &values(n))));
    }

    /// Insert a row with a freshly allocated id.
    pub fn insert(&self, stripe: u8, n: i64) -> RowId {
        let id = self.store.next_row_id(SOURCE, stripe).unwrap();
        self.insert_at(id, n);
        id
    }

    /// Replace the values of row `id` by those of `n`, returning the new id.
    pub fn update(&self, id: RowId, n: i64) -> RowId {
        let new = id.next_update();
        self.run(|store, txn| store.update_row(txn, SOURCE, id, write(&self.def, new, &values(n))));
        new
    }

    pub fn delete(&self, id: RowId) {
        self.run(|store, txn| store.delete_row(txn, SOURCE, id));
    }
}

/// Calls a closure with every progress report.
pub struct OnProgress(Mutex<Box<dyn FnMut(&ProgressSnapshot) + Send>>);

impl OnProgress {
    pub fn new(f: impl FnMut(&ProgressSnapshot) + Send + 'static) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Box::new(f))))
    }
}

impl ProgressSink for OnProgress {
    fn progress(&self, _table: &str, snapshot: &ProgressSnapshot) {
        (self.0.lock())(snapshot)
    }

    fn finished(&self, table: &str, outcome: Result<&ProgressSnapshot, &SchemaChangeError>) {
        log::info!("finished table={table} ok={}", outcome.is_ok());
    }
}
