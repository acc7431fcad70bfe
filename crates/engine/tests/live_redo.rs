//! Schema changes of a table that takes writes while it is converted.
//!
//! Application writes are issued from the progress sink, which runs on a
//! converter thread between two rows. That pins them to a known position of
//! the converters.

mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use common::{row_id, test_options, Fixture, OnProgress, SOURCE, TARGET};
use livesc_engine::{Options, ProgressSnapshot, SchemaChange, SchemaChangeError};
use livesc_store::{ProgressKey, ProgressValue, RowId, Store, StripeCursor};
use pretty_assertions::assert_eq;

/// Every stripe converted at least `n` rows.
fn all_stripes_past(snapshot: &ProgressSnapshot, n: u64) -> bool {
    snapshot.per_stripe_rows.iter().all(|&rows| rows >= n)
}

#[test]
fn replays_concurrent_writes() {
    let fx = Fixture::new(2);
    fx.fill(2000);

    let app = fx.app();
    let sc = SchemaChange::new(fx.store.clone(), fx.request().live(), test_options()).unwrap();
    let mut fired = false;
    let sc = sc.with_sink(OnProgress::new(move |snapshot| {
        if fired || snapshot.total_converted < 100 {
            return;
        }
        fired = true;
        // Behind and ahead of the converters.
        app.delete(row_id(42, 2));
        app.delete(row_id(1900, 2));
        app.update(row_id(10, 2), 5000);
        app.update(row_id(1500, 2), 5001);
        let id = app.insert(0, 6000);
        app.update(id, 6001);
        app.insert(1, 6002);
    }));

    let snapshot = sc.start().unwrap();
    assert_eq!(snapshot.redo_transactions_applied, 7);
    assert_eq!(snapshot.pending_races, 0);
    assert_eq!(fx.store.row_count(SOURCE), 2000);
    fx.assert_converted();

    // Live conversions wait for replication after every copied row.
    assert_eq!(fx.store.replication_waits(), snapshot.total_converted);
    assert!(!fx.store.is_quiesced(SOURCE));
    assert!(fx.store.pinned_log(SOURCE).is_some());
    assert_eq!(fx.store.list_progress(SOURCE).unwrap(), vec![]);
}

#[test]
fn duplicate_key_race_keeps_converted_row() {
    let fx = Fixture::new(1);
    fx.fill(300);

    let app = fx.app();
    let store = fx.store.clone();
    let sc = SchemaChange::new(fx.store.clone(), fx.request().live(), test_options()).unwrap();
    let handle = sc.handle();
    let mut raced: Option<RowId> = None;
    let sc = sc.with_sink(OnProgress::new(move |snapshot| match raced {
        None if snapshot.total_converted >= 100 => {
            handle.pause_redo(true);
            // A short lived row behind the converter, followed by a row
            // ahead of it with the same keys.
            let behind = RowId::new(11, 0);
            app.insert_at(behind, 7001);
            app.delete(behind);
            raced = Some(app.insert(0, 7001));
        }
        // The converter copied the new row before the redo sees the old one.
        Some(id) if store.row(common::TARGET, id).is_some() => handle.pause_redo(false),
        _ => {}
    }));

    let snapshot = sc.start().unwrap();
    assert_eq!(snapshot.redo_transactions_applied, 3);
    assert_eq!(snapshot.pending_races, 0);
    fx.assert_converted();
    assert!(fx.store.row(common::TARGET, RowId::new(11, 0)).is_none());
}

#[test]
fn converter_waits_for_redo_to_clear_duplicate() {
    let fx = Fixture::new(1);
    fx.fill(300);

    let app = fx.app();
    let sc = SchemaChange::new(fx.store.clone(), fx.request().live(), test_options()).unwrap();
    let handle = sc.handle();
    let mut stage = 0;
    let sc = sc.with_sink(OnProgress::new(move |snapshot| match stage {
        0 if snapshot.total_converted >= 100 => {
            stage = 1;
            handle.pause_redo(true);
            // Move row 10, which is already copied, ahead of the converter.
            app.delete(row_id(10, 1));
            app.insert(0, 10);
        }
        1 if snapshot.retries > 0 => {
            stage = 2;
            handle.pause_redo(false);
        }
        _ => {}
    }));

    let snapshot = sc.start().unwrap();
    assert!(snapshot.retries > 0);
    assert_eq!(snapshot.redo_transactions_applied, 2);
    fx.assert_converted();
    assert!(fx.store.row(common::TARGET, row_id(10, 1)).is_none());
}

#[test]
fn resume_replays_log_from_saved_position() {
    let fx = Fixture::new(2);
    fx.fill(1000);

    let app = fx.app();
    let sc = SchemaChange::new(fx.store.clone(), fx.request().live(), test_options()).unwrap();
    let handle = sc.handle();
    let mut fired = false;
    let sc = sc.with_sink(OnProgress::new(move |snapshot| {
        if fired || snapshot.total_converted < 100 {
            return;
        }
        fired = true;
        app.update(row_id(5, 2), 8000);
        app.delete(row_id(7, 2));
        app.insert(1, 8001);
        handle.request_abort();
    }));
    assert!(matches!(sc.start(), Err(SchemaChangeError::Aborted(_))));
    assert!(fx
        .store
        .list_progress(SOURCE)
        .unwrap()
        .iter()
        .any(|(key, _)| *key == ProgressKey::StartLsn));

    // The interrupted change used the log, so must its continuation.
    let mut req = fx.request();
    req.resume = true;
    assert!(matches!(
        SchemaChange::new(fx.store.clone(), req, test_options()).unwrap().start(),
        Err(SchemaChangeError::Config(_))
    ));

    // Writes while nothing runs are picked up from the log as well.
    fx.app().update(row_id(9, 2), 8002);

    let mut req = fx.request().live();
    req.resume = true;
    let snapshot = SchemaChange::new(fx.store.clone(), req, test_options())
        .unwrap()
        .start()
        .unwrap();
    assert_eq!(snapshot.pending_races, 0);
    fx.assert_converted();
    assert_eq!(fx.store.list_progress(SOURCE).unwrap(), vec![]);
}

#[test]
fn commits_of_other_tables_are_ignored() {
    let fx = Fixture::new(2);
    fx.fill(500);
    fx.store.create_table("audit");

    let store = fx.store.clone();
    let def = fx.source.clone();
    let sc = SchemaChange::new(fx.store.clone(), fx.request().live(), test_options()).unwrap();
    let mut fired = false;
    let sc = sc.with_sink(OnProgress::new(move |snapshot| {
        if fired || snapshot.total_converted < 50 {
            return;
        }
        fired = true;
        loop {
            let mut txn = store.begin_txn(livesc_store::Priority::Normal).unwrap();
            let id = store.next_row_id("audit", 0).unwrap();
            match store.insert_row(&mut txn, "audit", common::write(&def, id, &common::values(1))) {
                Ok(()) => {
                    store.commit_txn(txn).unwrap();
                    break;
                }
                Err(_) => store.abort_txn(txn),
            }
        }
    }));

    let snapshot = sc.start().unwrap();
    assert_eq!(snapshot.redo_transactions_applied, 0);
    fx.assert_converted();
}

#[test]
fn commits_announced_late_are_replayed_from_the_log() {
    let fx = Fixture::new(2);
    fx.fill(1000);
    // No notice arrives before the change is over.
    fx.store.hold_commit_notices(true);

    let app = fx.app();
    let opts = Options {
        redo_wait_timeout: Duration::from_secs(3600),
        ..test_options()
    };
    let sc = SchemaChange::new(fx.store.clone(), fx.request().live(), opts).unwrap();
    let mut fired = false;
    let sc = sc.with_sink(OnProgress::new(move |snapshot| {
        if fired || !all_stripes_past(snapshot, 60) {
            return;
        }
        fired = true;
        app.delete(row_id(42, 2));
        app.update(row_id(10, 2), 9000);
        app.insert_at(RowId::new(11, 1), 9001);
    }));

    let snapshot = sc.start().unwrap();
    assert_eq!(snapshot.redo_transactions_applied, 3);
    fx.assert_converted();
    assert!(fx.store.row(TARGET, row_id(42, 2)).is_none());
}

#[test]
fn stale_race_entry_fails_the_change() {
    let fx = Fixture::new(2);
    fx.fill(200);
    let start = fx.store.last_commit_lsn();
    let raced = RowId::new(999_999, 0);
    fx.store
        .save_progress(None, SOURCE, ProgressKey::StartLsn, ProgressValue::Lsn(start))
        .unwrap();
    fx.store
        .save_progress(None, SOURCE, ProgressKey::RedoGenid(raced), ProgressValue::Lsn(start))
        .unwrap();
    // The log moves past the entry without ever deleting the row.
    fx.app().update(row_id(5, 2), 9000);

    let mut req = fx.request().live();
    req.resume = true;
    let err = SchemaChange::new(fx.store.clone(), req, test_options())
        .unwrap()
        .start()
        .unwrap_err();
    assert!(err.is_failure());
    match err {
        SchemaChangeError::IntegrityViolation { row, lsn, .. } => {
            assert_eq!(row, raced);
            assert_eq!(lsn, start);
        }
        e => panic!("unexpected error: {e}"),
    }
}

#[test]
fn replaying_applied_transactions_again_is_harmless() {
    let fx = Fixture::new(2);
    fx.fill(1000);

    let app = fx.app();
    let sc = SchemaChange::new(fx.store.clone(), fx.request().live(), test_options()).unwrap();
    let handle = sc.handle();
    let mut fired = false;
    let sc = sc.with_sink(OnProgress::new(move |snapshot| {
        if fired || !all_stripes_past(snapshot, 60) {
            return;
        }
        fired = true;
        app.delete(row_id(42, 2));
        app.update(row_id(10, 2), 5000);
        app.update(row_id(900, 2), 5001);
        app.insert(1, 5002);
        app.insert_at(RowId::new(11, 1), 5003);
        app.delete(row_id(7, 2));
        // Hold this converter until the redo applied all of them.
        let deadline = Instant::now() + Duration::from_secs(30);
        while handle.progress_snapshot().redo_transactions_applied < 6 {
            assert!(Instant::now() < deadline, "redo did not catch up");
            thread::sleep(Duration::from_millis(1));
        }
        handle.request_abort();
    }));
    assert!(matches!(sc.start(), Err(SchemaChangeError::Aborted(_))));

    // Fewer transactions than a redo checkpoint, so the start position is
    // still the original one.
    let mut req = fx.request().live();
    req.resume = true;
    let snapshot = SchemaChange::new(fx.store.clone(), req, test_options())
        .unwrap()
        .start()
        .unwrap();
    assert_eq!(snapshot.redo_transactions_applied, 6);
    assert_eq!(snapshot.pending_races, 0);
    fx.assert_converted();
}

#[test]
fn redo_insert_of_row_copied_meanwhile() {
    let fx = Fixture::new(2);
    fx.fill(2000);
    // Between rows 1500 and 1502 of stripe 0.
    let inserted = RowId::new(3001, 0);

    let app = fx.app();
    let sc = SchemaChange::new(fx.store.clone(), fx.request().live(), test_options()).unwrap();
    let handle = sc.handle();
    let mut stage = 0;
    let sc = sc.with_sink(OnProgress::new(move |snapshot| match stage {
        0 if snapshot.per_stripe_rows[0] >= 50 => {
            stage = 1;
            handle.pause_redo(true);
            app.insert_at(inserted, 7000);
        }
        // The converter copied the row and moved on before the redo sees
        // the insert.
        1 if matches!(snapshot.stripes[0], StripeCursor::At(id) if id > inserted)
            || snapshot.stripes[0] == StripeCursor::Done =>
        {
            stage = 2;
            handle.pause_redo(false);
        }
        _ => {}
    }));

    let snapshot = sc.start().unwrap();
    assert_eq!(snapshot.redo_transactions_applied, 1);
    assert_eq!(snapshot.pending_races, 0);
    fx.assert_converted();
    assert!(fx.store.row(TARGET, inserted).is_some());
}
