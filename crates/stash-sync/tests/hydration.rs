//! End-to-end hydration tests against the in-memory log source.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stash_core::{Fields, FlushMode, RawLogEntry, SchemaError, TableDef, TableId, Value};
use stash_store::{Stash, StashError};
use stash_sync::progress::progress_table_id;
use stash_sync::{
    BlockRange, FetchError, HydrationPipeline, MemoryLogSource, ProgressTracker, RetryPolicy,
    Snapshot, SyncError, SyncOptions, SyncStep, TrackedProgress,
};

// ── Fixtures ───────────────────────────────────────────────────────

fn table1() -> TableDef {
    TableDef::from_abi(
        "namespace1",
        "table1",
        &[("field1", "string"), ("field2", "uint32")],
        &["field2"],
    )
    .unwrap()
}

fn id1() -> TableId {
    table1().id
}

fn key(n: u32) -> Fields {
    Fields::from([("field2".to_string(), Value::from(n))])
}

fn set(block: u64, n: u32, s: &str) -> RawLogEntry {
    let value = Fields::from([("field1".to_string(), Value::from(s))]);
    RawLogEntry::set_record(block, &table1(), &key(n), &value).unwrap()
}

fn set_field(block: u64, n: u32, s: &str) -> RawLogEntry {
    RawLogEntry::set_field(block, &table1(), &key(n), "field1", &Value::from(s)).unwrap()
}

fn delete(block: u64, n: u32) -> RawLogEntry {
    RawLogEntry::delete_record(block, &table1(), &key(n)).unwrap()
}

/// Registration at block 0, then a mix of writes and deletes up to block 20.
fn history() -> Vec<RawLogEntry> {
    let mut logs = vec![RawLogEntry::register_table(0, table1())];
    for block in 1..=20u64 {
        let n = (block % 5) as u32;
        logs.push(set(block, n, &format!("v{block}")).at_index(0));
        if block % 3 == 0 {
            logs.push(set_field(block, n, &format!("f{block}")).at_index(1));
        }
        if block % 4 == 0 {
            logs.push(delete(block, (n + 1) % 5).at_index(2));
        }
    }
    logs
}

fn options() -> SyncOptions {
    SyncOptions {
        max_block_range: 3,
        prefetch: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        },
        ..SyncOptions::default()
    }
}

/// Fetched ranges in block order; concurrent fetches may start in any order.
fn fetched(source: &MemoryLogSource) -> Vec<BlockRange> {
    let mut ranges = source.fetched();
    ranges.sort_by_key(|r| r.from);
    ranges
}

fn field1(stash: &Stash, n: u32) -> Option<String> {
    stash
        .get_record(&id1(), &key(n))
        .and_then(|r| r.get("field1").and_then(Value::as_str).map(str::to_string))
}

// ── Catch-up ───────────────────────────────────────────────────────

#[tokio::test]
async fn catch_up_replays_history_in_block_order() {
    let stash = Stash::manual();
    let source = MemoryLogSource::with_logs(history());
    let blocks = Arc::new(Mutex::new(Vec::new()));
    let sink = blocks.clone();
    let mut pipeline = HydrationPipeline::new(stash.clone(), source.clone(), options())
        .with_block_hook(move |block, _ops| sink.lock().unwrap().push(block));

    let last = pipeline.hydrate().await.unwrap();
    assert_eq!(last, Some(20));
    assert_eq!(pipeline.step(), SyncStep::CatchUp);
    assert_eq!(*blocks.lock().unwrap(), (0..=20).collect::<Vec<u64>>());
    assert_eq!(fetched(&source), BlockRange::new(0, 20).split(3));

    // Block 20: set key 0 to "v20", delete key 1.
    assert_eq!(field1(&stash, 0).as_deref(), Some("v20"));
    assert_eq!(field1(&stash, 1), None);
    // Block 18: set key 3 to "v18", then set field to "f18".
    assert_eq!(field1(&stash, 3).as_deref(), Some("f18"));
}

#[tokio::test]
async fn chunking_disabled_fetches_one_range() {
    let source = MemoryLogSource::with_logs(history());
    let mut pipeline = HydrationPipeline::new(
        Stash::manual(),
        source.clone(),
        SyncOptions {
            enable_chunking: false,
            ..options()
        },
    );
    pipeline.hydrate().await.unwrap();
    assert_eq!(source.fetched(), vec![BlockRange::new(0, 20)]);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_fetches_apply_in_order() {
    let source = MemoryLogSource::with_logs(history());
    // Earlier ranges take longer, so later ones complete first.
    source.set_latency(|range| Duration::from_millis(100 - range.from * 4));
    let blocks = Arc::new(Mutex::new(Vec::new()));
    let sink = blocks.clone();
    let mut pipeline = HydrationPipeline::new(
        Stash::manual(),
        source,
        SyncOptions {
            prefetch: 4,
            ..options()
        },
    )
    .with_block_hook(move |block, _ops| sink.lock().unwrap().push(block));

    pipeline.hydrate().await.unwrap();
    assert_eq!(*blocks.lock().unwrap(), (0..=20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn start_block_skips_earlier_history() {
    let stash = Stash::manual();
    stash.register_table(table1()).unwrap();
    let source = MemoryLogSource::with_logs(history());
    let blocks = Arc::new(Mutex::new(Vec::new()));
    let sink = blocks.clone();
    let mut pipeline = HydrationPipeline::new(
        stash.clone(),
        source.clone(),
        SyncOptions {
            start_block: 10,
            ..options()
        },
    )
    .with_block_hook(move |block, _ops| sink.lock().unwrap().push(block));

    pipeline.hydrate().await.unwrap();
    assert_eq!(fetched(&source)[0].from, 10);
    assert_eq!(*blocks.lock().unwrap(), (10..=20).collect::<Vec<u64>>());
    assert_eq!(field1(&stash, 4).as_deref(), Some("v19"));
}

#[tokio::test]
async fn filters_skip_other_tables() {
    let stash = Stash::manual();
    let source = MemoryLogSource::with_logs(history());
    let mut pipeline = HydrationPipeline::new(
        stash.clone(),
        source,
        SyncOptions {
            filters: vec![TableId::new("namespace1", "other")],
            ..options()
        },
    );
    pipeline.hydrate().await.unwrap();
    assert!(stash.get_table(&id1()).is_none());
}

#[tokio::test]
async fn conflicting_registration_in_log_is_fatal() {
    let conflicting = TableDef::from_abi(
        "namespace1",
        "table1",
        &[("field1", "bytes"), ("field2", "uint32")],
        &["field2"],
    )
    .unwrap();
    let logs = vec![
        RawLogEntry::register_table(0, table1()),
        set(1, 1, "a"),
        RawLogEntry::register_table(2, conflicting),
        set(3, 1, "b"),
    ];
    let stash = Stash::manual();
    let mut pipeline = HydrationPipeline::new(
        stash.clone(),
        MemoryLogSource::with_logs(logs),
        SyncOptions {
            max_block_range: 1,
            prefetch: 1,
            ..options()
        },
    );
    let err = pipeline.hydrate().await.unwrap_err();
    assert_eq!(
        err,
        SyncError::Store(StashError::Schema(SchemaError::Mismatch { table: id1() }))
    );
    assert_eq!(pipeline.step(), SyncStep::Error);
    assert_eq!(pipeline.last_processed(), Some(1));
    assert_eq!(field1(&stash, 1).as_deref(), Some("a"));
}

// ── Snapshot ───────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_plus_replay_matches_full_replay() {
    let full = Stash::manual();
    HydrationPipeline::new(full.clone(), MemoryLogSource::with_logs(history()), options())
        .hydrate()
        .await
        .unwrap();

    let partial = Stash::manual();
    let early: Vec<_> = history().into_iter().filter(|e| e.block_number <= 10).collect();
    HydrationPipeline::new(partial.clone(), MemoryLogSource::with_logs(early), options())
        .hydrate()
        .await
        .unwrap();
    let snapshot = Snapshot::capture(&partial, 10);

    let seeded = Stash::manual();
    let source = MemoryLogSource::with_logs(history());
    let mut pipeline = HydrationPipeline::new(
        seeded.clone(),
        source.clone(),
        SyncOptions {
            initial_state: Some(snapshot),
            ..options()
        },
    );
    assert_eq!(pipeline.hydrate().await.unwrap(), Some(20));
    assert_eq!(fetched(&source)[0].from, 11);
    assert_eq!(seeded.get_records(&id1()), full.get_records(&id1()));
}

#[tokio::test]
async fn snapshot_survives_json() {
    let stash = Stash::manual();
    HydrationPipeline::new(stash.clone(), MemoryLogSource::with_logs(history()), options())
        .hydrate()
        .await
        .unwrap();
    let snapshot = Snapshot::capture(&stash, 20);
    let json = serde_json::to_string(&snapshot).unwrap();
    let parsed: Snapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, snapshot);
}

// ── Failures ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let stash = Stash::manual();
    let source = MemoryLogSource::with_logs(history());
    source.fail_next(2, FetchError::Timeout);
    let mut pipeline = HydrationPipeline::new(stash.clone(), source, options());
    assert_eq!(pipeline.hydrate().await.unwrap(), Some(20));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_halt_the_pipeline() {
    let source = MemoryLogSource::with_logs(history());
    source.fail_next(5, FetchError::Transport("connection reset".into()));
    let mut pipeline = HydrationPipeline::new(Stash::manual(), source, options());
    let progress = pipeline.progress();

    let err = pipeline.hydrate().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::FetchExhausted { ref what, attempts: 3, .. } if what == "head"
    ));
    assert_eq!(pipeline.last_processed(), None);
    assert_eq!(progress.borrow().step, SyncStep::Error);
}

// ── Live ───────────────────────────────────────────────────────────

#[tokio::test]
async fn live_applies_new_ranges_and_drops_stale_ones() {
    let stash = Stash::manual();
    let source = MemoryLogSource::with_logs(history());
    let handle = HydrationPipeline::new(stash.clone(), source.clone(), options()).start();
    let mut progress = handle.progress();
    progress.wait_for(|p| p.step == SyncStep::Live).await.unwrap();
    stash.flush();

    source.announce(BlockRange::new(5, 10));
    source.publish(BlockRange::new(20, 21), vec![set(20, 7, "stale"), set(21, 9, "new")]);
    progress
        .wait_for(|p| p.last_block_number_processed == Some(21))
        .await
        .unwrap();

    assert_eq!(field1(&stash, 9).as_deref(), Some("new"));
    assert_eq!(field1(&stash, 7), None);
    assert_eq!(stash.flush().changes, 1);

    handle.stop();
    handle.stop();
    handle.join().await.unwrap();
    assert_eq!(progress.borrow().step, SyncStep::Stopped);
}

#[tokio::test]
async fn live_entries_apply_in_log_index_order() {
    let stash = Stash::manual();
    let source = MemoryLogSource::with_logs(history());
    let handle = HydrationPipeline::new(stash.clone(), source.clone(), options()).start();
    let mut progress = handle.progress();
    progress.wait_for(|p| p.step == SyncStep::Live).await.unwrap();

    source.publish(
        BlockRange::single(21),
        vec![set(21, 1, "second").at_index(1), set(21, 1, "first").at_index(0)],
    );
    progress
        .wait_for(|p| p.last_block_number_processed == Some(21))
        .await
        .unwrap();
    handle.stop();
    handle.join().await.unwrap();

    assert_eq!(field1(&stash, 1).as_deref(), Some("second"));
}

#[tokio::test]
async fn live_gap_is_fetched_before_the_announced_range() {
    let stash = Stash::manual();
    let source = MemoryLogSource::with_logs(history());
    let blocks = Arc::new(Mutex::new(Vec::new()));
    let sink = blocks.clone();
    let handle = HydrationPipeline::new(stash.clone(), source.clone(), options())
        .with_block_hook(move |block, _ops| sink.lock().unwrap().push(block))
        .start();
    let mut progress = handle.progress();
    progress.wait_for(|p| p.step == SyncStep::Live).await.unwrap();

    source.extend([set(21, 21, "a"), set(22, 22, "b")]);
    source.publish(BlockRange::single(23), vec![set(23, 23, "c")]);
    progress
        .wait_for(|p| p.last_block_number_processed == Some(23))
        .await
        .unwrap();

    assert!(source.fetched().contains(&BlockRange::new(21, 22)));
    assert_eq!(field1(&stash, 21).as_deref(), Some("a"));
    assert_eq!(field1(&stash, 22).as_deref(), Some("b"));
    assert_eq!(field1(&stash, 23).as_deref(), Some("c"));
    assert_eq!(*blocks.lock().unwrap(), (0..=23).collect::<Vec<u64>>());

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_gap_fetch_surfaces_through_join() {
    let stash = Stash::manual();
    let source = MemoryLogSource::with_logs(history());
    let handle = HydrationPipeline::new(stash.clone(), source.clone(), options()).start();
    let mut progress = handle.progress();
    progress.wait_for(|p| p.step == SyncStep::Live).await.unwrap();

    source.extend([set(21, 21, "a")]);
    source.fail_next(10, FetchError::Timeout);
    source.publish(BlockRange::single(22), vec![set(22, 22, "b")]);

    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, SyncError::FetchExhausted { attempts: 3, .. }));
    let last = progress.borrow().clone();
    assert_eq!(last.step, SyncStep::Error);
    assert_eq!(last.last_block_number_processed, Some(20));
    assert_eq!(field1(&stash, 22), None);
}

#[tokio::test]
async fn closed_live_subscription_is_an_error() {
    let source = MemoryLogSource::with_logs(history());
    let handle = HydrationPipeline::new(Stash::manual(), source.clone(), options()).start();
    let mut progress = handle.progress();
    progress.wait_for(|p| p.step == SyncStep::Live).await.unwrap();

    source.close_live();
    assert_eq!(handle.join().await, Err(SyncError::LiveClosed));
}

// ── Progress tracking ──────────────────────────────────────────────

#[tokio::test]
async fn tracker_mirrors_progress_into_the_store() {
    let stash = Stash::manual();
    let tracker = ProgressTracker::new(stash.clone()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = stash.subscribe_table(&progress_table_id(), move |updates| {
        for update in updates {
            if let Some(step) = update
                .current
                .as_ref()
                .and_then(|r| r.get("step"))
                .and_then(Value::as_str)
            {
                sink.lock().unwrap().push(step.to_string());
            }
        }
    });

    let source = MemoryLogSource::with_logs(history());
    let handle = HydrationPipeline::new(stash.clone(), source.clone(), options())
        .with_progress_tracker(tracker)
        .start();
    let mut progress = handle.progress();
    progress.wait_for(|p| p.step == SyncStep::Live).await.unwrap();

    source.publish(BlockRange::single(21), vec![set(21, 1, "x")]);
    progress
        .wait_for(|p| p.last_block_number_processed == Some(21))
        .await
        .unwrap();
    handle.stop();
    handle.join().await.unwrap();
    stash.flush();

    let tracked = TrackedProgress::read(&stash).unwrap();
    assert_eq!(tracked.step, SyncStep::Live);
    assert_eq!(tracked.percentage, 100.0);
    assert_eq!(tracked.last_block_number_processed, 20);

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|s| s == "catchup"));
    assert_eq!(seen.last().map(String::as_str), Some("live"));
    assert_eq!(seen.iter().filter(|s| *s == "live").count(), 1);
}

// ── Runtime flushing ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_thread_catch_up_notifies_once_per_range() {
    let stash = Stash::new(FlushMode::Runtime);
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let _sub = stash.subscribe_table(&id1(), move |updates| {
        sink.lock().unwrap().push(updates.to_vec());
    });

    let source = MemoryLogSource::with_logs(history());
    let mut pipeline = HydrationPipeline::new(
        stash.clone(),
        source,
        SyncOptions {
            enable_chunking: false,
            ..options()
        },
    );
    pipeline.hydrate().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let updates = &batches[0];
    assert!(updates.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(updates.last().map(|u| u.seq), Some(stash.last_seq()));
    assert_eq!(stash.pending_changes(), 0);
    assert_eq!(field1(&stash, 0).as_deref(), Some("v20"));
}
