//! Benchmarks for store-side sync operations

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use vitalsync::queue::{OfflineOperation, OperationType};
use vitalsync::realtime::{ChannelMessage, MessageType};
use vitalsync::storage::{OperationStore, RecordStore};
use vitalsync::sync::RemoteRecord;
use vitalsync::types::*;
use vitalsync::Storage;

fn seeded_storage(count: usize) -> Storage {
    let storage = Storage::open_in_memory().unwrap();
    for i in 0..count {
        let record = SyncableRecord::new(EntityType::Metric, json!({"bpm": 50 + (i % 40)}));
        storage.save_record(&record).unwrap();
    }
    storage
}

fn bench_records_needing_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("records_needing_sync");

    for size in [100, 1_000, 5_000] {
        let storage = seeded_storage(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                storage
                    .records_needing_sync(black_box(EntityType::Metric), None)
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_commit_sync_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_sync_updates");

    for size in [100, 1_000] {
        let storage = seeded_storage(size);
        let records = storage.records_needing_sync(EntityType::Metric, None).unwrap();
        // pending <-> conflict is a valid cycle, so every iteration writes
        let to_conflict: Vec<SyncUpdate> = records
            .iter()
            .map(|r| SyncUpdate::status(r.local_id, SyncStatus::Conflict))
            .collect();
        let to_pending: Vec<SyncUpdate> = records
            .iter()
            .map(|r| SyncUpdate::status(r.local_id, SyncStatus::Pending))
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                storage.commit_sync_updates(black_box(&to_conflict)).unwrap();
                storage.commit_sync_updates(black_box(&to_pending)).unwrap();
            })
        });
    }

    group.finish();
}

fn bench_apply_remote_changes(c: &mut Criterion) {
    let storage = Storage::open_in_memory().unwrap();
    let base = Utc::now();
    let mut generation = 0i64;

    c.bench_function("apply_remote_changes_400", |b| {
        b.iter(|| {
            generation += 1;
            let changes: Vec<RemoteRecord> = (0..400)
                .map(|i| RemoteRecord {
                    entity_type: EntityType::Insight,
                    remote_id: format!("ins-{}", i),
                    local_id: None,
                    owner_id: None,
                    modified_at: base + Duration::seconds(generation),
                    payload: json!({"n": i}),
                })
                .collect();
            storage.apply_remote_changes(black_box(&changes)).unwrap()
        })
    });
}

fn bench_queue_roundtrip(c: &mut Criterion) {
    let storage = Storage::open_in_memory().unwrap();

    c.bench_function("queue_save_due_delete", |b| {
        b.iter(|| {
            let op = OfflineOperation::json(OperationType::MetricUpload, &json!({"steps": 1})).unwrap();
            storage.save_operation(&op).unwrap();
            let due = storage.due_operations(Utc::now()).unwrap();
            for op in due {
                storage.delete_operation(op.id).unwrap();
            }
        })
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let message = ChannelMessage::json(
        MessageType::MetricUpdate,
        &json!({
            "metricId": "m-1",
            "type": "heart_rate",
            "value": 61.0,
            "unit": "bpm",
            "timestamp": "2024-05-01T12:00:00Z",
            "source": "watch"
        }),
    )
    .unwrap();
    let frame = message.encode().unwrap();

    c.bench_function("frame_encode", |b| b.iter(|| black_box(&message).encode().unwrap()));
    c.bench_function("frame_decode", |b| {
        b.iter(|| ChannelMessage::decode(black_box(frame.as_bytes())).unwrap())
    });
}

criterion_group!(
    benches,
    bench_records_needing_sync,
    bench_commit_sync_updates,
    bench_apply_remote_changes,
    bench_queue_roundtrip,
    bench_frame_codec,
);
criterion_main!(benches);
