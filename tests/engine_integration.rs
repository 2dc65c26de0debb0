//! End-to-end tests over a real data directory

use chronicle_engine::storage::{
    AllocatorKind, DataPoint, PointRecord, SeriesKey, StorageConfig, StorageEngine, StorageError,
    Tag, TimeRange,
};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn segment_count(engine: &StorageEngine, measurement: &str) -> usize {
    engine
        .get_measurement(measurement)
        .map(|m| m.stats().segments)
        .unwrap_or(0)
}

fn read_all(engine: &StorageEngine, measurement: &str, field: &str) -> Vec<DataPoint> {
    let mut result = engine
        .query(measurement, field, TimeRange::all(), None, None)
        .unwrap();
    assert_eq!(result.len(), 1);
    result.remove(0).points
}

#[test]
fn compaction_preserves_seven_thousand_points() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        segment_size: 512,
        bucket_width_ms: 1024,
        ..StorageConfig::new(dir.path())
    };
    let engine = StorageEngine::open(config).unwrap();

    for i in 0..7000i64 {
        let record = PointRecord::new("sensor", i).float("temp", 20.0 + (i / 100) as f64);
        engine.write_point_locked(&record).unwrap();
    }

    let before = read_all(&engine, "sensor", "temp");
    let segments_before = segment_count(&engine, "sensor");
    assert_eq!(before.len(), 7000);
    assert!(segments_before >= 3, "only {} segments", segments_before);

    let summary = engine.compact_all();
    assert!(summary.compacted_fields > 0);

    let after = read_all(&engine, "sensor", "temp");
    assert_eq!(before, after);
    assert!(segment_count(&engine, "sensor") < segments_before);
    for (i, p) in after.iter().enumerate() {
        assert_eq!(p.timestamp, i as i64);
    }
}

#[test]
fn recovery_reproduces_data_after_rollovers() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        segment_size: 256,
        bucket_width_ms: 20_000,
        ..StorageConfig::new(dir.path())
    };
    let tags = vec![Tag::new("host", "a"), Tag::new("dc", "east")];

    let expected = {
        let engine = StorageEngine::open(config.clone()).unwrap();
        for i in 0..10_000i64 {
            let mut record = PointRecord::new("cpu", i * 10)
                .float("user", (i as f64).sin())
                .long("procs", i % 300 - 150);
            record.tags = tags.clone();
            engine.write_point_locked(&record).unwrap();
        }
        assert!(segment_count(&engine, "cpu") >= 3 * 5 * 2);
        let expected = engine
            .query("cpu", "", TimeRange::all(), None, None)
            .unwrap();
        engine.shutdown().unwrap();
        expected
    };

    let engine = StorageEngine::open(config).unwrap();
    let recovered = engine
        .query("cpu", "", TimeRange::all(), None, None)
        .unwrap();
    assert_eq!(recovered.len(), expected.len());
    for (a, b) in expected.iter().zip(&recovered) {
        assert_eq!(a.field, b.field);
        assert_eq!(a.tags, b.tags);
        assert_eq!(a.points, b.points);
        assert_eq!(b.points.len(), 10_000);
    }
    assert_eq!(
        engine.series_keys("cpu").unwrap(),
        vec![SeriesKey::new("cpu", &tags).unwrap()]
    );
}

#[test]
fn recovery_after_compaction_and_more_writes() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        segment_size: 128,
        ..StorageConfig::new(dir.path())
    };

    {
        let engine = StorageEngine::open(config.clone()).unwrap();
        for i in 0..3000i64 {
            engine
                .write_point_locked(&PointRecord::new("m", i).long("v", i))
                .unwrap();
        }
        let segments_before = segment_count(&engine, "m");
        let summary = engine.compact_all();
        assert_eq!(summary.compacted_fields, 1);
        assert_eq!(summary.failed_fields, 0);
        assert_eq!(segment_count(&engine, "m"), 2);
        assert_eq!(summary.removed_segments, segments_before - 1);
        for i in 3000..4000i64 {
            engine
                .write_point_locked(&PointRecord::new("m", i).long("v", i))
                .unwrap();
        }
        engine.shutdown().unwrap();
    }

    let engine = StorageEngine::open(config).unwrap();
    let points = read_all(&engine, "m", "v");
    assert_eq!(points.len(), 4000);
    assert!(points
        .iter()
        .enumerate()
        .all(|(i, p)| p.timestamp == i as i64 && p.long_value() == i as i64));

    // Still writable after recovery
    engine
        .write_point_locked(&PointRecord::new("m", 4000).long("v", 4000))
        .unwrap();
    assert_eq!(read_all(&engine, "m", "v").len(), 4001);
}

#[test]
fn retention_evicts_only_old_buckets() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        bucket_width_ms: 1000,
        retention_ms: Some(10_000),
        ..StorageConfig::new(dir.path())
    };
    let engine = StorageEngine::open(config).unwrap();
    for ts in (0..20_000).step_by(500) {
        engine
            .write_point_locked(&PointRecord::new("m", ts).long("v", ts))
            .unwrap();
    }
    let buffers_before = engine.get_measurement("m").unwrap().stats().allocator.live_buffers;

    // now = 20s, boundary bucket = 10
    let summary = engine.collect_garbage_at(20_000);
    assert_eq!(summary.evicted_buckets, 10);
    assert_eq!(summary.released_buffers, 10);

    let points = read_all(&engine, "m", "v");
    assert_eq!(points.first().map(|p| p.timestamp), Some(10_000));
    assert_eq!(points.len(), 20);
    let buffers_after = engine.get_measurement("m").unwrap().stats().allocator.live_buffers;
    assert_eq!(buffers_before - buffers_after, 10);
}

#[test]
fn compaction_concurrent_with_appends_loses_nothing() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        segment_size: 96,
        bucket_width_ms: 1000,
        ..StorageConfig::new(dir.path())
    };
    let engine = StorageEngine::open(config).unwrap();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..20_000i64 {
                engine
                    .write_point_locked(&PointRecord::new("m", i).long("v", i * 3))
                    .unwrap();
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                engine.compact_all();
                std::thread::yield_now();
            }
        });
    });

    let points = read_all(&engine, "m", "v");
    assert_eq!(points.len(), 20_000);
    for (i, p) in points.iter().enumerate() {
        assert_eq!(p.timestamp, i as i64);
        assert_eq!(p.long_value(), i as i64 * 3);
    }
}

#[test]
fn queries_see_only_their_own_points_during_compaction_and_retention() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        segment_size: 96,
        bucket_width_ms: 1000,
        file_size: 64 * 1024,
        retention_ms: None,
        ..StorageConfig::new(dir.path())
    };
    let engine = StorageEngine::open(config).unwrap();

    // "steady" is queried throughout; "churn" is written, compacted and
    // evicted around it on the same data directory
    for ts in 10_000..15_000i64 {
        engine
            .write_point_locked(&PointRecord::new("steady", ts).long("a", ts * 7))
            .unwrap();
    }
    engine
        .write_point_locked(&PointRecord::new("churn", 0).long("b", -1))
        .unwrap();
    engine.set_retention("churn", Some(2_000)).unwrap();

    let done = AtomicBool::new(false);
    let latest = AtomicI64::new(0);

    let check_steady = |points: &[DataPoint]| {
        assert!(points.len() >= 5000);
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        for p in points {
            assert_eq!(p.long_value(), p.timestamp * 7, "foreign point {:?}", p);
        }
    };

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 1..20_000i64 {
                engine
                    .write_point_locked(&PointRecord::new("churn", i).long("b", -i - 1))
                    .unwrap();
                latest.store(i, Ordering::Release);
                if i % 4 == 0 {
                    let ts = 15_000 + i / 4;
                    engine
                        .write_point_locked(&PointRecord::new("steady", ts).long("a", ts * 7))
                        .unwrap();
                }
            }
            done.store(true, Ordering::Release);
        });

        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                engine.compact_all();
                engine.collect_garbage_at(latest.load(Ordering::Acquire));
                std::thread::yield_now();
            }
        });

        for _ in 0..2 {
            s.spawn(|| {
                let mut passes = 0;
                while !done.load(Ordering::Acquire) || passes == 0 {
                    let result = engine
                        .query("steady", "a", TimeRange::all(), None, None)
                        .unwrap();
                    assert_eq!(result.len(), 1);
                    assert_eq!(result[0].field, "a");
                    check_steady(&result[0].points);

                    match engine.query("churn", "b", TimeRange::all(), None, None) {
                        Ok(result) => {
                            for p in &result[0].points {
                                assert_eq!(p.long_value(), -p.timestamp - 1);
                            }
                        }
                        Err(StorageError::NotFound(_)) => {}
                        Err(e) => panic!("churn query failed: {}", e),
                    }
                    passes += 1;
                }
            });
        }
    });

    let steady = read_all(&engine, "steady", "a");
    check_steady(&steady);
    assert_eq!(steady.len(), 5000 + 19_999 / 4);

    // Churn kept only its recent buckets
    engine.collect_garbage_at(19_999);
    let churn = read_all(&engine, "churn", "b");
    assert_eq!(churn.first().map(|p| p.timestamp), Some(17_000));
    assert_eq!(churn.last().map(|p| p.timestamp), Some(19_999));
}

#[test]
fn memory_allocator_engine_keeps_nothing_on_disk() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        allocator: AllocatorKind::Memory,
        ..StorageConfig::new(dir.path().join("unused"))
    };
    let engine = StorageEngine::open(config).unwrap();
    engine
        .write_point_unlocked(&PointRecord::new("m", 1).float("v", 0.5))
        .unwrap();
    assert_eq!(read_all(&engine, "m", "v")[0].value(), 0.5);
    assert!(!dir.path().join("unused").exists());
}

#[tokio::test]
async fn background_maintenance_compacts_shared_engine() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        segment_size: 64,
        compaction_interval_ms: 20,
        gc_enabled: false,
        ..StorageConfig::new(dir.path())
    };
    let engine = Arc::new(StorageEngine::open(config).unwrap());
    let handle = engine.start_background_maintenance();

    let writer = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || {
        for i in 0..2000i64 {
            writer
                .write_point_locked(&PointRecord::new("m", i).float("v", 1.5))
                .unwrap();
        }
    })
    .await
    .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    engine.shutdown().unwrap();
    handle.await.unwrap();

    let points = read_all(&engine, "m", "v");
    assert_eq!(points.len(), 2000);
    assert!(points.iter().all(|p| p.value() == 1.5));
}
