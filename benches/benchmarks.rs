//! Benchmark suite for Overseer hot paths.
//!
//! This module provides performance benchmarks for:
//! - Timestamp classification
//! - Scope checks over many sessions
//! - Performance event recording
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use overseer::detector::classify_timestamp;
use overseer::testing::{MockClock, MockConfigStorage, MockSessionRegistry};
use overseer::{
    AgentProvider, ConfigVersionStore, MonitoredScope, MonitoringRegistry, PerformanceEvent,
    SessionInfo, StallDetector,
};

// ============================================================================
// Classification
// ============================================================================

fn bench_classify_timestamp(c: &mut Criterion) {
    let now = Utc::now();
    let threshold = Duration::minutes(5);
    let mut group = c.benchmark_group("classify_timestamp");

    group.bench_function("active", |b| {
        let at = Some(now - Duration::seconds(30));
        b.iter(|| classify_timestamp(black_box(at), threshold, now));
    });
    group.bench_function("stalled", |b| {
        let at = Some(now - Duration::hours(2));
        b.iter(|| classify_timestamp(black_box(at), threshold, now));
    });
    group.finish();
}

// ============================================================================
// Scope checks
// ============================================================================

/// Full check of a master scope where every third session is stalled.
fn bench_scope_check(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("scope_check");

    for size in [10, 100, 1000] {
        let clock = Arc::new(MockClock::new());
        let registry = Arc::new(MonitoringRegistry::with_clock(clock.clone()));
        let sessions = Arc::new(MockSessionRegistry::new());
        for i in 0..size {
            let idle = if i % 3 == 0 { 60 } else { 1 };
            sessions.add_session(
                SessionInfo::new(format!("session-{}", i), "owner")
                    .with_last_activity(clock.now_utc() - Duration::minutes(idle)),
            );
        }
        let detector = StallDetector::new(registry, sessions);
        let scope = MonitoredScope::master("owner");

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &scope, |b, scope| {
            b.iter(|| rt.block_on(detector.check(black_box(scope))).unwrap());
        });
    }
    group.finish();
}

// ============================================================================
// Performance tracking
// ============================================================================

fn bench_record_event(c: &mut Criterion) {
    let registry = Arc::new(MonitoringRegistry::new());
    let storage = Arc::new(MockConfigStorage::new().with_config("s", "# instructions"));
    let store = ConfigVersionStore::new(registry, storage);
    store
        .snapshot("s", "cfg-1", AgentProvider::Claude, None)
        .unwrap();

    c.bench_function("record_event", |b| {
        b.iter(|| {
            store
                .tracker()
                .record(black_box("s"), PerformanceEvent::Success, Some(120.0))
        });
    });
}

criterion_group!(
    benches,
    bench_classify_timestamp,
    bench_scope_check,
    bench_record_event
);
criterion_main!(benches);
