#![allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]

//! Criterion benchmark comparing thread fan-out through a `Registry` in
//! single and multi routing against a plain `rusqlite` connection behind a
//! mutex. Each iteration spreads a batch of single-row lookups across
//! worker threads, so the numbers show what routing and locking cost.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rusqlite::{Connection, Result as RusqliteResult};
use sql_multiplex::prelude::*;
use std::fs;
use std::hint::black_box;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const SQLITE_SELECT: &str = "SELECT id, name, score, active FROM test WHERE id = ?1";

/// Holds the reusable on-disk `SQLite` dataset plus deterministic lookup IDs.
struct Dataset {
    path: String,
    ids: Vec<i64>,
}

// Dataset prepared once and reused across benchmark runs.
static DATASET: LazyLock<Dataset> = LazyLock::new(|| {
    let row_count = lookup_row_count_to_run();
    let path = PathBuf::from("benchmark_registry_multithread_lookup.db");
    prepare_sqlite_dataset(&path, row_count).expect("prepare sqlite dataset");

    let mut ids: Vec<i64> = (1..=row_count as i64).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(9_876_543_210);
    ids.shuffle(&mut rng);

    Dataset {
        path: path.to_string_lossy().into_owned(),
        ids,
    }
});

// Number of worker threads per iteration.
static BENCH_CONCURRENCY: LazyLock<usize> = LazyLock::new(|| concurrency_to_run().max(1));

/// Resolve how many lookups each iteration should perform.
fn lookup_row_count_to_run() -> usize {
    std::env::var("BENCH_LOOKUPS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(1024)
}

/// Resolve how many worker threads to run in parallel.
fn concurrency_to_run() -> usize {
    std::env::var("BENCH_CONCURRENCY")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8)
}

/// Create a fresh `SQLite` file with predictable contents for repeatable runs.
fn prepare_sqlite_dataset(path: &Path, row_count: usize) -> RusqliteResult<()> {
    if path.exists() {
        let _ = fs::remove_file(path);
    }

    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        CREATE TABLE test (
            id      INTEGER PRIMARY KEY,
            name    TEXT NOT NULL,
            score   REAL NOT NULL,
            active  INTEGER NOT NULL
        );
        ",
    )?;

    let tx = conn.transaction()?;
    {
        let mut insert_stmt =
            tx.prepare("INSERT INTO test (id, name, score, active) VALUES (?1, ?2, ?3, ?4)")?;

        for id in 1..=row_count as i64 {
            let name = format!("name-{id}");
            let score = id as f64 * 0.5;
            let active = id % 2 == 0;
            insert_stmt.execute(rusqlite::params![id, name, score, i32::from(active)])?;
        }
    }
    tx.commit()?;

    Ok(())
}

fn chunk_size(total: usize, concurrency: usize) -> usize {
    if concurrency == 0 {
        return total.max(1);
    }
    total.div_ceil(concurrency)
}

fn build_registry(routing_mode: RoutingMode) -> Registry {
    Registry::new(
        DatabaseTarget::file("sqlite", "bench", DATASET.path.clone()),
        AccessPolicy::new()
            .with_routing_mode(routing_mode)
            .with_min_spacing_ms(0)
            .with_idle_timeout_ms(0),
    )
    .expect("create registry")
}

fn registry_parallel_select(
    registry: &Registry,
    ids: &[i64],
    concurrency: usize,
) -> Result<(), SqlMultiplexError> {
    let per_worker = chunk_size(ids.len(), concurrency);
    thread::scope(|s| {
        let workers: Vec<_> = ids
            .chunks(per_worker)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| {
                s.spawn(move || {
                    let mut params = vec![RowValues::Int(0)];
                    for id in chunk {
                        params[0] = RowValues::Int(*id);
                        let mut query = registry.query();
                        query.exec(SQLITE_SELECT, &params)?;
                        let row = query.next_row().ok_or_else(|| {
                            SqlMultiplexError::ExecutionError(
                                "expected row from registry query".to_string(),
                            )
                        })?;
                        black_box(row);
                    }
                    Ok::<(), SqlMultiplexError>(())
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("registry worker panicked")?;
        }
        Ok(())
    })
}

fn mutex_parallel_select(
    conn: &Mutex<Connection>,
    ids: &[i64],
    concurrency: usize,
) -> RusqliteResult<()> {
    let per_worker = chunk_size(ids.len(), concurrency);
    thread::scope(|s| {
        let workers: Vec<_> = ids
            .chunks(per_worker)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| {
                s.spawn(move || {
                    for id in chunk {
                        let guard = conn.lock().expect("acquire rusqlite mutex");
                        let mut stmt = guard.prepare_cached(SQLITE_SELECT)?;
                        let name: String = stmt.query_row([id], |row| row.get(1))?;
                        // try to prevent compiler optimizing away the work we're timing
                        black_box(name);
                    }
                    Ok::<(), rusqlite::Error>(())
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("rusqlite worker panicked")?;
        }
        Ok(())
    })
}

fn benchmark_registry(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
    label: &str,
    routing_mode: RoutingMode,
) {
    let ids = DATASET.ids.clone();
    let concurrency = *BENCH_CONCURRENCY;
    let registry = build_registry(routing_mode);

    group.bench_function(BenchmarkId::new(label, concurrency), |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::default();
            for _ in 0..iters {
                let start = Instant::now();
                registry_parallel_select(&registry, &ids, concurrency)
                    .expect("registry parallel select");
                total += start.elapsed();
                // worker threads are new every iteration; drop their nodes untimed
                registry.destroy_all_connections();
            }
            total
        });
    });
}

fn benchmark_rusqlite_mutex(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
) {
    let ids = DATASET.ids.clone();
    let concurrency = *BENCH_CONCURRENCY;
    let conn = Mutex::new(Connection::open(&DATASET.path).expect("open rusqlite connection"));

    group.bench_function(BenchmarkId::new("rusqlite_mutex", concurrency), |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::default();
            for _ in 0..iters {
                let start = Instant::now();
                mutex_parallel_select(&conn, &ids, concurrency).expect("rusqlite parallel select");
                total += start.elapsed();
            }
            total
        });
    });
}

fn registry_multithread_checkout(c: &mut Criterion) {
    let lookup_count = DATASET.ids.len() as u64;

    let mut group = c.benchmark_group("registry_multithread_checkout");
    group.throughput(Throughput::Elements(lookup_count));

    benchmark_registry(&mut group, "registry_single", RoutingMode::Single);
    benchmark_registry(&mut group, "registry_multi", RoutingMode::Multi);
    benchmark_rusqlite_mutex(&mut group);

    group.finish();
}

criterion_group!(benches, registry_multithread_checkout);
criterion_main!(benches);
