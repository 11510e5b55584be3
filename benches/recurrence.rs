//! Benchmarks verifying the recurrence engine stays cheap enough to
//! evaluate on every scheduler tick for a large job set.
//!
//! Claim under test: computing `next()` for a hashed cron-like schedule
//! costs low-single-digit microseconds, so a daemon with thousands of
//! scheduled jobs can recompute every wake-up once per tick without the
//! recurrence engine itself becoming the bottleneck.

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use schedulerd::recurrence;

fn bench_hash_cron_next(c: &mut Criterion) {
    let anchor = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let tz = chrono_tz::UTC;

    c.bench_function("recurrence::next hashed hourly", |b| {
        b.iter(|| {
            recurrence::next(black_box("H * * * *"), black_box("hello"), &tz, black_box(anchor)).unwrap()
        })
    });
}

fn bench_alias_daily_next(c: &mut Criterion) {
    let anchor = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let tz = chrono_tz::UTC;

    c.bench_function("recurrence::next @daily", |b| {
        b.iter(|| recurrence::next(black_box("@daily"), black_box("hello"), &tz, black_box(anchor)).unwrap())
    });
}

fn bench_many_jobs_one_tick(c: &mut Criterion) {
    let anchor = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let tz = chrono_tz::UTC;
    let names: Vec<String> = (0..2_000).map(|i| format!("job-{i}")).collect();

    c.bench_function("recurrence::next for 2000 distinct jobs", |b| {
        b.iter(|| {
            for name in &names {
                black_box(recurrence::next("H H * * *", name, &tz, anchor).unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_hash_cron_next, bench_alias_daily_next, bench_many_jobs_one_tick);
criterion_main!(benches);
