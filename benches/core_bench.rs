//! Hot-path benchmarks for the two per-tick loops on the critical path:
//! presence diff draining and matchmaker grouping.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use kaosnet::protocol::StreamMode;
use kaosnet::tracker::{PresenceMeta, PresenceStream, Tracker};
use kaosnet::{Matchmaker, Presence};

fn bench_tracker_track_and_drain(c: &mut Criterion) {
    const SESSIONS: u64 = 2_000;
    let mut group = c.benchmark_group("tracker");
    group.throughput(Throughput::Elements(SESSIONS));

    group.bench_function("track_then_drain", |b| {
        b.iter(|| {
            let tracker = Tracker::new();
            let stream = PresenceStream::new(StreamMode::Match, "bench-match");
            for i in 0..SESSIONS {
                tracker.track(i, format!("user-{i}"), stream.clone(), PresenceMeta::default());
            }
            let diffs = tracker.drain_diffs();
            assert!(!diffs.is_empty());
        })
    });
    group.finish();
}

fn presence(session_id: u64) -> Presence {
    Presence { session_id, user_id: format!("user-{session_id}"), username: format!("Player{session_id}") }
}

fn bench_matchmaker_tick(c: &mut Criterion) {
    const TICKETS: u64 = 500;
    let mut group = c.benchmark_group("matchmaker");
    group.throughput(Throughput::Elements(TICKETS));

    group.bench_function("fill_and_tick", |b| {
        b.iter(|| {
            let matchmaker = Matchmaker::new(8);
            for i in 0..TICKETS {
                matchmaker
                    .add(vec![presence(i)], None, String::new(), 2, 2, None, Default::default())
                    .unwrap();
            }
            let matches = matchmaker.tick();
            assert!(!matches.is_empty());
        })
    });
    group.finish();
}

criterion_group!(benches, bench_tracker_track_and_drain, bench_matchmaker_tick);
criterion_main!(benches);
