//! Accumulator throughput.
//!
//! Feeds a run of sync deltas across several rooms and measures the cost of
//! `accumulate` plus a final `state()` snapshot.
//!
//! Run with:
//! ```sh
//! cargo bench --bench accumulate
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;
use tideline_core::config::AccumulatorConfig;
use tideline_core::sync::wire::{EventList, JoinedRoom, RawEvent, Rooms, Timeline};
use tideline_core::sync::{SyncAccumulator, SyncDelta};

const ROOMS: usize = 8;
const TIERS: [(&str, usize); 3] = [("small", 20), ("medium", 200), ("large", 2_000)];

fn message(room: usize, n: usize) -> RawEvent {
    RawEvent {
        event_id: Some(format!("$r{room}e{n}")),
        sender: Some(format!("@user{}:hs", n % 7)),
        origin_server_ts: Some(n as u64),
        ..RawEvent::new("m.room.message", json!({ "body": format!("message {n}") }))
    }
}

fn receipt(room: usize, n: usize) -> RawEvent {
    RawEvent::new(
        "m.receipt",
        json!({ format!("$r{room}e{n}"): { "m.read": { format!("@user{}:hs", n % 7): { "ts": n } } } }),
    )
}

fn deltas(count: usize) -> Vec<SyncDelta> {
    (0..count)
        .map(|batch| {
            let mut rooms = Rooms::default();
            for room in 0..ROOMS {
                let first = batch * 5;
                rooms.join.insert(
                    format!("!room{room}:hs"),
                    JoinedRoom {
                        timeline: Timeline {
                            events: (first..first + 5).map(|n| message(room, n)).collect(),
                            prev_batch: Some(format!("p{batch}")),
                            limited: batch % 50 == 49,
                        },
                        ephemeral: EventList::new(vec![receipt(room, first + 4)]),
                        ..JoinedRoom::default()
                    },
                );
            }
            SyncDelta {
                next_batch: format!("s{batch}"),
                rooms,
                ..SyncDelta::default()
            }
        })
        .collect()
}

fn bench_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate");

    for (name, count) in TIERS {
        let input = deltas(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("deltas", name), &input, |b, input| {
            b.iter(|| {
                let mut acc = SyncAccumulator::new(AccumulatorConfig {
                    max_timeline_entries: 50,
                });
                for delta in input {
                    let _ = black_box(acc.accumulate(delta));
                }
                black_box(acc.state())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_accumulate);
criterion_main!(benches);
