//! One seeded run: sync rounds into an accumulator and a room arena, then a
//! window paged back through the history, one more sync round the window has
//! to follow, and decryption and relation aggregation on what it shows.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tideline_core::config::{AccumulatorConfig, WindowConfig};
use tideline_core::crypto::{DecryptionBus, decrypt_event};
use tideline_core::event::{Event, RelationType, types};
use tideline_core::relations::{ReaggregationTrigger, RelationsCollection};
use tideline_core::sync::{SyncAccumulator, SyncState};
use tideline_core::timeline::{Direction, PaginateOptions, RoomTimeline, TimelineWindow};
use tracing::debug;

use crate::crypto::SimDecryptor;
use crate::homeserver::{FetchStats, ROOM_ID, ServerFaults, SimulatedHomeserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Sync rounds before the window is opened.
    pub rounds: u64,
    /// Backward paginations after the window loads.
    pub paginations: usize,
    /// Events requested per pagination.
    pub page_size: usize,
    pub faults: ServerFaults,
    pub accumulator: AccumulatorConfig,
    pub window: WindowConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            rounds: 24,
            paginations: 6,
            page_size: 5,
            faults: ServerFaults::default(),
            accumulator: AccumulatorConfig {
                max_timeline_entries: 12,
            },
            window: WindowConfig {
                window_limit: 16,
                initial_size: 8,
                request_limit: 2,
            },
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if a limit is zero or the initial window would not
    /// fit under its limit.
    pub fn validate(&self) -> Result<()> {
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.page_size == 0 {
            bail!("page_size must be > 0");
        }
        if self.faults.max_batch == 0 {
            bail!("max_batch must be > 0");
        }
        if self.accumulator.max_timeline_entries == 0 {
            bail!("max_timeline_entries must be > 0");
        }
        if self.window.initial_size > self.window.window_limit {
            bail!(
                "initial_size ({}) exceeds window_limit ({})",
                self.window.initial_size,
                self.window.window_limit
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Delta {
        next_batch: String,
        appended: usize,
        delivered: usize,
        limited: bool,
    },
    RoomRejected {
        room_id: String,
    },
    WindowLoaded {
        events: usize,
    },
    Paginated {
        grew: bool,
        events: usize,
    },
    Decrypted {
        event_id: String,
        failed: bool,
    },
    RoomUpdatesApplied {
        updates: usize,
        events: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

/// Reactions aggregated for one target versus those visible in the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTally {
    pub target: String,
    pub expected: usize,
    pub aggregated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    /// Server history, in order.
    pub history: Vec<String>,
    pub accumulated: SyncState,
    pub max_timeline_entries: usize,
    pub window_events: Vec<String>,
    pub window_limit: usize,
    pub expected_receipts: BTreeMap<String, String>,
    pub relations: Vec<RelationTally>,
    pub fetches: FetchStats,
    /// A gap, stall, failed fetch or failed decryption happened.
    pub interesting_state_reached: bool,
}

#[derive(Debug)]
pub struct Simulator {
    config: SimulationConfig,
    server: Arc<SimulatedHomeserver>,
    accumulator: SyncAccumulator,
    room: Arc<Mutex<RoomTimeline>>,
    trace: Vec<TraceEvent>,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if the config is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            server: Arc::new(SimulatedHomeserver::new(config.seed, config.faults)),
            accumulator: SyncAccumulator::new(config.accumulator),
            room: Arc::new(Mutex::new(RoomTimeline::new(ROOM_ID))),
            trace: Vec::new(),
            config,
        })
    }

    /// Run to completion on a single-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot start or a delta is rejected
    /// as a whole.
    pub fn run(self) -> Result<SimulationResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .context("failed to start simulation runtime")?;
        runtime.block_on(self.run_async())
    }

    /// Pull one delta from the server into the accumulator and the arena.
    /// Returns whether the delta was limited.
    fn sync_round(&mut self, round: u64) -> Result<bool> {
        let (delta, summary) = self.server.next_delta();
        let limited = summary.limited;
        self.trace.push(TraceEvent {
            round,
            kind: TraceEventKind::Delta {
                next_batch: summary.next_batch,
                appended: summary.appended,
                delivered: summary.delivered,
                limited,
            },
        });

        let report = self
            .accumulator
            .accumulate(&delta)
            .with_context(|| format!("round {round} delta rejected"))?;
        for rejected in report.rejected {
            self.trace.push(TraceEvent {
                round,
                kind: TraceEventKind::RoomRejected {
                    room_id: rejected.room_id,
                },
            });
        }
        if let Some(joined) = delta.rooms.join.get(ROOM_ID) {
            self.room.lock().handle_sync_timeline(&joined.timeline);
        }
        Ok(limited)
    }

    async fn run_async(mut self) -> Result<SimulationResult> {
        let mut gaps = 0;
        for round in 0..self.config.rounds {
            if self.sync_round(round)? {
                gaps += 1;
            }
        }

        let round = self.config.rounds;
        let window = TimelineWindow::new(
            self.room.clone(),
            self.server.clone(),
            self.config.window,
        );
        window
            .load(None, self.config.window.initial_size)
            .await
            .context("loading window at live edge")?;
        self.trace.push(TraceEvent {
            round,
            kind: TraceEventKind::WindowLoaded {
                events: window.event_count(),
            },
        });

        let options = PaginateOptions::from_config(&self.config.window);
        for _ in 0..self.config.paginations {
            let grew = window
                .paginate(Direction::Backward, self.config.page_size, options)
                .await;
            self.trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Paginated {
                    grew,
                    events: window.event_count(),
                },
            });
        }

        // One more sync with the window open; it must keep up with the arena.
        let round = round + 1;
        if self.sync_round(round)? {
            gaps += 1;
        }
        let updates = window.apply_room_updates();
        window
            .paginate(
                Direction::Forward,
                self.config.page_size,
                PaginateOptions::local_only(),
            )
            .await;
        self.trace.push(TraceEvent {
            round,
            kind: TraceEventKind::RoomUpdatesApplied {
                updates,
                events: window.event_count(),
            },
        });

        let (collection, decryption_failures) = self.aggregate(&window, round).await;
        let shown = window.events();
        let relations = tally_relations(&shown, &collection.lock());
        let window_events = shown.into_iter().map(|e| e.event_id).collect();
        let fetches = self.server.fetch_stats();
        debug!(seed = self.config.seed, gaps, ?fetches, "simulation finished");

        Ok(SimulationResult {
            seed: self.config.seed,
            trace: self.trace,
            history: self.server.history_ids(),
            accumulated: self.accumulator.state(),
            max_timeline_entries: self.config.accumulator.max_timeline_entries,
            window_events,
            window_limit: self.config.window.window_limit,
            expected_receipts: self.server.expected_receipts(),
            relations,
            interesting_state_reached: gaps > 0
                || fetches.stalls > 0
                || fetches.failures > 0
                || decryption_failures > 0,
            fetches,
        })
    }

    /// Feed the window into a relations collection, then decrypt whatever is
    /// pending and let the trigger forward the outcomes. Also returns how
    /// many decryptions failed.
    async fn aggregate(
        &mut self,
        window: &TimelineWindow,
        round: u64,
    ) -> (Arc<Mutex<RelationsCollection>>, usize) {
        let bus = DecryptionBus::default();
        let relations = Arc::new(Mutex::new(RelationsCollection::new()));
        let mut trigger = ReaggregationTrigger::new(&bus);
        trigger.register(relations.clone());
        trigger.register(self.room.clone());

        let events = window.events();
        {
            let mut rels = relations.lock();
            for event in &events {
                rels.add_event(event);
            }
        }

        let mut failures = 0;
        for mut event in events {
            if let Some(update) = decrypt_event(&SimDecryptor, &mut event, &bus).await {
                let failed = update.is_failure();
                failures += usize::from(failed);
                self.trace.push(TraceEvent {
                    round,
                    kind: TraceEventKind::Decrypted {
                        event_id: update.event_id,
                        failed,
                    },
                });
            }
        }
        trigger.pump();
        (relations, failures)
    }
}

fn tally_relations(shown: &[Event], relations: &RelationsCollection) -> Vec<RelationTally> {
    let mut expected: BTreeMap<String, usize> = BTreeMap::new();
    for event in shown {
        if event.effective_type() == types::REACTION
            && let Some(relation) = event.relation()
        {
            *expected.entry(relation.target).or_default() += 1;
        }
    }

    expected
        .into_iter()
        .map(|(target, expected)| {
            let aggregated = relations
                .get_relations_for_event(&target, &RelationType::Annotation, Some(types::REACTION))
                .map_or(0, |set| set.len());
            RelationTally {
                target,
                expected,
                aggregated,
            }
        })
        .collect()
}
