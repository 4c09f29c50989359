use std::collections::HashMap;
use std::fmt;

use tideline_core::config::AccumulatorConfig;
use tideline_core::sync::{SyncAccumulator, ThreadKey};

use crate::homeserver::ROOM_ID;
use crate::simulator::SimulationResult;

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    const fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The accumulator kept more timeline events than allowed.
    TimelineOverLimit { len: usize, limit: usize },
    /// The accumulated timeline is not a contiguous run ending at the newest
    /// server event.
    TimelineNotSuffix { kept: Vec<String> },
    /// The first retained event's token points past that event.
    PrevBatchAhead { token: String, first_position: usize },
    /// Restoring the checkpoint did not reproduce it.
    CheckpointDrift,
    /// The window shows an event the server never sent, or out of order.
    WindowOrder { event_id: String, detail: String },
    WindowOverLimit { len: usize, limit: usize },
    /// A user's accumulated read receipt is not the last one sent.
    ReceiptMismatch {
        user: String,
        expected: String,
        actual: Option<String>,
    },
    /// Reactions visible in the window were not all aggregated once.
    RelationMismatch {
        target: String,
        expected: usize,
        aggregated: usize,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimelineOverLimit { len, limit } => {
                write!(f, "TimelineOverLimit: {len} events retained, limit {limit}")
            }
            Self::TimelineNotSuffix { kept } => {
                write!(f, "TimelineNotSuffix: retained {kept:?} is not the newest run")
            }
            Self::PrevBatchAhead {
                token,
                first_position,
            } => write!(
                f,
                "PrevBatchAhead: token {token} is past the first retained event (position {first_position})"
            ),
            Self::CheckpointDrift => write!(f, "CheckpointDrift: restore changed the state"),
            Self::WindowOrder { event_id, detail } => {
                write!(f, "WindowOrder: {event_id} {detail}")
            }
            Self::WindowOverLimit { len, limit } => {
                write!(f, "WindowOverLimit: {len} events shown, limit {limit}")
            }
            Self::ReceiptMismatch {
                user,
                expected,
                actual,
            } => write!(
                f,
                "ReceiptMismatch: {user} expected {expected}, found {actual:?}"
            ),
            Self::RelationMismatch {
                target,
                expected,
                aggregated,
            } => write!(
                f,
                "RelationMismatch: {target} has {expected} visible reactions, {aggregated} aggregated"
            ),
        }
    }
}

/// Invariant checks over a finished [`SimulationResult`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOracle;

impl SyncOracle {
    /// Retained timeline is bounded, a contiguous run ending at the live
    /// edge, and its token does not skip ahead of it.
    #[must_use]
    pub fn check_timeline(result: &SimulationResult) -> OracleResult {
        let Some(room) = result.accumulated.rooms.join.get(ROOM_ID) else {
            return OracleResult::pass();
        };
        let kept: Vec<String> = room
            .timeline
            .events
            .iter()
            .filter_map(|e| e.event_id.clone())
            .collect();

        let mut violations = Vec::new();
        if kept.len() > result.max_timeline_entries {
            violations.push(InvariantViolation::TimelineOverLimit {
                len: kept.len(),
                limit: result.max_timeline_entries,
            });
        }

        let start = result.history.len().saturating_sub(kept.len());
        if result.history[start..] != kept[..] {
            violations.push(InvariantViolation::TimelineNotSuffix { kept });
        } else if let Some(token) = &room.timeline.prev_batch
            && let Some(position) = token.strip_prefix('t').and_then(|n| n.parse::<usize>().ok())
            && position > start
        {
            violations.push(InvariantViolation::PrevBatchAhead {
                token: token.clone(),
                first_position: start,
            });
        }

        OracleResult::from_violations(violations)
    }

    /// `restore(state()).state() == state()`.
    #[must_use]
    pub fn check_checkpoint(result: &SimulationResult) -> OracleResult {
        let config = AccumulatorConfig {
            max_timeline_entries: result.max_timeline_entries,
        };
        match SyncAccumulator::restore(&result.accumulated, config) {
            Ok(restored) if restored.state() == result.accumulated => OracleResult::pass(),
            _ => OracleResult::from_violations(vec![InvariantViolation::CheckpointDrift]),
        }
    }

    /// Window events are server events in strictly increasing server order,
    /// and there are no more of them than the limit.
    #[must_use]
    pub fn check_window(result: &SimulationResult) -> OracleResult {
        let positions: HashMap<&str, usize> = result
            .history
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut violations = Vec::new();
        if result.window_events.len() > result.window_limit {
            violations.push(InvariantViolation::WindowOverLimit {
                len: result.window_events.len(),
                limit: result.window_limit,
            });
        }

        let mut previous: Option<usize> = None;
        for event_id in &result.window_events {
            let Some(&position) = positions.get(event_id.as_str()) else {
                violations.push(InvariantViolation::WindowOrder {
                    event_id: event_id.clone(),
                    detail: "is not in server history".into(),
                });
                continue;
            };
            if previous.is_some_and(|p| p >= position) {
                violations.push(InvariantViolation::WindowOrder {
                    event_id: event_id.clone(),
                    detail: format!("at position {position} follows {previous:?}"),
                });
            }
            previous = Some(position);
        }

        OracleResult::from_violations(violations)
    }

    /// Each user's accumulated read receipt is the last one the server sent.
    #[must_use]
    pub fn check_receipts(result: &SimulationResult) -> OracleResult {
        let config = AccumulatorConfig {
            max_timeline_entries: result.max_timeline_entries,
        };
        let Ok(restored) = SyncAccumulator::restore(&result.accumulated, config) else {
            return OracleResult::from_violations(vec![InvariantViolation::CheckpointDrift]);
        };
        let Some(room) = restored.room(ROOM_ID) else {
            return OracleResult::pass();
        };

        let violations = result
            .expected_receipts
            .iter()
            .filter_map(|(user, expected)| {
                let actual = room
                    .receipts()
                    .receipt_for(user, "m.read", &ThreadKey::Unthreaded);
                (actual != Some(expected.as_str())).then(|| InvariantViolation::ReceiptMismatch {
                    user: user.clone(),
                    expected: expected.clone(),
                    actual: actual.map(str::to_string),
                })
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    /// Every visible reaction is aggregated exactly once under its target.
    #[must_use]
    pub fn check_relations(result: &SimulationResult) -> OracleResult {
        let violations = result
            .relations
            .iter()
            .filter(|tally| tally.expected != tally.aggregated)
            .map(|tally| InvariantViolation::RelationMismatch {
                target: tally.target.clone(),
                expected: tally.expected,
                aggregated: tally.aggregated,
            })
            .collect();
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_all(result: &SimulationResult) -> OracleResult {
        Self::check_timeline(result)
            .merge(Self::check_checkpoint(result))
            .merge(Self::check_window(result))
            .merge(Self::check_receipts(result))
            .merge(Self::check_relations(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{RelationTally, SimulationConfig, Simulator};

    fn seeded_result() -> SimulationResult {
        Simulator::new(SimulationConfig {
            seed: 11,
            ..SimulationConfig::default()
        })
        .unwrap()
        .run()
        .unwrap()
    }

    #[test]
    fn clean_run_passes() {
        let result = seeded_result();
        let oracle = SyncOracle::check_all(&result);
        assert!(oracle.passed, "{:?}", oracle.violations);
    }

    #[test]
    fn reordered_window_is_caught() {
        let mut result = seeded_result();
        result.window_events = vec!["$3".into(), "$2".into()];
        let oracle = SyncOracle::check_window(&result);
        assert!(!oracle.passed);
        assert!(matches!(
            oracle.violations[0],
            InvariantViolation::WindowOrder { .. }
        ));
    }

    #[test]
    fn oversized_window_is_caught() {
        let mut result = seeded_result();
        result.window_limit = 0;
        result.window_events = vec!["$1".into()];
        let oracle = SyncOracle::check_window(&result);
        assert!(matches!(
            oracle.violations.as_slice(),
            [InvariantViolation::WindowOverLimit { len: 1, limit: 0 }]
        ));
    }

    #[test]
    fn missing_aggregation_is_caught() {
        let mut result = seeded_result();
        result.relations = vec![RelationTally {
            target: "$1".into(),
            expected: 2,
            aggregated: 1,
        }];
        let oracle = SyncOracle::check_relations(&result);
        assert!(!oracle.passed);
        assert!(oracle.violations[0].to_string().contains("RelationMismatch"));
    }

    #[test]
    fn wrong_receipt_is_caught() {
        let mut result = seeded_result();
        result
            .expected_receipts
            .insert("@nobody:tideline.test".into(), "$1".into());
        let oracle = SyncOracle::check_receipts(&result);
        assert!(!oracle.passed);
    }
}
