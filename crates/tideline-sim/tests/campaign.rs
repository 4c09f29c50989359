use proptest::prelude::*;
use tideline_sim::simulator::TraceEventKind;
use tideline_sim::{CampaignConfig, ServerFaults, replay_seed, run_campaign};

#[test]
fn seed_range_passes_oracle() {
    let config = CampaignConfig {
        seed_range: 0..40,
        ..CampaignConfig::default()
    };
    let report = run_campaign(&config).unwrap();
    assert_eq!(report.seeds_run, 40);
    assert!(
        report.all_passed(),
        "campaign failed: first at seed {:?}: {:?}",
        report.first_failure,
        report.failures.first()
    );
    assert!(report.interesting_states_reached > 0);
}

#[test]
fn heavy_faults_still_hold_invariants() {
    let config = CampaignConfig {
        seed_range: 100..120,
        rounds: 40,
        max_timeline_entries: 5,
        window_limit: 10,
        initial_size: 4,
        request_limit: 3,
        faults: ServerFaults {
            max_batch: 9,
            gap_percent: 40,
            stall_percent: 30,
            fetch_fail_percent: 20,
            encrypted_percent: 50,
            undecryptable_percent: 50,
            reaction_percent: 40,
            ..ServerFaults::default()
        },
        ..CampaignConfig::default()
    };
    let report = run_campaign(&config).unwrap();
    assert!(report.all_passed(), "{:?}", report.failures);
    assert_eq!(report.interesting_states_reached, 20);
}

#[test]
fn window_after_gaps_pages_back_across_segments() {
    let config = CampaignConfig {
        rounds: 30,
        paginations: 10,
        window_limit: 40,
        initial_size: 4,
        request_limit: 4,
        faults: ServerFaults {
            gap_percent: 50,
            stall_percent: 0,
            fetch_fail_percent: 0,
            ..ServerFaults::default()
        },
        ..CampaignConfig::default()
    };
    let trace = replay_seed(3, &config).unwrap();
    assert!(trace.oracle.passed, "{:?}", trace.oracle.violations);
    let widest = trace
        .result
        .trace
        .iter()
        .filter_map(|e| match e.kind {
            TraceEventKind::Paginated { events, .. } => Some(events),
            _ => None,
        })
        .max()
        .unwrap();
    assert!(widest > 4);
}

#[test]
fn window_follows_a_gap_after_it_is_open() {
    // No backward paging, so the window's end stays at the live edge.
    let config = CampaignConfig {
        rounds: 8,
        paginations: 0,
        faults: ServerFaults {
            gap_percent: 100,
            stall_percent: 0,
            fetch_fail_percent: 0,
            ..ServerFaults::default()
        },
        ..CampaignConfig::default()
    };
    let mut followed = 0;
    for seed in 0..20 {
        let trace = replay_seed(seed, &config).unwrap();
        assert!(trace.oracle.passed, "seed {seed}: {:?}", trace.oracle.violations);

        let result = &trace.result;
        let last_delta_limited = result
            .trace
            .iter()
            .rev()
            .find_map(|e| match e.kind {
                TraceEventKind::Delta { limited, .. } => Some(limited),
                _ => None,
            })
            .unwrap();
        assert!(
            result
                .trace
                .iter()
                .any(|e| matches!(e.kind, TraceEventKind::RoomUpdatesApplied { .. }))
        );
        if last_delta_limited {
            followed += 1;
            assert_eq!(result.window_events.last(), result.history.last());
        }
    }
    assert!(followed > 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_seed_passes(seed in any::<u64>()) {
        let trace = replay_seed(seed, &CampaignConfig::default()).unwrap();
        prop_assert!(trace.oracle.passed, "{:?}", trace.oracle.violations);
    }
}
