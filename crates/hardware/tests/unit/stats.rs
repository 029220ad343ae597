//! Statistics Tests.

use pretty_assertions::assert_eq;

use smpsim_core::stats::{CoherenceStats, HubStats, STATS_SECTIONS, SystemStats};

fn cpu(maf_allocations: u64, probe_hits: u64) -> CoherenceStats {
    CoherenceStats {
        maf_allocations,
        probe_hits,
        ..CoherenceStats::default()
    }
}

#[test]
fn total_sums_every_cpu() {
    let stats = SystemStats::new(vec![cpu(3, 1), cpu(4, 0), cpu(0, 5)], HubStats::default());
    let total = stats.total();
    assert_eq!(total.maf_allocations, 7);
    assert_eq!(total.probe_hits, 6);
    assert_eq!(total.backpressure, 0);
}

#[test]
fn add_assign_is_fieldwise() {
    let mut a = cpu(1, 2);
    a.anomalies = 1;
    let mut b = cpu(10, 20);
    b.completions = 3;
    a += b;
    assert_eq!(a.maf_allocations, 11);
    assert_eq!(a.probe_hits, 22);
    assert_eq!(a.anomalies, 1);
    assert_eq!(a.completions, 3);
}

#[test]
fn empty_run_totals_zero() {
    assert_eq!(SystemStats::default().total(), CoherenceStats::default());
}

#[test]
fn serializes_without_timestamp() {
    let hub = HubStats {
        transactions: 2,
        skid_parks: 1,
        ..HubStats::default()
    };
    let stats = SystemStats::new(vec![cpu(1, 0)], hub);
    let value = serde_json::to_value(&stats).unwrap();
    assert_eq!(value["cpus"][0]["maf_allocations"], 1);
    assert_eq!(value["hub"]["transactions"], 2);
    assert_eq!(value["hub"]["skid_parks"], 1);
    assert!(value.get("start_time").is_none());
}

#[test]
fn section_names_are_fixed() {
    assert_eq!(STATS_SECTIONS, &["summary", "cpu", "hub"]);
}
