
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tempfile::TempDir;
use test_harness::*;
use workpool_lite::config::DistributorConfig;
use workpool_lite::protocol::Opcode;
use workpool_lite::scheduler::JobResultId;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_on_disk_archive_keeps_unreleased_results() {
    let archive_dir = TempDir::new().unwrap();
    let scenario = Arc::new(
        Scenario::independent(6, Behavior::Succeed).with_output(OutputPolicy::Results(
            BTreeSet::from([JobResultId::new(1, 1), JobResultId::new(2, 1)]),
        )),
    );
    let ledger = Ledger::shared();
    let config = DistributorConfig::new()
        .with_archives(1)
        .with_archive_directory(archive_dir.path());

    let outcome = run_cluster(3, config, &scenario, &ledger).await;
    let summary = outcome.summary();
    assert_eq!(summary.results_output, 2);
    assert_eq!(summary.remaining_results, BTreeMap::from([(1, 4)]));

    let expected: Vec<String> = (3..=6).map(|job| format!("archive.{job}.1")).collect();
    assert_eq!(file_names(archive_dir.path()), expected);
    assert_eq!(ledger.lock().unwrap().outputs.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_compressed_results_round_trip_through_archives() {
    let first = (1..=4).map(|id| JobPlan::new(id).with_results(3)).collect();
    let second = vec![JobPlan::new(5)
        .with_input(JobResultId::new(2, 3))
        .with_input(JobResultId::new(4, 1))];
    let scenario = Arc::new(
        Scenario::single_node(first)
            .with_node(second)
            .with_edge(1, 2)
            .with_output(OutputPolicy::Results(BTreeSet::from([
                JobResultId::new(1, 2),
                JobResultId::new(5, 1),
            ]))),
    );
    let ledger = Ledger::shared();
    let config = DistributorConfig::new()
        .with_archives(2)
        .with_compression(true);

    let outcome = run_cluster(5, config, &scenario, &ledger).await;
    let summary = outcome.summary();
    assert_eq!(summary.jobs_completed, 5);
    assert_heap_consistent(summary);

    let ledger = ledger.lock().unwrap();
    assert_eq!(
        ledger.inputs_seen[&5],
        vec![result_value(2, 3), result_value(4, 1)]
    );
    let mut written: Vec<(JobResultId, u64)> = ledger
        .outputs
        .iter()
        .map(|record| (record.result_id, record.value))
        .collect();
    written.sort();
    assert_eq!(
        written,
        vec![
            (JobResultId::new(1, 2), result_value(1, 2)),
            (JobResultId::new(5, 1), result_value(5, 1)),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_spread_evenly_over_archives() {
    let scenario = Arc::new(Scenario::independent(12, Behavior::Succeed));
    let ledger = Ledger::shared();
    let config = DistributorConfig::new().with_archives(3);

    let outcome = run_cluster(6, config, &scenario, &ledger).await;
    let summary = outcome.summary();
    assert_eq!(
        summary.remaining_results,
        BTreeMap::from([(1, 4), (2, 4), (3, 4)])
    );
    assert_heap_consistent(summary);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_archives_only_fetch_from_peers_after_all_jobs_finish() {
    let jobs = (1..=30).map(|id| JobPlan::new(id).with_results(2)).collect();
    let scenario = Arc::new(Scenario::single_node(jobs).with_output(OutputPolicy::EveryResult));
    let ledger = Ledger::shared();
    let config = DistributorConfig::new().with_archives(2);

    let outcome = run_cluster(6, config, &scenario, &ledger).await;
    let summary = outcome.summary();
    assert_eq!(summary.results_output, 60);
    assert!(summary.remaining_results.is_empty());
    assert_eq!(summary.results_held, BTreeMap::from([(1, 0), (2, 0)]));

    assert_cross_archive_gating(&outcome.log, &[1, 2]);
    assert_two_phase_completion(&outcome.log);

    // Each result was written exactly once, whichever node wrote it.
    let ledger = ledger.lock().unwrap();
    let written: BTreeSet<JobResultId> = ledger.outputs.iter().map(|record| record.result_id).collect();
    assert_eq!(written.len(), 60);
    assert_eq!(ledger.outputs.len(), 60);

    // Archives are the only outputters in this layout.
    for (_, entry) in messages_with(&outcome.log, Opcode::OutputCompleted) {
        assert!(entry.from == 1 || entry.from == 2);
    }
}
