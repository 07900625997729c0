
use std::collections::BTreeMap;
use std::sync::Arc;

use test_harness::*;
use workpool_lite::config::DistributorConfig;
use workpool_lite::protocol::Opcode;
use workpool_lite::scheduler::{JobResultId, JobStatus};

fn two_stage_scenario() -> Scenario {
    let first = (1..=3).map(JobPlan::new).collect();
    let second = (4..=6)
        .map(|id| JobPlan::new(id).with_input(JobResultId::new(1, 1)))
        .collect();
    Scenario::single_node(first)
        .with_node(second)
        .with_edge(1, 2)
        .with_discard(&[1, 2, 3], vec![JobResultId::new(2, 1), JobResultId::new(3, 1)])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_stage_waits_for_first_and_reads_its_result() {
    let scenario = Arc::new(two_stage_scenario());
    let ledger = Ledger::shared();
    let config = DistributorConfig::new().with_archives(1);

    let outcome = run_cluster(4, config, &scenario, &ledger).await;
    let summary = outcome.summary();
    assert_eq!(summary.jobs_completed, 6);
    assert_eq!(summary.results_discarded, 2);
    assert_heap_consistent(summary);

    let log = &outcome.log;
    let first_stage_done = log
        .iter()
        .enumerate()
        .filter(|(_, entry)| is_job_completion(entry.opcode))
        .filter(|(_, entry)| entry.job_id.is_some_and(|id| id <= 3))
        .map(|(position, _)| position)
        .max()
        .unwrap();
    let second_stage_start = messages_with(log, Opcode::NewJobAvailable)
        .into_iter()
        .find(|(_, entry)| entry.job_id.is_some_and(|id| id >= 4))
        .map(|(position, _)| position)
        .unwrap();
    assert!(first_stage_done < second_stage_start);

    // Discards are sent as soon as the queen asks, ahead of the next stage.
    let discards = messages_with(log, Opcode::DiscardJobResult);
    assert_eq!(discards.len(), 2);
    assert!(discards
        .iter()
        .all(|&(position, entry)| position < second_stage_start && entry.to == 1));

    // Results 2 and 3 are gone; job 1's result is still there after being read three times.
    let mut expected_remaining = BTreeMap::new();
    expected_remaining.insert(1, 4);
    assert_eq!(summary.remaining_results, expected_remaining);

    let ledger = ledger.lock().unwrap();
    for job_id in 4..=6 {
        assert_eq!(ledger.inputs_seen[&job_id], vec![result_value(1, 1)]);
    }
    for job_id in 1..=3 {
        assert!(ledger.inputs_seen[&job_id].is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_first_stage_still_releases_second() {
    let first = vec![
        JobPlan::new(1),
        JobPlan::new(2).with_behavior(Behavior::DoNotRetry),
    ];
    let second = vec![JobPlan::new(3).with_input(JobResultId::new(1, 1))];
    let scenario = Arc::new(Scenario::single_node(first).with_node(second).with_edge(1, 2));
    let ledger = Ledger::shared();

    let outcome = run_cluster(3, DistributorConfig::new().with_archives(1), &scenario, &ledger).await;
    let summary = outcome.summary();
    assert_eq!(summary.jobs_completed, 2);
    assert_eq!(summary.jobs_failed, 1);

    let statuses = ledger.lock().unwrap().statuses();
    assert_eq!(statuses[&2], vec![JobStatus::FailedDoNotRetry]);
    assert_eq!(statuses[&3], vec![JobStatus::Success]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_nodes_all_run() {
    let scenario = Arc::new(
        Scenario::single_node(vec![JobPlan::new(1), JobPlan::new(2)])
            .with_node(vec![JobPlan::new(3)])
            .with_node(vec![
                JobPlan::new(4)
                    .with_input(JobResultId::new(1, 1))
                    .with_input(JobResultId::new(3, 1)),
            ])
            .with_edge(1, 3)
            .with_edge(2, 3),
    );
    let ledger = Ledger::shared();

    let outcome = run_cluster(4, DistributorConfig::new().with_archives(1), &scenario, &ledger).await;
    assert_eq!(outcome.summary().jobs_completed, 4);

    let ledger = ledger.lock().unwrap();
    assert_eq!(
        ledger.inputs_seen[&4],
        vec![result_value(1, 1), result_value(3, 1)]
    );
    let order = ledger.completion_order();
    let position = |job: u64| order.iter().position(|&id| id == job).unwrap();
    assert!(position(4) > position(1));
    assert!(position(4) > position(3));
}
