//! End-to-end placement over an in-memory fleet

use std::collections::BTreeMap;

use chrono::{Duration as ChronoDuration, Utc};
use fleetwatch::{
    NodeRef, ResultValue,
    evaluation::{Comparator, Threshold},
    rpc::memory::MemoryNetwork,
    storage::StorageBackend,
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_job_reaches_late_poller_through_late_aggregator() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    let jobs = create_jobs(storage.as_ref(), "routers", "east", 1).await;

    let controller = spawn_controller(&network, storage.clone());
    let probe = FixedProbe::new(ResultValue::Int(3));
    let poller = spawn_poller(&network, "p", "east", probe.clone());
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.poller_pool, vec!["p".to_string()]);
    assert_eq!(snapshot.job_pool, jobs);

    let aggregator = spawn_aggregator(&network, "a", storage.clone());
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(
        snapshot.aggregators,
        BTreeMap::from([("a".to_string(), vec!["p".to_string()])])
    );
    assert_eq!(
        snapshot.pollers,
        BTreeMap::from([("p".to_string(), jobs.clone())])
    );
    assert!(snapshot.job_pool.is_empty());
    assert!(snapshot.pending.is_empty());

    let hosted = aggregator.snapshot().await.unwrap();
    assert_eq!(hosted.pollers.get("p"), Some(&jobs));

    let running = poller.snapshot().await.unwrap();
    assert_eq!(running.aggregator, Some(NodeRef::aggregator("a")));
    assert_eq!(running.jobs, jobs);
    assert!(probe.runs() > 0);

    let now = Utc::now();
    let rows = storage
        .query_results(
            jobs[0],
            now - ChronoDuration::days(1),
            now + ChronoDuration::days(1),
        )
        .await
        .unwrap();
    assert!(!rows.is_empty());

    poller.shutdown().await.unwrap();
    aggregator.shutdown().await.unwrap();
    controller.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_jobs_spread_over_pollers_of_their_segment() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    create_jobs(storage.as_ref(), "switches", "default", 4).await;
    create_jobs(storage.as_ref(), "remote", "west", 1).await;

    let controller = spawn_controller(&network, storage.clone());
    let probe = FixedProbe::new(ResultValue::Int(1));
    let _p1 = spawn_poller(&network, "p1", "default", probe.clone());
    let _p2 = spawn_poller(&network, "p2", "default", probe);
    settle().await;

    // Both pollers are handed over at once, so placement sees them both.
    let _aggregator = spawn_aggregator(&network, "a", storage.clone());
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    let loads: Vec<usize> = snapshot.pollers.values().map(Vec::len).collect();
    assert_eq!(loads, vec![2, 2]);

    // Nobody serves "west".
    assert_eq!(snapshot.job_pool.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pollers_spread_over_aggregators() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    let controller = spawn_controller(&network, storage.clone());
    let probe = FixedProbe::new(ResultValue::Int(1));

    let _a1 = spawn_aggregator(&network, "a1", storage.clone());
    let _a2 = spawn_aggregator(&network, "a2", storage.clone());
    let mut pollers = Vec::new();
    for i in 0..5 {
        pollers.push(spawn_poller(
            &network,
            &format!("p{i}"),
            "default",
            probe.clone(),
        ));
    }
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    let mut counts: Vec<usize> = snapshot.aggregators.values().map(Vec::len).collect();
    counts.sort();
    assert_eq!(counts, vec![2, 3]);
    assert!(snapshot.poller_pool.is_empty());

    for poller in &pollers {
        let state = poller.snapshot().await.unwrap();
        assert!(state.aggregator.is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn test_failing_evaluation_marks_the_job() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    let jobs = create_jobs(storage.as_ref(), "ups", "default", 1).await;
    storage
        .create_evaluation(jobs[0], Comparator::Less, &Threshold::Int(90))
        .await
        .unwrap();

    let _controller = spawn_controller(&network, storage.clone());
    let aggregator = spawn_aggregator(&network, "a", storage.clone());
    let _poller = spawn_poller(&network, "p", "default", FixedProbe::new(ResultValue::Int(95)));
    settle().await;

    let hosted = aggregator.snapshot().await.unwrap();
    assert_eq!(hosted.failing, jobs);
}
