//! Node loss and message loss
//!
//! These tests take nodes out of the fleet without their cooperation, the way
//! a crash or a network partition would, and check that the work they held
//! ends up somewhere else.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration as ChronoDuration, Utc};
use fleetwatch::{
    JobId, NodeRef, ResultValue,
    rpc::{Stanza, memory::MemoryNetwork},
    storage::{MemoryBackend, StorageBackend},
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

async fn stored_rows(storage: &MemoryBackend, job_id: JobId) -> usize {
    let now = Utc::now();
    storage
        .query_results(
            job_id,
            now - ChronoDuration::days(1),
            now + ChronoDuration::days(1),
        )
        .await
        .unwrap()
        .len()
}

fn sorted(ids: &[JobId]) -> Vec<JobId> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids
}

#[tokio::test(start_paused = true)]
async fn test_lost_aggregator_hands_pollers_to_the_survivor() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    let jobs = create_jobs(storage.as_ref(), "routers", "default", 2).await;

    let controller = spawn_controller(&network, storage.clone());
    let _a1 = spawn_aggregator(&network, "a1", storage.clone());
    let poller = spawn_poller(&network, "p", "default", FixedProbe::new(ResultValue::Int(1)));
    settle().await;

    // One poller for two aggregators is already balanced, nothing moves.
    let a2 = spawn_aggregator(&network, "a2", storage.clone());
    settle().await;
    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.aggregators["a1"], vec!["p".to_string()]);

    network.disconnect(&NodeRef::aggregator("a1"));
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(
        snapshot.aggregators,
        BTreeMap::from([("a2".to_string(), vec!["p".to_string()])])
    );
    assert_eq!(sorted(&snapshot.pollers["p"]), jobs);
    assert!(snapshot.job_pool.is_empty());

    let hosted = a2.snapshot().await.unwrap();
    assert_eq!(sorted(&hosted.pollers["p"]), jobs);

    let state = poller.snapshot().await.unwrap();
    assert_eq!(state.aggregator, Some(NodeRef::aggregator("a2")));
    assert_eq!(state.jobs, jobs);
}

#[tokio::test(start_paused = true)]
async fn test_orphaned_poller_caches_until_a_new_aggregator_arrives() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    let jobs = create_jobs(storage.as_ref(), "ups", "default", 1).await;

    let controller = spawn_controller(&network, storage.clone());
    let _a = spawn_aggregator(&network, "a", storage.clone());
    let poller = spawn_poller(&network, "p", "default", FixedProbe::new(ResultValue::Int(7)));
    settle().await;

    network.disconnect(&NodeRef::aggregator("a"));
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    assert!(snapshot.aggregators.is_empty());
    assert_eq!(snapshot.poller_pool, vec!["p".to_string()]);
    // The poller keeps its jobs while it waits for an aggregator.
    assert_eq!(snapshot.pollers["p"], jobs);

    let state = poller.snapshot().await.unwrap();
    assert_eq!(state.aggregator, None);
    assert!(state.cached > 0);
    let stored_before = stored_rows(&storage, jobs[0]).await;

    let _b = spawn_aggregator(&network, "b", storage.clone());
    settle().await;

    let state = poller.snapshot().await.unwrap();
    assert_eq!(state.aggregator, Some(NodeRef::aggregator("b")));
    assert_eq!(state.cached, 0);
    assert!(stored_rows(&storage, jobs[0]).await > stored_before);

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.aggregators["b"], vec!["p".to_string()]);
    assert_eq!(snapshot.pollers["p"], jobs);
}

#[tokio::test(start_paused = true)]
async fn test_lost_poller_jobs_move_to_the_remaining_poller() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    let jobs = create_jobs(storage.as_ref(), "switches", "default", 2).await;

    let controller = spawn_controller(&network, storage.clone());
    let probe = FixedProbe::new(ResultValue::Int(1));
    let _p1 = spawn_poller(&network, "p1", "default", probe.clone());
    let p2 = spawn_poller(&network, "p2", "default", probe);
    settle().await;
    let aggregator = spawn_aggregator(&network, "a", storage.clone());
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.pollers["p1"].len(), 1);
    assert_eq!(snapshot.pollers["p2"].len(), 1);

    network.disconnect(&NodeRef::poller("p1"));
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(sorted(&snapshot.pollers["p2"]), jobs);
    assert!(!snapshot.pollers.contains_key("p1"));
    assert_eq!(
        snapshot.aggregators,
        BTreeMap::from([("a".to_string(), vec!["p2".to_string()])])
    );
    assert!(snapshot.job_pool.is_empty());

    let hosted = aggregator.snapshot().await.unwrap();
    assert!(!hosted.pollers.contains_key("p1"));

    assert_eq!(p2.snapshot().await.unwrap().jobs, jobs);
}

#[tokio::test(start_paused = true)]
async fn test_lost_placement_is_retransmitted_once() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    let jobs = create_jobs(storage.as_ref(), "routers", "default", 1).await;
    let aggregator = NodeRef::aggregator("a");

    let dropped = Arc::new(AtomicBool::new(false));
    {
        let dropped = dropped.clone();
        let aggregator = aggregator.clone();
        network.set_drop_filter(move |envelope| {
            let is_run_job = envelope.to.as_ref() == Some(&aggregator)
                && matches!(&envelope.stanza, Stanza::Call { payload } if payload["method"] == "run_job");
            is_run_job && !dropped.swap(true, Ordering::SeqCst)
        });
    }

    let controller = spawn_controller(&network, storage.clone());
    let _a = spawn_aggregator(&network, "a", storage.clone());
    let _p = spawn_poller(&network, "p", "default", FixedProbe::new(ResultValue::Int(1)));
    settle().await;

    assert!(dropped.load(Ordering::SeqCst));
    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.pollers["p"], jobs);
    assert!(snapshot.pending.is_empty());

    let transmissions: Vec<_> = network
        .sent()
        .into_iter()
        .filter(|e| e.to.as_ref() == Some(&aggregator))
        .filter(|e| matches!(&e.stanza, Stanza::Call { payload } if payload["method"] == "run_job"))
        .collect();
    assert_eq!(transmissions.len(), 2);
    assert_eq!(transmissions[0].id, transmissions[1].id);
}

#[tokio::test(start_paused = true)]
async fn test_poller_back_during_its_removal_is_registered_again() {
    let network = MemoryNetwork::new();
    let storage = memory_storage();
    let jobs = create_jobs(storage.as_ref(), "firewalls", "default", 2).await;
    let aggregator = NodeRef::aggregator("a");

    let controller = spawn_controller(&network, storage.clone());
    let _a = spawn_aggregator(&network, "a", storage.clone());
    let probe = FixedProbe::new(ResultValue::Int(1));
    let old = spawn_poller(&network, "p", "default", probe.clone());
    settle().await;
    assert_eq!(sorted(&controller.snapshot().await.unwrap().pollers["p"]), jobs);

    // Hold back the release of the poller until it has announced itself again.
    let holding = Arc::new(AtomicBool::new(true));
    {
        let holding = holding.clone();
        let aggregator = aggregator.clone();
        network.set_drop_filter(move |envelope| {
            let Stanza::Call { payload } = &envelope.stanza else {
                return false;
            };
            let releasing = envelope.to.as_ref() == Some(&aggregator)
                && payload["method"] == "remove_poller";
            payload["method"] == "poller_failure"
                || (releasing && holding.load(Ordering::SeqCst))
        });
    }

    network.disconnect(&NodeRef::poller("p"));
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    old.shutdown().await.unwrap();

    let poller = spawn_poller(&network, "p", "default", probe);
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let snapshot = controller.snapshot().await.unwrap();
    assert!(!snapshot.aggregators["a"].is_empty());

    holding.store(false, Ordering::SeqCst);
    settle().await;

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(
        snapshot.aggregators,
        BTreeMap::from([("a".to_string(), vec!["p".to_string()])])
    );
    assert_eq!(sorted(&snapshot.pollers["p"]), jobs);
    assert!(snapshot.job_pool.is_empty());

    let state = poller.snapshot().await.unwrap();
    assert_eq!(state.aggregator, Some(aggregator));
    assert_eq!(state.jobs, jobs);
}
