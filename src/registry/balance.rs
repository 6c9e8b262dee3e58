//! Load balancing
//!
//! Greedy placement of pooled pollers and jobs, and incremental rebalancing.
//! Rebalancing only ever looks at the current extremes and moves one unit at
//! a time until the counts differ by at most one.

use tracing::{debug, info};

use crate::rpc::messages::AggregatorCall;
use crate::{JobId, NodeRef};

use super::{Continuation, Outbound, Registry};

/// Least and most loaded entries. Ties go to the first entry seen.
pub fn extremes<'a, I>(loads: I) -> Option<((&'a NodeRef, usize), (&'a NodeRef, usize))>
where
    I: IntoIterator<Item = (&'a NodeRef, usize)>,
{
    let mut iter = loads.into_iter();
    let first = iter.next()?;
    let (mut least, mut most) = (first, first);
    for entry in iter {
        if entry.1 < least.1 {
            least = entry;
        }
        if entry.1 > most.1 {
            most = entry;
        }
    }
    Some((least, most))
}

impl Registry {
    /// Pollers of `segment` that may take new work, in aggregator order.
    pub fn segment_pollers(&self, segment: &str) -> Vec<NodeRef> {
        self.poller_map
            .values()
            .flatten()
            .filter(|(poller, s)| s == segment && !self.departing.contains(poller))
            .map(|(poller, _)| poller.clone())
            .collect()
    }

    /// Jobs running on `poller` plus placements on their way to it.
    pub fn poller_load(&self, poller: &NodeRef) -> usize {
        let pending = self.pending.values().filter(|p| *p == poller).count();
        self.jobs_of(poller).len() + pending
    }

    fn least_loaded_aggregator(&self) -> Option<NodeRef> {
        extremes(self.poller_map.iter().map(|(a, pollers)| (a, pollers.len())))
            .map(|((least, _), _)| least.clone())
    }

    /// Hands every pooled poller to the aggregator with the fewest pollers.
    /// Returns false when there is no aggregator to hand them to.
    pub fn assign_pooled_pollers(&mut self) -> bool {
        if self.poller_map.is_empty() {
            info!(
                "no aggregators available, {} pollers stay pooled",
                self.poller_pool.len()
            );
            return false;
        }

        while let Some((poller, segment)) = self.poller_pool.pop_first() {
            let Some(aggregator) = self.least_loaded_aggregator() else {
                self.poller_pool.insert(poller, segment);
                return false;
            };

            info!("assigning {poller} to {aggregator}");
            self.dispatch(
                &aggregator,
                Outbound::Aggregator(AggregatorCall::AddPoller {
                    poller: poller.clone(),
                }),
                false,
                None,
            );
            for job in self.jobs_of(&poller).to_vec() {
                self.dispatch(
                    &aggregator,
                    Outbound::Aggregator(AggregatorCall::MoveJob {
                        poller: poller.clone(),
                        job,
                    }),
                    false,
                    None,
                );
            }
            if let Some(pollers) = self.poller_map.get_mut(&aggregator) {
                pollers.push((poller, segment));
            }
        }
        true
    }

    /// Offers every pooled job without a pending placement to the least
    /// loaded poller of its segment. Offers are sent delayed and complete
    /// through [`Continuation::AssignJob`].
    pub fn assign_pooled_jobs(&mut self) {
        if self.job_map.is_empty() || self.poller_map.is_empty() {
            info!("no assigned pollers available for job assignment");
            return;
        }

        let candidates: Vec<_> = self
            .job_pool
            .iter()
            .filter(|job| !self.pending.contains_key(&job.id))
            .cloned()
            .collect();

        for job in candidates {
            let pollers = self.segment_pollers(&job.segment);
            let Some(((poller, _), _)) =
                extremes(pollers.iter().map(|p| (p, self.poller_load(p))))
            else {
                debug!("no poller in segment {} for job {}", job.segment, job.id);
                continue;
            };
            let poller = poller.clone();
            let Some(aggregator) = self.owner_of(&poller).cloned() else {
                continue;
            };

            info!("sending job {} to {aggregator} for {poller}", job.id);
            let job_id = job.id;
            self.pending.insert(job_id, poller.clone());
            self.dispatch(
                &aggregator,
                Outbound::Aggregator(AggregatorCall::RunJob {
                    poller: poller.clone(),
                    job,
                }),
                true,
                Some(Continuation::AssignJob { job_id, poller }),
            );
        }
    }

    /// Moves pollers from the busiest to the idlest aggregator until their
    /// counts differ by at most one.
    pub fn rebalance_pollers(&mut self) {
        info!("attempting to rebalance pollers");
        loop {
            let Some(((least, low), (most, high))) =
                extremes(self.poller_map.iter().map(|(a, pollers)| (a, pollers.len())))
            else {
                return;
            };
            if high - low <= 1 {
                debug!("pollers balanced");
                return;
            }
            let (least, most) = (least.clone(), most.clone());

            let departing = &self.departing;
            let Some((poller, segment)) = self.poller_map.get_mut(&most).and_then(|pollers| {
                let position = pollers.iter().rposition(|(p, _)| !departing.contains(p))?;
                Some(pollers.remove(position))
            }) else {
                return;
            };
            info!("moving {poller} from {most} to {least}");

            self.dispatch(
                &least,
                Outbound::Aggregator(AggregatorCall::AddPoller {
                    poller: poller.clone(),
                }),
                false,
                None,
            );
            for job in self.jobs_of(&poller).to_vec() {
                self.dispatch(
                    &least,
                    Outbound::Aggregator(AggregatorCall::MoveJob {
                        poller: poller.clone(),
                        job,
                    }),
                    false,
                    None,
                );
            }
            self.dispatch(
                &most,
                Outbound::Aggregator(AggregatorCall::RemovePoller {
                    poller: poller.clone(),
                }),
                false,
                None,
            );
            if let Some(pollers) = self.poller_map.get_mut(&least) {
                pollers.push((poller, segment));
            }
        }
    }

    /// Moves jobs between pollers of the default segment until their loads
    /// differ by at most one. Load counts pending placements the same way
    /// [`Registry::assign_pooled_jobs`] does.
    pub fn rebalance_jobs(&mut self) {
        let segment = self.default_segment.clone();
        info!("attempting to rebalance jobs in segment {segment}");
        loop {
            let pollers = self.segment_pollers(&segment);
            let Some(((least, low), (most, high))) =
                extremes(pollers.iter().map(|p| (p, self.poller_load(p))))
            else {
                return;
            };
            if high - low <= 1 {
                debug!("jobs balanced");
                return;
            }
            let (least, most) = (least.clone(), most.clone());
            let (Some(least_parent), Some(most_parent)) =
                (self.owner_of(&least).cloned(), self.owner_of(&most).cloned())
            else {
                return;
            };

            let Some(job) = self.job_map.get_mut(&most).and_then(Vec::pop) else {
                return;
            };
            info!("moving job {} from {most} to {least}", job.id);

            self.dispatch(
                &most_parent,
                Outbound::Aggregator(AggregatorCall::RemoveJob { job_id: job.id }),
                false,
                None,
            );
            self.dispatch(
                &least_parent,
                Outbound::Aggregator(AggregatorCall::RunJob {
                    poller: least.clone(),
                    job: job.clone(),
                }),
                true,
                None,
            );
            if let Some(jobs) = self.job_map.get_mut(&least) {
                jobs.push(job);
            }
        }
    }

    /// Ids of the jobs currently placed on `poller`.
    pub fn job_ids_of(&self, poller: &NodeRef) -> Vec<JobId> {
        self.jobs_of(poller).iter().map(|j| j.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::tests::{ack_all, job};
    use super::*;
    use crate::Role;

    #[test]
    fn extremes_prefer_the_first_entry_on_ties() {
        let (a, b, c) = (
            NodeRef::aggregator("a"),
            NodeRef::aggregator("b"),
            NodeRef::aggregator("c"),
        );
        let ((least, _), (most, _)) = extremes([(&a, 1), (&b, 1), (&c, 1)]).unwrap();

        assert_eq!(least, &a);
        assert_eq!(most, &a);
        assert!(extremes(std::iter::empty()).is_none());
    }

    #[test]
    fn pollers_spread_evenly_over_aggregators() {
        let mut registry = Registry::new("default");
        for name in ["p1", "p2", "p3", "p4", "p5"] {
            registry.add_entity(Role::Poller, "default", NodeRef::poller(name));
        }
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a1"));
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a2"));

        let counts: Vec<_> = registry
            .snapshot()
            .aggregators
            .values()
            .map(Vec::len)
            .collect();
        assert_eq!(counts, vec![3, 2]);
        registry.check_invariants().unwrap();
    }

    #[test]
    fn rebalancing_pollers_moves_their_jobs_along() {
        let mut registry = Registry::new("default");
        registry.load_jobs([job(1, "default")]);
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a1"));
        registry.add_entity(Role::Poller, "default", NodeRef::poller("p1"));
        registry.add_entity(Role::Poller, "default", NodeRef::poller("p2"));
        ack_all(&mut registry);

        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a2"));
        let dispatches = registry.take_dispatches();

        let methods: Vec<_> = dispatches.iter().map(|d| d.call.method()).collect();
        assert!(methods.contains(&"add_poller"));
        assert!(methods.contains(&"remove_poller"));
        assert_eq!(registry.pollers_of(&NodeRef::aggregator("a2")).len(), 1);
    }

    #[test]
    fn rebalance_pollers_is_idempotent_once_balanced() {
        let mut registry = Registry::new("default");
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a1"));
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a2"));
        for name in ["p1", "p2", "p3"] {
            registry.add_entity(Role::Poller, "default", NodeRef::poller(name));
        }
        registry.take_dispatches();
        let before = registry.snapshot();

        registry.rebalance_pollers();

        assert_eq!(registry.snapshot(), before);
        assert!(registry.take_dispatches().is_empty());
    }

    #[test]
    fn rebalance_jobs_splits_three_to_zero() {
        let mut registry = Registry::new("default");
        registry.load_jobs([job(1, "default"), job(2, "default"), job(3, "default")]);
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a1"));
        registry.add_entity(Role::Poller, "default", NodeRef::poller("p1"));
        ack_all(&mut registry);
        assert_eq!(registry.jobs_of(&NodeRef::poller("p1")).len(), 3);

        registry.add_entity(Role::Poller, "default", NodeRef::poller("p2"));

        let mut counts = vec![
            registry.jobs_of(&NodeRef::poller("p1")).len(),
            registry.jobs_of(&NodeRef::poller("p2")).len(),
        ];
        counts.sort();
        assert_eq!(counts, vec![1, 2]);

        let dispatches = registry.take_dispatches();
        let remove = dispatches
            .iter()
            .position(|d| d.call.method() == "remove_job")
            .unwrap();
        let run = dispatches
            .iter()
            .rposition(|d| d.call.method() == "run_job")
            .unwrap();
        assert!(remove < run);
        assert!(dispatches[run].delayed);

        registry.rebalance_jobs();
        assert!(registry.take_dispatches().is_empty());
    }

    #[test]
    fn rebalance_jobs_ignores_other_segments() {
        let mut registry = Registry::new("default");
        registry.load_jobs([job(1, "east"), job(2, "east"), job(3, "east")]);
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a1"));
        registry.add_entity(Role::Poller, "east", NodeRef::poller("p1"));
        ack_all(&mut registry);

        registry.add_entity(Role::Poller, "east", NodeRef::poller("p2"));

        assert_eq!(registry.job_ids_of(&NodeRef::poller("p1")), vec![1, 2, 3]);
    }

    #[test]
    fn rebalance_jobs_counts_pending_placements() {
        let (p1, p2) = (NodeRef::poller("p1"), NodeRef::poller("p2"));
        let mut registry = Registry::new("default");
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a1"));
        registry.add_entity(Role::Poller, "default", p1.clone());
        registry.add_entity(Role::Poller, "default", p2.clone());
        registry.load_jobs((1..=4).map(|id| job(id, "default")));
        registry.assign_pooled_jobs();

        // Only p1 answers; p2 still has two placements on their way.
        for dispatch in registry.take_dispatches() {
            if let Some(Continuation::AssignJob { job_id, poller }) = dispatch.continuation {
                if poller == p1 {
                    registry.complete_assignment(job_id, &poller);
                }
            }
        }
        assert_eq!(registry.job_ids_of(&p1), vec![1, 3]);
        assert_eq!(registry.poller_load(&p2), 2);

        registry.rebalance_jobs();

        assert!(registry.take_dispatches().is_empty());
        assert_eq!(registry.job_ids_of(&p1), vec![1, 3]);
    }

    #[test]
    fn departing_pollers_are_not_moved_between_aggregators() {
        let mut registry = Registry::new("default");
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a1"));
        for name in ["p1", "p2", "p3"] {
            registry.add_entity(Role::Poller, "east", NodeRef::poller(name));
        }
        registry.remove_entity(&NodeRef::poller("p3"));
        registry.take_dispatches();

        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a2"));

        assert_eq!(
            registry.pollers_of(&NodeRef::aggregator("a2")),
            vec![&NodeRef::poller("p2")]
        );
        assert!(registry.is_departing(&NodeRef::poller("p3")));
        assert_eq!(registry.owner_of(&NodeRef::poller("p3")), Some(&NodeRef::aggregator("a1")));
    }

    #[test]
    fn pending_placements_count_towards_load() {
        let mut registry = Registry::new("default");
        registry.add_entity(Role::Aggregator, "fleet", NodeRef::aggregator("a1"));
        registry.add_entity(Role::Poller, "east", NodeRef::poller("p1"));
        registry.add_entity(Role::Poller, "east", NodeRef::poller("p2"));
        registry.take_dispatches();

        registry.load_jobs([job(1, "east"), job(2, "east")]);
        registry.assign_pooled_jobs();

        assert_eq!(registry.pending_poller(1), Some(&NodeRef::poller("p1")));
        assert_eq!(registry.pending_poller(2), Some(&NodeRef::poller("p2")));
    }
}
