use crate::broker::{EventBroker, EventFilter};
use pairflow_delivery::{Deliverer, PaneSessionLookup, PaneTransport, ReconcileOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::warn;

/// Starts the periodic stuck-input sweep on the broker's lifetime. A zero
/// interval disables it.
pub fn spawn_reconcile_sweep<T, L>(
    broker: &EventBroker,
    deliverer: Arc<Deliverer<T, L>>,
    every: Duration,
) -> bool
where
    T: PaneTransport + 'static,
    L: PaneSessionLookup + 'static,
{
    if every.is_zero() {
        return false;
    }
    let snapshots = broker.clone();
    broker.spawn_background(move |mut shutdown| async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    sweep_once(&snapshots, &deliverer).await;
                }
            }
        }
    })
}

/// One pass over every bubble that has a runtime session and an active
/// agent in the current snapshot.
pub async fn sweep_once<T, L>(
    broker: &EventBroker,
    deliverer: &Arc<Deliverer<T, L>>,
) -> Vec<(String, ReconcileOutcome)>
where
    T: PaneTransport + 'static,
    L: PaneSessionLookup + 'static,
{
    let view = broker.get_snapshot(&EventFilter::all());
    let candidates: Vec<(String, String)> = view
        .repos
        .into_iter()
        .flat_map(|repo| repo.bubbles)
        .filter(|bubble| bubble.runtime_session.is_some())
        .filter_map(|bubble| bubble.active_agent.map(|agent| (bubble.bubble_id, agent)))
        .collect();

    let mut outcomes = Vec::with_capacity(candidates.len());
    for (bubble_id, agent) in candidates {
        let worker = deliverer.clone();
        let id = bubble_id.clone();
        let outcome =
            tokio::task::spawn_blocking(move || worker.reconcile_stuck_input(&id, &agent)).await;
        match outcome {
            Ok(outcome) => outcomes.push((bubble_id, outcome)),
            Err(err) => {
                warn!(event = "reconcile_task_failed", bubble_id = %bubble_id, error = %err);
            }
        }
    }
    outcomes
}
