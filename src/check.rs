//! The periodic check loop: eviction plus the promotion/demotion state
//! machine. Acquires the nodes lock before the options lock, matching the
//! only lock ordering the protocol allows.

use std::time::Instant;

use crate::Discover;

pub fn spawn(discover: Discover) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            run_once(&discover).await;
            let interval = discover.options.lock().await.check_interval;
            tokio::select! {
                _ = discover.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}

async fn run_once(discover: &Discover) {
    let now = Instant::now();

    let mut state = discover.state.lock().await;
    let options = discover.options.lock().await;

    let evicted = state.nodes.evict_stale(now, options.node_timeout, options.master_timeout);

    let mut masters_higher_weight_found = 0u32;
    let mut masters_eligible_higher_weight_found = false;
    for node in state.nodes.iter() {
        if node.data.is_master {
            if options.weight < node.data.weight {
                masters_higher_weight_found += 1;
            }
        } else if node.data.is_master_eligible && options.weight < node.data.weight {
            masters_eligible_higher_weight_found = true;
        }
    }

    let was_master = state.is_master;
    let mut promoted = false;
    let mut demoted = false;

    if was_master && options.masters_required <= masters_higher_weight_found {
        state.is_master = false;
        demoted = true;
    }

    if !was_master
        && state.is_master_eligible
        && masters_higher_weight_found < options.masters_required
        && !masters_eligible_higher_weight_found
    {
        state.is_master = true;
        promoted = true;
    }

    for node in &evicted {
        if let Some(cb) = discover.observers.lock().await.removed.clone() {
            cb(discover, node);
        }
    }
    if demoted {
        if let Some(cb) = discover.observers.lock().await.demotion.clone() {
            cb(discover);
        }
    }
    if promoted {
        if let Some(cb) = discover.observers.lock().await.promotion.clone() {
            cb(discover);
        }
    }
    if let Some(cb) = discover.observers.lock().await.check.clone() {
        cb(discover);
    }

    drop(options);
    drop(state);
}
