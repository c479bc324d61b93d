// Randomized partition schedules never produce two leaders for one term.

mod common;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use common::{peers, supervisor};
use fleet_supervisor::comm::LocalNetwork;
use fleet_supervisor::failover::{LeaderClaim, Role, Term};
use fleet_supervisor::supervisor::{SupervisorNode, SupervisorSettings};

/// Runs a cluster through `rounds` random network changes. Returns every
/// committed claim and any term seen with two simultaneous leaders.
async fn simulate(seed: u64, size: usize, rounds: usize) -> (Vec<LeaderClaim>, Vec<Term>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let ids: Vec<String> = (0..size).map(|i| format!("sup-{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

    let network = LocalNetwork::new();
    let nodes: Vec<Arc<SupervisorNode>> = ids
        .iter()
        .map(|id| {
            supervisor(
                &network,
                id,
                SupervisorSettings {
                    peers: peers(&id_refs),
                    ..SupervisorSettings::default()
                },
            )
        })
        .collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for node in &nodes {
        node.spawn_background(shutdown_rx.clone());
    }

    let mut conflicts = Vec::new();
    for _ in 0..rounds {
        network.heal();
        for id in &ids {
            network.set_down(id, false);
        }

        match rng.random_range(0..4) {
            0 => {}
            1 => {
                let mut shuffled = ids.clone();
                shuffled.shuffle(&mut rng);
                let cut = rng.random_range(1..size);
                network.partition(&shuffled[..cut], &shuffled[cut..]);
            }
            2 => {
                let victim = &ids[rng.random_range(0..size)];
                network.set_down(victim, true);
            }
            _ => {
                let isolated = ids[rng.random_range(0..size)].clone();
                let rest: Vec<String> = ids.iter().filter(|id| **id != isolated).cloned().collect();
                network.partition(&[isolated], &rest);
            }
        }

        sleep(Duration::from_millis(rng.random_range(200..4_000))).await;

        let mut leading: HashMap<Term, usize> = HashMap::new();
        for node in &nodes {
            let view = node.failover().view();
            if view.role == Role::Leader {
                *leading.entry(view.term).or_default() += 1;
            }
        }
        conflicts.extend(leading.into_iter().filter(|(_, n)| *n > 1).map(|(term, _)| term));
    }

    shutdown_tx.send_replace(true);
    let claims = nodes.iter().flat_map(|n| n.failover().promotions()).collect();
    (claims, conflicts)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn at_most_one_committed_claim_per_term(seed in any::<u64>(), size in 3usize..=5) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let (claims, conflicts) = runtime.block_on(simulate(seed, size, 10));

        prop_assert!(conflicts.is_empty(), "simultaneous leaders in terms {:?}", conflicts);

        let mut by_term: HashMap<Term, &LeaderClaim> = HashMap::new();
        for claim in &claims {
            if let Some(previous) = by_term.insert(claim.term, claim) {
                prop_assert!(false, "term {} claimed by {} and {}", claim.term, previous.candidate, claim.candidate);
            }
        }
    }
}
