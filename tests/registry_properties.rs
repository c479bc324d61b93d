// Lifecycle transitions of the agent registry under arbitrary event orders.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_supervisor::agents::{
    AgentId, AgentRegistration, AgentRegistry, AgentState, Capability, LivenessConfig, LoadSnapshot, Tier,
};

const AGENTS: [&str; 3] = ["hallway", "kitchen", "office"];

#[derive(Debug, Clone)]
enum Op {
    Register(usize),
    Heartbeat(usize),
    Advance(i64),
    Sweep,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..AGENTS.len()).prop_map(Op::Register),
        (0..AGENTS.len()).prop_map(Op::Heartbeat),
        (1i64..120).prop_map(Op::Advance),
        Just(Op::Sweep),
    ]
}

fn registration(id: &str) -> AgentRegistration {
    AgentRegistration {
        id: AgentId::from(id),
        location: id.to_string(),
        tier: Tier::Edge,
        capabilities: BTreeSet::from([Capability::new("air_quality")]),
        address: id.to_string(),
    }
}

fn allowed(before: Option<AgentState>, after: Option<AgentState>, op: &Op) -> bool {
    use AgentState::*;

    if before == after {
        return true;
    }
    match (before, after) {
        (None, Some(Registered)) | (Some(Dead), Some(Registered)) => matches!(op, Op::Register(_)),
        (Some(Registered | Suspect), Some(Active)) => matches!(op, Op::Heartbeat(_)),
        (Some(Registered | Active), Some(Suspect)) | (Some(Suspect), Some(Dead)) | (Some(Dead), None) => {
            matches!(op, Op::Sweep)
        }
        _ => false,
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

proptest! {
    #[test]
    fn transitions_follow_the_lifecycle(ops in prop::collection::vec(op(), 1..80)) {
        let registry = AgentRegistry::new(LivenessConfig::default());
        let mut now = start();

        for op in &ops {
            let before: Vec<Option<AgentState>> = AGENTS
                .iter()
                .map(|id| registry.get(&AgentId::from(*id)).map(|a| a.state))
                .collect();

            match op {
                Op::Register(i) => {
                    registry.register(registration(AGENTS[*i]), now);
                }
                Op::Heartbeat(i) => {
                    let _ = registry.heartbeat(
                        &AgentId::from(AGENTS[*i]),
                        LoadSnapshot::new(0.3, 0.3, 0, now),
                        now,
                    );
                }
                Op::Advance(secs) => now += ChronoDuration::seconds(*secs),
                Op::Sweep => {
                    registry.sweep(now);
                }
            }

            for (i, id) in AGENTS.iter().enumerate() {
                let after = registry.get(&AgentId::from(*id)).map(|a| a.state);
                prop_assert!(
                    allowed(before[i], after, op),
                    "{}: {:?} -> {:?} on {:?}", id, before[i], after, op
                );
            }
        }
    }

    #[test]
    fn dead_agents_reject_heartbeats_until_reregistered(silence in 46i64..300) {
        let registry = AgentRegistry::new(LivenessConfig::default());
        let id = AgentId::from("kitchen");
        let t0 = start();
        registry.register(registration("kitchen"), t0);

        registry.sweep(t0 + ChronoDuration::seconds(16));
        registry.sweep(t0 + ChronoDuration::seconds(silence));
        prop_assert_eq!(registry.get(&id).map(|a| a.state), Some(AgentState::Dead));

        let later = t0 + ChronoDuration::seconds(silence + 1);
        prop_assert!(registry.heartbeat(&id, LoadSnapshot::new(0.1, 0.1, 0, later), later).is_err());

        registry.register(registration("kitchen"), later);
        prop_assert_eq!(
            registry.heartbeat(&id, LoadSnapshot::new(0.1, 0.1, 0, later), later),
            Ok(AgentState::Active)
        );
    }
}

#[test]
fn concurrent_heartbeats_keep_the_freshest_load() {
    let registry = Arc::new(AgentRegistry::default());
    let id = AgentId::from("office");
    let t0 = start();
    registry.register(registration("office"), t0);

    std::thread::scope(|scope| {
        for worker in 0..8i64 {
            let registry = registry.clone();
            let id = id.clone();
            scope.spawn(move || {
                for step in 0..50i64 {
                    let at = t0 + ChronoDuration::milliseconds(step * 8 + worker);
                    let queue = (step * 8 + worker) as u32;
                    registry
                        .heartbeat(&id, LoadSnapshot::new(0.2, 0.2, queue, at), at)
                        .unwrap();
                }
            });
        }
    });

    let agent = registry.get(&id).unwrap();
    let load = agent.load.unwrap();
    assert_eq!(load.timestamp, t0 + ChronoDuration::milliseconds(49 * 8 + 7));
    assert_eq!(load.queue_depth, 49 * 8 + 7);
    assert_eq!(agent.state, AgentState::Active);
}
