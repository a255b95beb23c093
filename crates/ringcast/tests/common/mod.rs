// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! Simulated-cluster harness for the protocol tests.
//!
//! Runs any number of engines over the in-memory switch with a virtual
//! clock: frames deliver instantly within a pump, and time advances in
//! jumps to the next armed deadline. Everything is deterministic, so the
//! scenarios assert exact delivery and configuration-change sequences.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use ringcast::engine::{ConfigurationType, MembState, TotemEngine};
use ringcast::transport::mem::{DropFn, MemSwitch};
use ringcast::{Guarantee, ProcessorId, TotemConfig};

/// Everything observable from the upper layer, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Delivered {
        from: u32,
        payload: Vec<u8>,
    },
    Confchg {
        kind: ConfigurationType,
        members: Vec<u32>,
        left: Vec<u32>,
        joined: Vec<u32>,
        ring_seq: u64,
    },
}

pub struct Node {
    pub id: ProcessorId,
    pub engine: TotemEngine,
    pub events: Rc<RefCell<Vec<Event>>>,
    pub alive: bool,
}

impl Node {
    /// Delivered payloads, in order.
    pub fn deliveries(&self) -> Vec<Vec<u8>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Delivered { payload, .. } => Some(payload.clone()),
                Event::Confchg { .. } => None,
            })
            .collect()
    }

    /// Configuration changes, in order.
    pub fn confchgs(&self) -> Vec<Event> {
        self.events
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Confchg { .. }))
            .cloned()
            .collect()
    }
}

pub struct Cluster {
    pub switch: MemSwitch,
    pub nodes: Vec<Node>,
    pub clock: Instant,
    _ringid_dir: tempfile::TempDir,
}

/// Processor identity used throughout the scenarios: nodeid i at 10.0.0.i,
/// so address order equals nodeid order.
pub fn pid(i: u8) -> ProcessorId {
    ProcessorId::new(u32::from(i), IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)))
}

fn sorted_ids(members: &[ProcessorId]) -> Vec<u32> {
    let mut ids: Vec<u32> = members.iter().map(|m| m.nodeid).collect();
    ids.sort_unstable();
    ids
}

impl Cluster {
    /// Build (but do not start) a cluster of nodes 1..=n.
    pub fn new(n: u8) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let ringid_dir = tempfile::tempdir().expect("ring id dir");
        let switch = MemSwitch::new();
        let mut cluster = Self {
            switch,
            nodes: Vec::new(),
            clock: Instant::now(),
            _ringid_dir: ringid_dir,
        };
        for i in 1..=n {
            cluster.add_node(i);
        }
        cluster
    }

    pub fn add_node(&mut self, i: u8) {
        let id = pid(i);
        let port = self.switch.attach(id);
        let events: Rc<RefCell<Vec<Event>>> = Rc::new(RefCell::new(Vec::new()));

        let deliver_events = Rc::clone(&events);
        let confchg_events = Rc::clone(&events);
        let config = TotemConfig {
            ring_id_dir: self._ringid_dir.path().to_path_buf(),
            ..TotemConfig::default()
        };

        let engine = TotemEngine::new(
            config,
            id,
            Box::new(port),
            Box::new(move |source, payload, _swapped| {
                deliver_events.borrow_mut().push(Event::Delivered {
                    from: source.nodeid,
                    payload: payload.to_vec(),
                });
            }),
            Box::new(move |kind, members, left, joined, ring_id| {
                confchg_events.borrow_mut().push(Event::Confchg {
                    kind,
                    members: sorted_ids(members),
                    left: sorted_ids(left),
                    joined: sorted_ids(joined),
                    ring_seq: ring_id.seq,
                });
            }),
        )
        .expect("engine");

        self.nodes.push(Node {
            id,
            engine,
            events,
            alive: true,
        });
    }

    /// Start every node at the current virtual time.
    pub fn start_all(&mut self) {
        let now = self.clock;
        for node in &mut self.nodes {
            node.engine.start(now).expect("start");
        }
    }

    /// Suppress each node's own JOIN loopback. With simultaneous starts
    /// this keeps a node from committing a singleton ring before it has
    /// seen its peers; re-formations are unaffected because their gather
    /// sets already span the old membership.
    pub fn drop_self_joins(&self) {
        self.switch.set_drop_fn(Some(Box::new(|from, to, frame| {
            from == to && frame.first() == Some(&3)
        })));
    }

    pub fn clear_drop_fn(&self) {
        self.switch.set_drop_fn(None);
    }

    pub fn set_drop_fn(&self, f: DropFn) {
        self.switch.set_drop_fn(Some(f));
    }

    /// Detach a node from the fabric and stop driving it: a crash.
    pub fn kill(&mut self, i: u8) {
        let id = pid(i);
        self.switch.detach(&id);
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
            node.alive = false;
        }
    }

    /// Directory holding every node's persisted ring sequence.
    pub fn ring_dir(&self) -> &std::path::Path {
        self._ringid_dir.path()
    }

    pub fn node(&self, i: u8) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.id == pid(i))
            .expect("unknown node")
    }

    /// Queue a message on node `i` and wake the ring.
    pub fn mcast(&mut self, i: u8, payload: &[u8], guarantee: Guarantee) {
        let id = pid(i);
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .expect("unknown node");
        node.engine.mcast(payload, guarantee).expect("mcast");
        node.engine.new_msg_signal();
    }

    /// Deliver queued frames until the fabric is quiet.
    pub fn pump(&mut self) {
        let mut budget = 200_000u32;
        loop {
            let mut any = false;
            for node in &mut self.nodes {
                if !node.alive {
                    continue;
                }
                while let Some(dg) = self.switch.recv(&node.id) {
                    node.engine.handle_frame(dg.from, &dg.frame, self.clock);
                    any = true;
                    budget = budget.checked_sub(1).expect("frame storm: fabric never quiesced");
                }
            }
            if !any {
                return;
            }
        }
    }

    /// Advance virtual time by `duration`, firing every deadline passed on
    /// the way and pumping frames between firings.
    pub fn advance(&mut self, duration: Duration) {
        let target = self.clock + duration;
        loop {
            self.pump();
            let next = self
                .nodes
                .iter()
                .filter(|n| n.alive)
                .filter_map(|n| n.engine.next_deadline())
                .min();
            match next {
                Some(deadline) if deadline <= target => {
                    self.clock = deadline;
                    for node in &mut self.nodes {
                        if node.alive {
                            node.engine.poll_timers(self.clock);
                        }
                    }
                }
                _ => break,
            }
        }
        self.clock = target;
        self.pump();
    }

    /// Advance until `cond` holds, in `step` slices, up to `max`. Panics
    /// on timeout - scenarios are deterministic, a miss is a bug.
    pub fn advance_until(&mut self, max: Duration, cond: impl Fn(&Cluster) -> bool) {
        let step = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        loop {
            self.pump();
            if cond(self) {
                return;
            }
            assert!(waited < max, "condition not reached within {:?}", max);
            self.advance(step);
            waited += step;
        }
    }

    /// Whether every live node is operational on the same ring with the
    /// expected members.
    pub fn converged(&self, members: &[u8]) -> bool {
        let expected: Vec<u32> = members.iter().map(|&i| u32::from(i)).collect();
        let mut ring_ids = self
            .nodes
            .iter()
            .filter(|n| n.alive)
            .map(|n| (n.engine.state(), *n.engine.ring_id(), sorted_ids(n.engine.members())));
        let Some((first_state, first_ring, first_members)) = ring_ids.next() else {
            return false;
        };
        if first_state != MembState::Operational || first_members != expected {
            return false;
        }
        ring_ids.all(|(state, ring, membs)| {
            state == MembState::Operational && ring == first_ring && membs == expected
        })
    }

    /// Form a ring over all nodes and return once converged.
    pub fn form(&mut self) {
        self.drop_self_joins();
        self.start_all();
        let all: Vec<u8> = self.nodes.iter().map(|n| n.id.nodeid as u8).collect();
        self.advance_until(Duration::from_secs(10), |c| c.converged(&all));
        self.clear_drop_fn();
    }
}
