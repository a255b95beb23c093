// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! End-to-end protocol scenarios over the simulated cluster.

mod common;

use std::time::Duration;

use common::{pid, Cluster, Event};
use ringcast::engine::ConfigurationType;
use ringcast::wire::McastHeader;
use ringcast::{Guarantee, MembState};

// =======================================================================
// Formation
// =======================================================================

#[test]
fn test_single_node_ring_delivers_own_mcast() {
    let mut cluster = Cluster::new(1);
    cluster.start_all();
    cluster.advance_until(Duration::from_secs(5), |c| c.converged(&[1]));

    assert_eq!(cluster.node(1).engine.ring_id().seq, 4);
    assert_eq!(cluster.node(1).engine.aru(), 0);

    cluster.mcast(1, b"A", Guarantee::Agreed);
    cluster.advance(Duration::from_secs(1));

    assert_eq!(cluster.node(1).deliveries(), vec![b"A".to_vec()]);
    assert_eq!(cluster.node(1).engine.aru(), 1);
    assert_eq!(cluster.node(1).engine.high_delivered(), 1);
}

#[test]
fn test_three_node_join() {
    let mut cluster = Cluster::new(3);
    cluster.form();

    // Lowest address is the representative; first installation takes the
    // ring sequence from 0 to 4.
    for i in 1..=3 {
        let node = cluster.node(i);
        assert_eq!(node.engine.state(), MembState::Operational);
        assert_eq!(node.engine.ring_id().rep, pid(1));
        assert_eq!(node.engine.ring_id().seq, 4);

        let confchgs = node.confchgs();
        assert_eq!(
            confchgs,
            vec![
                Event::Confchg {
                    kind: ConfigurationType::Transitional,
                    members: vec![],
                    left: vec![],
                    joined: vec![],
                    ring_seq: 4,
                },
                Event::Confchg {
                    kind: ConfigurationType::Regular,
                    members: vec![1, 2, 3],
                    left: vec![],
                    joined: vec![1, 2, 3],
                    ring_seq: 4,
                },
            ],
            "node {i}"
        );
    }
}

#[test]
fn test_transitional_precedes_any_delivery() {
    let mut cluster = Cluster::new(3);
    cluster.form();
    cluster.mcast(2, b"after-join", Guarantee::Agreed);
    cluster.advance(Duration::from_secs(1));

    for i in 1..=3 {
        let events = cluster.node(i).events.borrow().clone();
        let first_delivery = events
            .iter()
            .position(|e| matches!(e, Event::Delivered { .. }))
            .expect("delivery");
        let transitional = events
            .iter()
            .position(|e| {
                matches!(
                    e,
                    Event::Confchg {
                        kind: ConfigurationType::Transitional,
                        ..
                    }
                )
            })
            .expect("transitional confchg");
        let regular = events
            .iter()
            .position(|e| {
                matches!(
                    e,
                    Event::Confchg {
                        kind: ConfigurationType::Regular,
                        ..
                    }
                )
            })
            .expect("regular confchg");
        assert!(transitional < regular, "node {i}");
        assert!(regular < first_delivery, "node {i}");
    }
}

// =======================================================================
// Ordering and retransmission
// =======================================================================

#[test]
fn test_agreed_order_identical_across_members() {
    let mut cluster = Cluster::new(3);
    cluster.form();

    // Interleaved senders; the token serializes them.
    for round in 0u8..4 {
        for sender in 1u8..=3 {
            let payload = vec![sender, round];
            cluster.mcast(sender, &payload, Guarantee::Agreed);
        }
    }
    cluster.advance(Duration::from_secs(3));

    let reference = cluster.node(1).deliveries();
    assert_eq!(reference.len(), 12, "every message delivered exactly once");
    for i in 2..=3 {
        assert_eq!(cluster.node(i).deliveries(), reference, "node {i}");
    }
}

#[test]
fn test_lost_mcast_recovered_by_retransmit() {
    let mut cluster = Cluster::new(3);
    cluster.form();

    // Node 2 misses the frame carrying sequence 5, exactly once.
    let mut dropped = false;
    cluster.set_drop_fn(Box::new(move |_from, to, frame| {
        if dropped || to.nodeid != 2 || frame.first() != Some(&1) {
            return false;
        }
        match McastHeader::decode(frame) {
            Ok(header) if header.seq == 5 => {
                dropped = true;
                true
            }
            _ => false,
        }
    }));

    for n in 1u8..=6 {
        cluster.mcast(1, &[n], Guarantee::Agreed);
    }
    cluster.advance(Duration::from_secs(3));
    cluster.clear_drop_fn();

    let expected: Vec<Vec<u8>> = (1u8..=6).map(|n| vec![n]).collect();
    for i in 1..=3 {
        assert_eq!(cluster.node(i).deliveries(), expected, "node {i}");
    }
}

#[test]
fn test_safe_delivery_waits_for_every_member() {
    let mut cluster = Cluster::new(3);
    cluster.form();

    // Cut all multicast data to node 3: it keeps the token moving but
    // cannot receive (or recover) the payloads.
    cluster.set_drop_fn(Box::new(|_from, to, frame| {
        to.nodeid == 3 && frame.first() == Some(&1)
    }));

    cluster.mcast(1, b"X", Guarantee::Safe);
    cluster.mcast(2, b"Y", Guarantee::Safe);
    cluster.advance(Duration::from_millis(800));

    for i in 1..=3 {
        assert_eq!(
            cluster.node(i).deliveries(),
            Vec::<Vec<u8>>::new(),
            "node {i} must not deliver a SAFE message before all members hold it"
        );
    }

    // Heal: node 3 recovers via retransmit requests, then everyone
    // delivers, in the same order.
    cluster.clear_drop_fn();
    cluster.advance(Duration::from_secs(2));

    let reference = cluster.node(1).deliveries();
    assert_eq!(reference.len(), 2);
    for i in 2..=3 {
        assert_eq!(cluster.node(i).deliveries(), reference, "node {i}");
    }
}

#[test]
fn test_random_loss_soak() {
    let mut cluster = Cluster::new(3);
    cluster.form();

    // Seeded 20% loss on every multicast edge; the retransmit machinery
    // must still produce identical in-order delivery everywhere.
    let mut rng = fastrand::Rng::with_seed(0x0dec_ade5);
    cluster.set_drop_fn(Box::new(move |_from, _to, frame| {
        frame.first() == Some(&1) && rng.u8(..100) < 20
    }));

    for n in 0u8..20 {
        cluster.mcast(1 + n % 3, &[n], Guarantee::Agreed);
    }
    cluster.advance(Duration::from_secs(8));
    cluster.clear_drop_fn();
    cluster.advance(Duration::from_secs(2));

    let reference = cluster.node(1).deliveries();
    assert_eq!(reference.len(), 20, "every message delivered exactly once");
    for i in 2..=3 {
        assert_eq!(cluster.node(i).deliveries(), reference, "node {i}");
    }
}

// =======================================================================
// Failure and re-formation
// =======================================================================

#[test]
fn test_representative_failure_elects_next_lowest() {
    let mut cluster = Cluster::new(5);
    cluster.form();
    assert_eq!(cluster.node(2).engine.ring_id().rep, pid(1));

    cluster.kill(1);
    cluster.advance_until(Duration::from_secs(10), |c| c.converged(&[2, 3, 4, 5]));

    for i in 2..=5 {
        let node = cluster.node(i);
        assert_eq!(node.engine.ring_id().rep, pid(2), "node {i}");
        assert!(node.engine.ring_id().seq > 4, "node {i}");

        // The re-formation reports the failed representative as left in
        // the transitional configuration, then the surviving four.
        let confchgs = node.confchgs();
        let trans_pos = confchgs
            .iter()
            .position(|e| {
                matches!(
                    e,
                    Event::Confchg {
                        kind: ConfigurationType::Transitional,
                        members,
                        left,
                        ..
                    } if members == &vec![2, 3, 4, 5] && left == &vec![1]
                )
            })
            .unwrap_or_else(|| panic!("node {i} missing transitional confchg: {confchgs:?}"));
        assert!(
            matches!(
                &confchgs[trans_pos + 1],
                Event::Confchg {
                    kind: ConfigurationType::Regular,
                    members,
                    left,
                    ..
                } if members == &vec![2, 3, 4, 5] && left.is_empty()
            ),
            "node {i} regular confchg must follow: {confchgs:?}"
        );
    }
}

#[test]
fn test_partition_and_merge() {
    let mut cluster = Cluster::new(3);
    cluster.form();
    let formed_seq = cluster.node(1).engine.ring_id().seq;
    assert_eq!(formed_seq, 4);

    // Partition {1,2} | {3}.
    let group = |id: u32| u8::from(id == 3);
    cluster.set_drop_fn(Box::new(move |from, to, _frame| {
        group(from.nodeid) != group(to.nodeid)
    }));

    cluster.advance_until(Duration::from_secs(10), |c| {
        c.node(1).engine.state() == MembState::Operational
            && c.node(1).engine.members() == [pid(1), pid(2)].as_slice()
            && c.node(3).engine.state() == MembState::Operational
            && c.node(3).engine.members() == [pid(3)].as_slice()
    });

    let majority_seq = cluster.node(1).engine.ring_id().seq;
    let minority_seq = cluster.node(3).engine.ring_id().seq;
    assert!(majority_seq > formed_seq);
    assert!(minority_seq > formed_seq);

    // Heal: merge-detect traffic pulls both rings into gather and a single
    // ring installs with a sequence above either partition's.
    cluster.clear_drop_fn();
    cluster.advance_until(Duration::from_secs(10), |c| c.converged(&[1, 2, 3]));

    let merged = cluster.node(1).engine.ring_id();
    assert!(merged.seq > majority_seq);
    assert!(merged.seq > minority_seq);
    assert_eq!(merged.rep, pid(1));

    // Ring sequences on any one processor strictly increase across
    // installations.
    for i in 1..=3 {
        let seqs: Vec<u64> = cluster
            .node(i)
            .confchgs()
            .iter()
            .filter_map(|e| match e {
                Event::Confchg {
                    kind: ConfigurationType::Regular,
                    ring_seq,
                    ..
                } => Some(*ring_seq),
                _ => None,
            })
            .collect();
        assert!(
            seqs.windows(2).all(|w| w[0] < w[1]),
            "node {i} ring sequences {seqs:?} must strictly increase"
        );
    }
}

#[test]
fn test_messages_survive_membership_change() {
    let mut cluster = Cluster::new(3);
    cluster.form();

    // Deliver a batch, then lose a member; the re-formation must not
    // re-deliver or reorder anything on the survivors.
    for n in 1u8..=4 {
        cluster.mcast(1, &[n], Guarantee::Agreed);
    }
    cluster.advance(Duration::from_secs(1));
    cluster.kill(2);
    cluster.advance_until(Duration::from_secs(10), |c| c.converged(&[1, 3]));

    let expected: Vec<Vec<u8>> = (1u8..=4).map(|n| vec![n]).collect();
    for i in [1u8, 3] {
        assert_eq!(cluster.node(i).deliveries(), expected, "node {i}");
    }
}
