// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! Ordered-multicast throughput benchmark.
//!
//! Spins an in-process ring of N engines over the in-memory switch and
//! measures how fast batches of agreed (or safe) messages flow from the
//! first member to delivery on every member. Reports messages/s and MB/s
//! per batch, like a protocol benchmark should: end-to-end through codec,
//! token engine and delivery pipeline.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::Parser;

use ringcast::engine::{MembState, TotemEngine};
use ringcast::transport::mem::MemSwitch;
use ringcast::{Guarantee, ProcessorId, TotemConfig};

#[derive(Parser)]
#[command(name = "ringcast-bench", about = "ringcast ordered multicast benchmark")]
struct Args {
    /// Number of ring members.
    #[arg(short, long, default_value_t = 3)]
    nodes: u8,

    /// Payload size in bytes.
    #[arg(short, long, default_value_t = 400)]
    size: usize,

    /// Messages per batch.
    #[arg(short, long, default_value_t = 1000)]
    batch: usize,

    /// Number of batches.
    #[arg(short = 'c', long, default_value_t = 10)]
    count: usize,

    /// Use safe delivery instead of agreed.
    #[arg(long, default_value_t = false)]
    safe: bool,
}

struct SimNode {
    id: ProcessorId,
    engine: TotemEngine,
    delivered: Rc<RefCell<u64>>,
}

struct SimRing {
    switch: MemSwitch,
    nodes: Vec<SimNode>,
    clock: Instant,
    _ringid_dir: tempfile::TempDir,
}

impl SimRing {
    fn new(n: u8) -> Self {
        let ringid_dir = tempfile::tempdir().expect("ring id dir");
        let switch = MemSwitch::new();
        let mut nodes = Vec::new();

        for i in 1..=n {
            let id = ProcessorId::new(u32::from(i), IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)));
            let port = switch.attach(id);
            let delivered = Rc::new(RefCell::new(0u64));
            let count = Rc::clone(&delivered);
            let engine = TotemEngine::new(
                TotemConfig {
                    ring_id_dir: ringid_dir.path().to_path_buf(),
                    ..TotemConfig::default()
                },
                id,
                Box::new(port),
                Box::new(move |_, _, _| {
                    *count.borrow_mut() += 1;
                }),
                Box::new(|_, _, _, _, _| {}),
            )
            .expect("engine");
            nodes.push(SimNode {
                id,
                engine,
                delivered,
            });
        }

        Self {
            switch,
            nodes,
            clock: Instant::now(),
            _ringid_dir: ringid_dir,
        }
    }

    fn pump(&mut self) {
        loop {
            let mut any = false;
            for node in &mut self.nodes {
                while let Some(dg) = self.switch.recv(&node.id) {
                    node.engine.handle_frame(dg.from, &dg.frame, self.clock);
                    any = true;
                }
            }
            if !any {
                return;
            }
        }
    }

    /// Jump virtual time forward, firing deadlines in order.
    fn advance(&mut self, duration: Duration) {
        let target = self.clock + duration;
        loop {
            self.pump();
            let next = self
                .nodes
                .iter()
                .filter_map(|n| n.engine.next_deadline())
                .min();
            match next {
                Some(deadline) if deadline <= target => {
                    self.clock = deadline;
                    for node in &mut self.nodes {
                        node.engine.poll_timers(self.clock);
                    }
                }
                _ => break,
            }
        }
        self.clock = target;
        self.pump();
    }

    fn form(&mut self) {
        let now = self.clock;
        for node in &mut self.nodes {
            node.engine.start(now).expect("start");
        }
        for _ in 0..200 {
            self.advance(Duration::from_millis(100));
            if self
                .nodes
                .iter()
                .all(|n| n.engine.state() == MembState::Operational
                    && n.engine.members().len() == self.nodes.len())
            {
                return;
            }
        }
        panic!("ring failed to form");
    }

    fn total_delivered(&self) -> u64 {
        self.nodes.iter().map(|n| *n.delivered.borrow()).sum()
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let guarantee = if args.safe {
        Guarantee::Safe
    } else {
        Guarantee::Agreed
    };

    println!(
        "ringcast-bench: {} nodes, {} byte payload, {} x {} messages, {:?} delivery",
        args.nodes, args.size, args.count, args.batch, guarantee
    );

    let mut ring = SimRing::new(args.nodes);
    ring.form();
    println!("ring formed: {}", ring.nodes[0].engine.ring_id());

    let payload = vec![0xa5u8; args.size];
    let expected_per_batch = (args.batch as u64) * u64::from(args.nodes);
    let mut total_msgs = 0u64;
    let mut total_elapsed = Duration::ZERO;

    for batch in 0..args.count {
        let delivered_before = ring.total_delivered();
        let started = Instant::now();

        let mut queued = 0;
        while queued < args.batch {
            match ring.nodes[0].engine.mcast(&payload, guarantee) {
                Ok(()) => queued += 1,
                Err(ringcast::Error::QueueFull) => {
                    ring.nodes[0].engine.new_msg_signal();
                    ring.advance(Duration::from_millis(20));
                }
                Err(e) => panic!("mcast failed: {e}"),
            }
        }
        ring.nodes[0].engine.new_msg_signal();
        while ring.total_delivered() - delivered_before < expected_per_batch {
            ring.advance(Duration::from_millis(20));
        }

        let elapsed = started.elapsed();
        total_msgs += args.batch as u64;
        total_elapsed += elapsed;

        let secs = elapsed.as_secs_f64();
        println!(
            "batch {:>3}: {:>8.0} msg/s {:>8.2} MB/s",
            batch,
            args.batch as f64 / secs,
            (args.batch * args.size) as f64 / secs / 1_048_576.0
        );
    }

    let secs = total_elapsed.as_secs_f64();
    println!(
        "total: {} messages in {:.3}s = {:.0} msg/s, {:.2} MB/s",
        total_msgs,
        secs,
        total_msgs as f64 / secs,
        (total_msgs as usize * args.size) as f64 / secs / 1_048_576.0
    );
}
