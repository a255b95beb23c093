// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! Process-local datagram switch.
//!
//! Connects any number of engines inside one process and one thread:
//! multicasts fan out to every attached port (loopback included), unicasts
//! land on the addressed port. Frames queue at the destination until the
//! driver pops them with [`MemSwitch::recv`], which keeps delivery order
//! under the driver's control - the cluster tests and the bench tool are
//! built on this.
//!
//! A drop filter can be installed to simulate loss or a partition: it sees
//! every (from, to, frame) triple and returns true to discard.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::rc::Rc;

use super::Transport;
use crate::member::ProcessorId;

/// One queued datagram: source address plus the raw frame.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: IpAddr,
    pub frame: Vec<u8>,
}

/// Decides whether a frame is dropped; returns true to discard.
pub type DropFn = Box<dyn FnMut(&ProcessorId, &ProcessorId, &[u8]) -> bool>;

struct PortState {
    id: ProcessorId,
    queue: VecDeque<Datagram>,
    attached: bool,
}

struct SwitchInner {
    ports: Vec<PortState>,
    drop_fn: Option<DropFn>,
}

impl SwitchInner {
    fn should_drop(&mut self, from: &ProcessorId, to: &ProcessorId, frame: &[u8]) -> bool {
        match &mut self.drop_fn {
            Some(f) => f(from, to, frame),
            None => false,
        }
    }

    fn deliver(&mut self, from: ProcessorId, to_index: usize, frame: &[u8]) {
        let to = self.ports[to_index].id;
        if !self.ports[to_index].attached || self.should_drop(&from, &to, frame) {
            return;
        }
        self.ports[to_index].queue.push_back(Datagram {
            from: from.addr,
            frame: frame.to_vec(),
        });
    }
}

/// The shared switch; clone handles freely, they all refer to the same
/// fabric. Single-threaded by design, like the engines it connects.
#[derive(Clone)]
pub struct MemSwitch {
    inner: Rc<RefCell<SwitchInner>>,
}

impl MemSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SwitchInner {
                ports: Vec::new(),
                drop_fn: None,
            })),
        }
    }

    /// Attach a port for `id`; reattaching a detached identity reuses its
    /// slot with an empty queue.
    #[must_use]
    pub fn attach(&self, id: ProcessorId) -> MemPort {
        let mut inner = self.inner.borrow_mut();
        if let Some(port) = inner.ports.iter_mut().find(|p| p.id == id) {
            port.attached = true;
            port.queue.clear();
        } else {
            inner.ports.push(PortState {
                id,
                queue: VecDeque::new(),
                attached: true,
            });
        }
        MemPort {
            id,
            inner: Rc::clone(&self.inner),
        }
    }

    /// Detach a port: pending frames are discarded and nothing further is
    /// delivered to it. Simulates a crashed processor.
    pub fn detach(&self, id: &ProcessorId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(port) = inner.ports.iter_mut().find(|p| p.id == *id) {
            port.attached = false;
            port.queue.clear();
        }
    }

    /// Install (or clear) the loss filter.
    pub fn set_drop_fn(&self, drop_fn: Option<DropFn>) {
        self.inner.borrow_mut().drop_fn = drop_fn;
    }

    /// Pop the next pending datagram for `id`.
    pub fn recv(&self, id: &ProcessorId) -> Option<Datagram> {
        let mut inner = self.inner.borrow_mut();
        inner
            .ports
            .iter_mut()
            .find(|p| p.id == *id)
            .and_then(|p| p.queue.pop_front())
    }

    /// Whether any attached port has pending frames.
    #[must_use]
    pub fn any_pending(&self) -> bool {
        self.inner
            .borrow()
            .ports
            .iter()
            .any(|p| p.attached && !p.queue.is_empty())
    }
}

impl Default for MemSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// One engine's endpoint on the switch.
pub struct MemPort {
    id: ProcessorId,
    inner: Rc<RefCell<SwitchInner>>,
}

impl Transport for MemPort {
    fn mcast(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        for index in 0..inner.ports.len() {
            inner.deliver(self.id, index, frame);
        }
        Ok(())
    }

    fn unicast(&mut self, to: &ProcessorId, frame: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(index) = inner.ports.iter().position(|p| p.id == *to) {
            inner.deliver(self.id, index, frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pid(last: u8) -> ProcessorId {
        ProcessorId::new(
            u32::from(last),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
        )
    }

    #[test]
    fn test_mcast_fans_out_with_loopback() {
        let switch = MemSwitch::new();
        let mut a = switch.attach(pid(1));
        let _b = switch.attach(pid(2));

        a.mcast(b"frame").expect("mcast");
        assert_eq!(switch.recv(&pid(1)).expect("loopback").frame, b"frame");
        let dg = switch.recv(&pid(2)).expect("peer");
        assert_eq!(dg.frame, b"frame");
        assert_eq!(dg.from, pid(1).addr);
    }

    #[test]
    fn test_unicast_targets_one_port() {
        let switch = MemSwitch::new();
        let mut a = switch.attach(pid(1));
        let _b = switch.attach(pid(2));
        let _c = switch.attach(pid(3));

        a.unicast(&pid(2), b"token").expect("unicast");
        assert!(switch.recv(&pid(1)).is_none());
        assert!(switch.recv(&pid(3)).is_none());
        assert_eq!(switch.recv(&pid(2)).expect("target").frame, b"token");
    }

    #[test]
    fn test_detach_discards() {
        let switch = MemSwitch::new();
        let mut a = switch.attach(pid(1));
        let _b = switch.attach(pid(2));

        switch.detach(&pid(2));
        a.mcast(b"frame").expect("mcast");
        assert!(switch.recv(&pid(2)).is_none());
    }

    #[test]
    fn test_drop_fn_filters() {
        let switch = MemSwitch::new();
        let mut a = switch.attach(pid(1));
        let _b = switch.attach(pid(2));
        let _c = switch.attach(pid(3));

        // Cut the 1 -> 2 edge only.
        switch.set_drop_fn(Some(Box::new(|from, to, _| {
            from.nodeid == 1 && to.nodeid == 2
        })));
        a.mcast(b"frame").expect("mcast");
        assert!(switch.recv(&pid(2)).is_none());
        assert!(switch.recv(&pid(3)).is_some());

        switch.set_drop_fn(None);
        a.mcast(b"frame").expect("mcast");
        assert!(switch.recv(&pid(2)).is_some());
    }
}
