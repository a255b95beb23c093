// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! Event loop binding an engine to the UDP transport.
//!
//! Registers both ring sockets with a mio poll, sleeps until the next
//! protocol deadline or incoming datagram, drains the sockets into the
//! engine and fires due timers. Everything stays on the calling thread;
//! the engine's single-threaded model is preserved by construction.

use std::io;
use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::engine::{ConfchgFn, DeliverFn, TotemEngine};
use crate::member::ProcessorId;
use crate::transport::udp::UdpTransport;
use crate::{Result, TotemConfig};

const MCAST_SOCKET: Token = Token(0);
const TOKEN_SOCKET: Token = Token(1);

/// Largest datagram the loop will accept; UDP cannot carry more.
const RECV_BUFFER_SIZE: usize = 65_536;

/// A running ring member: engine + sockets + poll loop.
pub struct Runtime {
    engine: TotemEngine,
    poll: Poll,
    events: Events,
    mcast_socket: Arc<UdpSocket>,
    token_socket: Arc<UdpSocket>,
    started: bool,
}

impl Runtime {
    /// Bind the UDP transport on `my_id`'s address and build the engine
    /// around it.
    pub fn bind(
        config: TotemConfig,
        my_id: ProcessorId,
        deliver_fn: DeliverFn,
        confchg_fn: ConfchgFn,
    ) -> Result<Self> {
        let transport = UdpTransport::new(&config, my_id.addr)?;
        let mcast_socket = Arc::clone(transport.mcast_socket());
        let token_socket = Arc::clone(transport.token_socket());

        let engine = TotemEngine::new(config, my_id, Box::new(transport), deliver_fn, confchg_fn)?;

        let poll = Poll::new().map_err(crate::Error::Io)?;
        poll.registry()
            .register(
                &mut SourceFd(&mcast_socket.as_raw_fd()),
                MCAST_SOCKET,
                Interest::READABLE,
            )
            .map_err(crate::Error::Io)?;
        poll.registry()
            .register(
                &mut SourceFd(&token_socket.as_raw_fd()),
                TOKEN_SOCKET,
                Interest::READABLE,
            )
            .map_err(crate::Error::Io)?;

        Ok(Self {
            engine,
            poll,
            events: Events::with_capacity(128),
            mcast_socket,
            token_socket,
            started: false,
        })
    }

    /// Like [`Runtime::bind`], but discover the local interface address;
    /// only the nodeid needs configuring.
    pub fn bind_local(
        config: TotemConfig,
        nodeid: u32,
        deliver_fn: DeliverFn,
        confchg_fn: ConfchgFn,
    ) -> Result<Self> {
        let addr = crate::transport::udp::primary_interface()?;
        Self::bind(config, ProcessorId::new(nodeid, addr), deliver_fn, confchg_fn)
    }

    /// The engine, for upper-layer calls between iterations.
    #[must_use]
    pub fn engine(&self) -> &TotemEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TotemEngine {
        &mut self.engine
    }

    /// Run forever (or until a hard I/O error).
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.run_once()?;
        }
    }

    /// One loop iteration: sleep until the next deadline or datagram,
    /// drain the sockets, fire due timers. Useful for embedding the ring
    /// into an existing loop.
    pub fn run_once(&mut self) -> Result<()> {
        if !self.started {
            self.started = true;
            self.engine.start(Instant::now())?;
        }

        let now = Instant::now();
        let timeout = self
            .engine
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(crate::Error::Io(e)),
        }

        // Drain both sockets regardless of which event fired; readiness is
        // edge-ish and frames may have raced in on either socket.
        let mcast_socket = Arc::clone(&self.mcast_socket);
        let token_socket = Arc::clone(&self.token_socket);
        self.drain_socket(&mcast_socket)?;
        self.drain_socket(&token_socket)?;

        self.engine.poll_timers(Instant::now());
        Ok(())
    }

    fn drain_socket(&mut self, socket: &UdpSocket) -> Result<()> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    self.engine
                        .handle_frame(src.ip(), &buf[..len], Instant::now());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[runtime] receive failed: {}", e);
                    return Ok(());
                }
            }
        }
    }
}
