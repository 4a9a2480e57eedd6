//! The socket-style API: bind / listen / connect / accept / send / recv /
//! shutdown / poll / close, plus address getters and per-socket options.
//!
//! Blocking operations park on the socket's condvar and are woken by the
//! state machine (handshake completion, notification packets, shutdown,
//! substrate events) or by engine timers; the condvar itself never times out,
//! which keeps the waits honest under a simulated clock.

use std::sync::{Arc, MutexGuard, Weak};

use crate::addr::{self, Addr, CID_ANY, PORT_ANY};
use crate::notify::{NotifyOps, RecvData, SendData};
use crate::packet::{PacketType, Payload, ProtoFlags};
use crate::qp::QueuePair;
use crate::socket::{PollEvents, ShutdownFlags, SocketError, State, StreamCore, VsockSocket};
use crate::stack::{with_notify_ctx, VsockStack};
use crate::tables::listener;
use crate::util::time::Duration as _;
use crate::{
    AcceptError, AddrGetError, BindError, ConnectError, Dependencies, ListenError, ProtoOverride,
    RecvError, SendError, SetOptError, ShutdownError, DEFAULT_CONNECT_TIMEOUT_MS,
};

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ConnectFlags: u32 {
        /// Return `InProgress` instead of blocking; completion is observable
        /// through `poll` or a later `connect` call.
        const NONBLOCK = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        const DONTWAIT = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct RecvFlags: u32 {
        const DONTWAIT = 1 << 0;
        /// Copy data out without consuming it.
        const PEEK = 1 << 1;
        /// Block until the whole buffer is filled (or the stream ends).
        const WAITALL = 1 << 2;
    }
}

fn wait<'a, X: Dependencies>(
    sk: &'a VsockSocket<X>,
    guard: MutexGuard<'a, StreamCore<X>>,
) -> MutexGuard<'a, StreamCore<X>> {
    sk.cond.wait(guard).unwrap_or_else(|e| e.into_inner())
}

impl<X: Dependencies> VsockStack<X> {
    /// Bind to a local address. `CID_ANY` binds the local context; `PORT_ANY`
    /// picks an ephemeral port.
    pub fn bind(&self, sk: &Arc<VsockSocket<X>>, bind_addr: Addr) -> Result<(), BindError> {
        let mut core = sk.lock();
        self.bind_locked(sk, &mut core, bind_addr)
    }

    pub(crate) fn bind_locked(
        &self,
        sk: &Arc<VsockSocket<X>>,
        core: &mut StreamCore<X>,
        bind_addr: Addr,
    ) -> Result<(), BindError> {
        if core.local.is_bound() {
            return Err(BindError::Invalid);
        }

        // Like other families refuse non-local addresses, we only bind the
        // CID this endpoint actually has.
        if bind_addr.cid != self.deps.local_cid() && bind_addr.cid != CID_ANY {
            return Err(BindError::AddrNotAvailable);
        }

        let mut tables = self.tables();

        let port = if bind_addr.port == PORT_ANY {
            tables
                .select_ephemeral_port()
                .ok_or(BindError::AddrNotAvailable)?
        } else {
            if addr::is_privileged_port(bind_addr.port) && !core.can_bind_privileged {
                return Err(BindError::AccessDenied);
            }
            if tables.find_bound(Addr::new(CID_ANY, bind_addr.port)).is_some() {
                return Err(BindError::AddrInUse);
            }
            bind_addr.port
        };

        // move from the unbound bucket to the port's hash bucket
        let _ = tables.remove_bound(PORT_ANY, sk);
        tables.insert_bound(port, sk);
        core.local = Addr::new(bind_addr.cid, port);

        Ok(())
    }

    /// Start listening for connection requests. Re-listening just updates the
    /// backlog.
    pub fn listen(&self, sk: &Arc<VsockSocket<X>>, backlog: u32) -> Result<(), ListenError> {
        let mut core = sk.lock();

        if !core.local.is_bound() {
            return Err(ListenError::Invalid);
        }
        if !matches!(core.state, State::Free | State::Unconnected | State::Listen) {
            return Err(ListenError::Invalid);
        }

        core.max_backlog = backlog;
        core.state = State::Listen;

        Ok(())
    }

    /// Connect to a remote stream endpoint. Blocking unless
    /// [`ConnectFlags::NONBLOCK`], in which case `InProgress` is returned and
    /// a timeout of the socket's `connect_timeout` is armed.
    pub fn connect(
        stack: &Arc<Self>,
        sk: &Arc<VsockSocket<X>>,
        remote: Addr,
        flags: ConnectFlags,
    ) -> Result<(), ConnectError> {
        let nonblock = flags.contains(ConnectFlags::NONBLOCK);
        let mut core = sk.lock();

        let in_progress = match core.state {
            State::Connected => return Err(ConnectError::IsConnected),
            State::Disconnecting | State::Listen => return Err(ConnectError::InvalidState),
            // keep waiting for the attempt already under way (or report it,
            // if non-blocking)
            State::Connecting => ConnectError::Already,
            State::Free | State::Unconnected => {
                // The hypervisor and reserved contexts have no connectable
                // stream endpoints.
                if !addr::stream_reachable(remote.cid) {
                    return Err(ConnectError::NetUnreach);
                }

                core.remote = remote;

                if !core.local.is_bound() {
                    stack
                        .bind_locked(sk, &mut core, Addr::ANY)
                        .map_err(ConnectError::Bind)?;
                }

                core.state = State::Connecting;

                let legacy = matches!(stack.config.proto_override, Some(ProtoOverride::Legacy));
                let sent = if legacy {
                    stack.send_to(
                        &core,
                        PacketType::Request,
                        Payload::Size(core.qp_size),
                        ProtoFlags::empty(),
                    )
                } else {
                    let sent = stack.send_to(
                        &core,
                        PacketType::Request2,
                        Payload::Size(core.qp_size),
                        ProtoFlags::ALL_SUPPORTED,
                    );
                    if sent.is_ok() {
                        // a REQUEST2 is out; an INVALID reply downgrades us
                        // to the legacy request
                        core.sent_request = true;
                    }
                    sent
                };

                if sent.is_err() {
                    core.state = State::Unconnected;
                    return Err(ConnectError::SendFailed);
                }

                // Arm the handshake deadline. The timer fires for blocking
                // and non-blocking connects alike; a completed handshake
                // makes it a no-op.
                let stack2 = Arc::clone(stack);
                let sk2 = Arc::clone(sk);
                let deadline = stack.deps.current_time() + core.connect_timeout;
                stack
                    .deps
                    .register_timer(deadline, move || stack2.connect_timeout_fire(&sk2));

                ConnectError::InProgress
            }
        };

        if nonblock {
            return Err(in_progress);
        }

        // The receive path does the rest of the handshake; wait for it to
        // finish or fail.
        loop {
            if let Some(e) = core.err {
                core.state = State::Unconnected;
                return Err(ConnectError::Socket(e));
            }
            if core.state == State::Connected {
                return Ok(());
            }

            core = wait(sk, core);
        }
    }

    pub(crate) fn connect_timeout_fire(&self, sk: &Arc<VsockSocket<X>>) {
        let mut core = sk.lock();

        if core.state == State::Connecting && core.shutdown != ShutdownFlags::BOTH {
            core.state = State::Unconnected;
            core.err = Some(SocketError::TimedOut);
            sk.wake_all();
        }
    }

    /// Take the next established child off the accept queue, blocking unless
    /// `nonblock`.
    pub fn accept(
        &self,
        sk: &Arc<VsockSocket<X>>,
        nonblock: bool,
    ) -> Result<Arc<VsockSocket<X>>, AcceptError> {
        let mut core = sk.lock();

        if core.state != State::Listen {
            return Err(AcceptError::Invalid);
        }

        let child = loop {
            if let Some(child) = listener::dequeue_accept(&mut core) {
                break Some(child);
            }
            if core.err.is_some() {
                break None;
            }
            if nonblock {
                return Err(AcceptError::WouldBlock);
            }

            core = wait(sk, core);

            if core.state != State::Listen {
                return Err(AcceptError::Invalid);
            }
        };

        let listener_err = core.err;

        let Some(child) = child else {
            // only reachable with an error recorded
            return Err(AcceptError::Socket(listener_err.unwrap_or(SocketError::Invalid)));
        };

        core.ack_backlog = core.ack_backlog.saturating_sub(1);

        let mut ccore = child.lock();
        if let Some(e) = listener_err {
            // The listener saw an error; mark the child rejected and let the
            // pending-cleanup task finish the teardown (finding it in the
            // accept queue guarantees the task has not run yet).
            ccore.rejected = true;
            return Err(AcceptError::Socket(e));
        }

        // accepted: the listener relation is severed
        ccore.listener = Weak::new();

        drop(ccore);
        Ok(child)
    }

    /// Enqueue bytes into the stream. Blocks until at least one byte is
    /// written (unless [`SendFlags::DONTWAIT`]); returns the number of bytes
    /// enqueued, which may be short of `buf.len()`.
    pub fn send(
        &self,
        sk: &Arc<VsockSocket<X>>,
        buf: &[u8],
        flags: SendFlags,
    ) -> Result<usize, SendError> {
        let nonblock = flags.contains(SendFlags::DONTWAIT);
        let mut core = sk.lock();

        // only send if neither side has shut the direction down
        if core.shutdown.contains(ShutdownFlags::SEND)
            || core.peer_shutdown.contains(ShutdownFlags::RCV)
        {
            return Err(SendError::Pipe);
        }
        if core.state != State::Connected || !core.local.is_bound() {
            return Err(SendError::NotConnected);
        }
        if !core.remote.is_bound() {
            return Err(SendError::AddrRequired);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut data = SendData::default();
        core.with_notify(|notify, _| notify.send_init(&mut data));

        let mut total = 0usize;
        let mut err = None;

        'send: while total < buf.len() {
            // wait for room in the produce queue
            while core.stream_has_space() == 0
                && core.err.is_none()
                && !core.shutdown.contains(ShutdownFlags::SEND)
                && !core.peer_shutdown.contains(ShutdownFlags::RCV)
            {
                if nonblock {
                    err = Some(SendError::WouldBlock);
                    break 'send;
                }

                let pre = with_notify_ctx(&self.deps, &mut core, |notify, ctx| {
                    notify.send_pre_block(ctx, &mut data)
                })
                .unwrap_or(Ok(()));
                if pre.is_err() {
                    err = Some(SendError::HostUnreach);
                    break 'send;
                }

                core = wait(sk, core);
            }

            // checked both as the wait condition and after waking
            if let Some(e) = core.err {
                err = Some(SendError::Socket(e));
                break;
            }
            if core.shutdown.contains(ShutdownFlags::SEND)
                || core.peer_shutdown.contains(ShutdownFlags::RCV)
            {
                err = Some(SendError::Pipe);
                break;
            }

            with_notify_ctx(&self.deps, &mut core, |notify, ctx| {
                notify.send_pre_enqueue(ctx, &mut data)
            });

            // The enqueue writes as much as fits; short writes loop around.
            let written = {
                let Some(qp) = core.qp.as_ref() else {
                    err = Some(SendError::NotConnected);
                    break;
                };
                match qp.enqueue(&buf[total..]) {
                    Ok(n) => n,
                    Err(_) => {
                        err = Some(SendError::NoMem);
                        break;
                    }
                }
            };
            total += written;

            with_notify_ctx(&self.deps, &mut core, |notify, ctx| {
                notify.send_post_enqueue(ctx, written as u64, &mut data)
            });
        }

        // partial progress wins over the error
        if total > 0 {
            Ok(total)
        } else if let Some(err) = err {
            Err(err)
        } else {
            Ok(0)
        }
    }

    /// Dequeue bytes from the stream. Returns 0 on an orderly end of stream.
    /// With [`RecvFlags::WAITALL`] the call keeps consuming until the buffer
    /// is full, the stream ends, or an error occurs.
    pub fn recv(
        &self,
        sk: &Arc<VsockSocket<X>>,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> Result<usize, RecvError> {
        let nonblock = flags.contains(RecvFlags::DONTWAIT);
        let peek = flags.contains(RecvFlags::PEEK);
        let mut core = sk.lock();

        if core.state != State::Connected {
            // 0 for an orderly peer shutdown, an error for a connection that
            // never was (or a local teardown).
            return if core.done {
                Ok(0)
            } else {
                Err(RecvError::NotConnected)
            };
        }

        // The peer may have shut down with data still in our consume queue,
        // so peer_shutdown alone does not end the stream; a local receive
        // shutdown does.
        if core.shutdown.contains(ShutdownFlags::RCV) {
            return Ok(0);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        // We must not return success with fewer than `target` bytes, which
        // makes a target beyond the ring size impossible to satisfy.
        let mut target: u64 = if flags.contains(RecvFlags::WAITALL) {
            buf.len() as u64
        } else {
            1
        };
        if target >= core.consume_size {
            return Err(RecvError::NoMem);
        }

        let mut data = RecvData::default();
        let consume_size = core.consume_size;
        core.with_notify(|notify, _| notify.recv_init(consume_size, target, &mut data));

        let mut copied = 0usize;
        let mut err = None;

        loop {
            let ready = core.stream_has_data();

            if ready > 0 {
                with_notify_ctx(&self.deps, &mut core, |notify, ctx| {
                    notify.recv_pre_dequeue(ctx, &mut data)
                });

                let read = {
                    let Some(qp) = core.qp.as_ref() else {
                        err = Some(RecvError::NotConnected);
                        break;
                    };
                    let rv = if peek {
                        qp.peek(&mut buf[copied..])
                    } else {
                        qp.dequeue(&mut buf[copied..])
                    };
                    match rv {
                        Ok(n) => n,
                        Err(_) => {
                            err = Some(RecvError::NoMem);
                            break;
                        }
                    }
                };
                copied += read;

                with_notify_ctx(&self.deps, &mut core, |notify, ctx| {
                    notify.recv_post_dequeue(ctx, target, read as u64, !peek, &mut data)
                });

                if read as u64 >= target || peek {
                    break;
                }
                target -= read as u64;
            } else {
                if core.err.is_some()
                    || core.shutdown.contains(ShutdownFlags::RCV)
                    || core.peer_shutdown.contains(ShutdownFlags::SEND)
                {
                    break;
                }
                if nonblock {
                    err = Some(RecvError::WouldBlock);
                    break;
                }

                let pre = with_notify_ctx(&self.deps, &mut core, |notify, ctx| {
                    notify.recv_pre_block(ctx, target, &mut data)
                })
                .unwrap_or(Ok(()));
                if pre.is_err() {
                    err = Some(RecvError::HostUnreach);
                    break;
                }

                core = wait(sk, core);
            }
        }

        if let Some(e) = core.err {
            err = Some(RecvError::Socket(e));
        } else if core.shutdown.contains(ShutdownFlags::RCV) {
            err = None;
        }

        if copied > 0 {
            if !peek
                && core.peer_shutdown.contains(ShutdownFlags::SEND)
                && core.stream_has_data() == 0
            {
                // the other side finished sending and we just drained the
                // last byte: the conversation is over
                core.state = State::Unconnected;
                core.done = true;
                sk.wake_all();
            }

            return Ok(copied);
        }

        match err {
            Some(err) => Err(err),
            // end of stream
            None => Ok(0),
        }
    }

    /// Shut down one or both directions. Idempotent: the bits OR-fold.
    pub fn shutdown(&self, sk: &Arc<VsockSocket<X>>, mode: ShutdownFlags) -> Result<(), ShutdownError> {
        if mode.is_empty() {
            return Err(ShutdownError::Invalid);
        }

        let mut core = sk.lock();

        // A socket that drained to the end of an orderly conversation is no
        // longer in the connected state but may still owe the peer its own
        // shutdown notice.
        let was_connected = matches!(
            core.state,
            State::Connecting | State::Connected | State::Disconnecting
        ) || core.done;
        if !was_connected {
            return Err(ShutdownError::NotConnected);
        }

        core.shutdown |= mode;
        sk.wake_all();

        core.done = false;
        // Tell the peer; a lost shutdown notification degrades to the peer
        // discovering it via the queue pair, so the send result is not
        // surfaced.
        let _ = self.send_to(
            &core,
            PacketType::Shutdown,
            Payload::Mode(mode.bits() as u64),
            ProtoFlags::empty(),
        );

        Ok(())
    }

    /// Readiness mask for the socket.
    pub fn poll(&self, sk: &Arc<VsockSocket<X>>) -> PollEvents {
        let mut core = sk.lock();
        let mut mask = PollEvents::empty();

        if core.err.is_some() {
            mask |= PollEvents::ERR;
        }

        // local write shutdown plus peer write shutdown reads as hangup
        if core.shutdown == ShutdownFlags::BOTH
            || (core.shutdown.contains(ShutdownFlags::SEND)
                && core.peer_shutdown.contains(ShutdownFlags::SEND))
        {
            mask |= PollEvents::HUP;
        }

        if core.shutdown.contains(ShutdownFlags::RCV)
            || core.peer_shutdown.contains(ShutdownFlags::SEND)
        {
            mask |= PollEvents::RDHUP;
        }

        // a listener with queued connections is readable
        if core.state == State::Listen && !core.accept_queue.is_empty() {
            mask |= PollEvents::IN | PollEvents::RDNORM;
        }

        if !core.qp_handle.is_invalid() && !core.shutdown.contains(ShutdownFlags::RCV) {
            match with_notify_ctx(&self.deps, &mut core, |notify, ctx| notify.poll_in(ctx, 1))
                .unwrap_or(Ok(false))
            {
                Ok(true) => mask |= PollEvents::IN | PollEvents::RDNORM,
                Ok(false) => {}
                Err(_) => mask |= PollEvents::ERR,
            }
        }

        // closed, reset or terminated also reads as readable
        if core.shutdown.contains(ShutdownFlags::RCV)
            || core.peer_shutdown.contains(ShutdownFlags::SEND)
        {
            mask |= PollEvents::IN | PollEvents::RDNORM;
        }

        if core.state == State::Connected && !core.shutdown.contains(ShutdownFlags::SEND) {
            match with_notify_ctx(&self.deps, &mut core, |notify, ctx| notify.poll_out(ctx, 1))
                .unwrap_or(Ok(false))
            {
                Ok(true) => mask |= PollEvents::OUT | PollEvents::WRNORM,
                Ok(false) => {}
                Err(_) => mask |= PollEvents::ERR,
            }
        }

        // post-close writability, as INET sockets report it
        if core.state == State::Unconnected && !core.shutdown.contains(ShutdownFlags::SEND) {
            mask |= PollEvents::OUT | PollEvents::WRNORM;
        }

        mask
    }

    /// Release the socket: unlink it from every table, tear down never-
    /// accepted children, and drop the substrate resources. Further use of
    /// the handle yields `NotConnected`-class errors.
    pub fn close(&self, sk: &Arc<VsockSocket<X>>) {
        use std::sync::atomic::Ordering;

        let mut core = sk.lock();

        {
            let mut tables = self.tables();
            if sk.in_bound_table.load(Ordering::Relaxed) {
                tables.remove_bound(core.local.port, sk);
            }
            if sk.in_connected_table.load(Ordering::Relaxed) {
                tables.remove_connected(core.remote, core.local.port, sk);
            }
        }

        core.shutdown = ShutdownFlags::BOTH;

        // children that completed the handshake but were never accepted
        while let Some(child) = listener::dequeue_accept(&mut core) {
            self.close(&child);
        }

        core.state = State::Free;
        self.destruct(&mut core);
        drop(core);

        sk.wake_all();
    }

    /// The socket's bound address.
    pub fn local_addr(&self, sk: &Arc<VsockSocket<X>>) -> Addr {
        sk.lock().local
    }

    /// The peer's address; only meaningful once connected.
    pub fn peer_addr(&self, sk: &Arc<VsockSocket<X>>) -> Result<Addr, AddrGetError> {
        let core = sk.lock();
        if !matches!(core.state, State::Connected | State::Disconnecting) {
            return Err(AddrGetError::NotConnected);
        }
        Ok(core.remote)
    }

    // socket options

    /// Set the desired ring size, widening the acceptable range to include
    /// it.
    pub fn set_buffer_size(&self, sk: &Arc<VsockSocket<X>>, val: u64) {
        let mut core = sk.lock();
        if val < core.qp_min {
            core.qp_min = val;
        }
        if val > core.qp_max {
            core.qp_max = val;
        }
        core.qp_size = val;
        debug_assert!(core.qp_min <= core.qp_size && core.qp_size <= core.qp_max);
    }

    /// Set the smallest acceptable ring size, raising the desired size if
    /// needed.
    pub fn set_buffer_min_size(&self, sk: &Arc<VsockSocket<X>>, val: u64) {
        let mut core = sk.lock();
        if val > core.qp_size {
            core.qp_size = val;
        }
        core.qp_min = val;
        debug_assert!(core.qp_min <= core.qp_size && core.qp_size <= core.qp_max);
    }

    /// Set the largest acceptable ring size, lowering the desired size if
    /// needed.
    pub fn set_buffer_max_size(&self, sk: &Arc<VsockSocket<X>>, val: u64) {
        let mut core = sk.lock();
        if val < core.qp_size {
            core.qp_size = val;
        }
        core.qp_max = val;
        debug_assert!(core.qp_min <= core.qp_size && core.qp_size <= core.qp_max);
    }

    pub fn buffer_size(&self, sk: &Arc<VsockSocket<X>>) -> u64 {
        sk.lock().qp_size
    }

    pub fn buffer_min_size(&self, sk: &Arc<VsockSocket<X>>) -> u64 {
        sk.lock().qp_min
    }

    pub fn buffer_max_size(&self, sk: &Arc<VsockSocket<X>>) -> u64 {
        sk.lock().qp_max
    }

    /// Set the connect timeout from a `(seconds, microseconds)` pair. A zero
    /// timeout restores the default.
    pub fn set_connect_timeout(
        &self,
        sk: &Arc<VsockSocket<X>>,
        secs: u64,
        micros: u32,
    ) -> Result<(), SetOptError> {
        if micros >= 1_000_000 {
            return Err(SetOptError::Range);
        }

        let timeout = X::Duration::from_secs(secs)
            .checked_add(X::Duration::from_micros(micros as u64))
            .ok_or(SetOptError::Range)?;

        let mut core = sk.lock();
        core.connect_timeout = if timeout.is_zero() {
            X::Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)
        } else {
            timeout
        };

        Ok(())
    }

    pub fn connect_timeout(&self, sk: &Arc<VsockSocket<X>>) -> (u64, u32) {
        let core = sk.lock();
        (core.connect_timeout.as_secs(), core.connect_timeout.subsec_micros())
    }
}
