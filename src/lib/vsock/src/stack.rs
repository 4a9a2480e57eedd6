//! The stack: packet dispatch and the per-socket connection state machine.
//!
//! Inbound control datagrams arrive through [`VsockStack::receive_datagram`],
//! which runs in the substrate's delivery context and must not sleep. It
//! routes the packet to a socket, lets the notification strategy handle pure
//! WROTE/READ traffic on a fast path when the socket lock is free, and defers
//! everything else to the FIFO work queue, where the packet is re-dispatched
//! by the socket's state with the socket lock held.
//!
//! Timer-driven pieces live here too: the pending-child cleanup that reaps
//! handshakes the peer abandoned, and the detach/resume events the substrate
//! reports.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::addr::{self, Addr, CID_HYPERVISOR};
use crate::notify::{select_strategy, ControlSend, NotifyCtx, NotifyOps};
use crate::packet::{
    control_rid, ControlPacket, PacketType, ParseError, Payload, ProtoFlags, PACKET_SIZE,
};
use crate::qp::{QpError, QpFlags, QpHandle, QueuePairRequest, SendCtlError};
use crate::socket::{ShutdownFlags, SocketError, State, StreamCore, VsockSocket};
use crate::tables::{listener, Tables};
use crate::util::time::Duration as _;
use crate::{Credentials, Dependencies, ProtoOverride, StackConfig, PENDING_TIMEOUT_MS};

/// Why the dispatcher refused an inbound datagram. The dispatcher recovers
/// locally: the reply (RST or INVALID) has already been sent where one was
/// warranted, and nothing is surfaced to any socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// Source context has no stream endpoints, wrong source resource, or the
    /// destination socket failed the restricted-context access check.
    NoAccess,
    /// Truncated or malformed packet.
    InvalidArgs,
    /// No socket matched the destination address.
    NotFound,
}

/// The protocol engine. One instance per endpoint; shared behind an `Arc` so
/// timers and deferred work can reach it.
#[derive(Debug)]
pub struct VsockStack<X: Dependencies> {
    pub(crate) deps: X,
    pub(crate) config: StackConfig,
    pub(crate) tables: Mutex<Tables<X>>,
}

/// Packet sink handed to the notification strategies, with the socket's
/// current addresses baked in.
pub(crate) struct SocketSender<'a, X: Dependencies> {
    deps: &'a X,
    local: Addr,
    remote: Addr,
}

impl<'a, X: Dependencies> SocketSender<'a, X> {
    pub(crate) fn new(deps: &'a X, core: &StreamCore<X>) -> Self {
        Self {
            deps,
            local: core.local,
            remote: core.remote,
        }
    }
}

impl<X: Dependencies> ControlSend for SocketSender<'_, X> {
    fn send_ctl(&self, ty: PacketType, payload: Payload) -> Result<(), SendCtlError> {
        let pkt = ControlPacket::new(
            self.local,
            self.remote,
            self.deps.local_cid(),
            ty,
            payload,
            ProtoFlags::empty(),
        );
        self.deps.send_control(&pkt)
    }
}

/// Borrow the pieces of a socket that a notification hook needs. `None` when
/// no queue pair is attached (in which case no hook that needs one runs).
pub(crate) fn notify_ctx<'a, X: Dependencies>(
    core: &'a StreamCore<X>,
    sender: &'a SocketSender<'a, X>,
) -> Option<NotifyCtx<'a>> {
    let qp = core.qp.as_ref()?;
    Some(NotifyCtx {
        qp,
        consume_size: core.consume_size,
        produce_size: core.produce_size,
        peer_rcv_shutdown: core.peer_shutdown.contains(ShutdownFlags::RCV),
        connected: core.state == State::Connected,
        sender,
    })
}

/// Run a notification hook that needs a queue-pair context. `None` when the
/// socket has no strategy bound or no queue pair attached (the hook is then a
/// no-op, like an unset ops table).
pub(crate) fn with_notify_ctx<X: Dependencies, T>(
    deps: &X,
    core: &mut StreamCore<X>,
    f: impl FnOnce(&mut crate::notify::NotifyState, &NotifyCtx<'_>) -> T,
) -> Option<T> {
    core.with_notify(|notify, core| {
        let sender = SocketSender::new(deps, core);
        let ctx = notify_ctx(core, &sender)?;
        Some(f(notify, &ctx))
    })
    .flatten()
}

pub(crate) fn qp_err_to_socket(err: QpError) -> SocketError {
    match err {
        QpError::NoAccess => SocketError::AccessDenied,
        QpError::NoMem => SocketError::NoMem,
        QpError::InvalidArgs | QpError::NotFound => SocketError::Invalid,
        QpError::Unavailable => SocketError::HostUnreach,
    }
}

impl<X: Dependencies> VsockStack<X> {
    pub fn new(deps: X, config: StackConfig) -> Arc<Self> {
        Arc::new(Self {
            deps,
            config,
            tables: Mutex::new(Tables::new()),
        })
    }

    pub fn dependencies(&self) -> &X {
        &self.deps
    }

    /// Create a fresh stream socket owned by `creds`. The socket starts in
    /// the unbound bucket of the bound table.
    pub fn socket(&self, creds: Credentials) -> Arc<VsockSocket<X>> {
        let sk = VsockSocket::new(&self.config, &creds);
        self.tables().insert_unbound(&sk);
        sk
    }

    pub(crate) fn tables(&self) -> MutexGuard<'_, Tables<X>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn send_control_pkt(
        &self,
        src: Addr,
        dst: Addr,
        ty: PacketType,
        payload: Payload,
        proto: ProtoFlags,
    ) -> Result<(), SendCtlError> {
        let pkt = ControlPacket::new(src, dst, self.deps.local_cid(), ty, payload, proto);
        self.deps.send_control(&pkt)
    }

    /// Send a control packet between this socket's endpoints.
    pub(crate) fn send_to(
        &self,
        core: &StreamCore<X>,
        ty: PacketType,
        payload: Payload,
        proto: ProtoFlags,
    ) -> Result<(), SendCtlError> {
        self.send_control_pkt(core.local, core.remote, ty, payload, proto)
    }

    /// Reply RST to the source of `pkt`. Never replies to an RST, so two
    /// endpoints cannot ping-pong resets forever.
    pub(crate) fn reply_reset(&self, pkt: &ControlPacket) {
        if pkt.ty == PacketType::Rst {
            return;
        }

        if self
            .send_control_pkt(
                pkt.dst_addr(),
                pkt.src_addr(),
                PacketType::Rst,
                Payload::Size(0),
                ProtoFlags::empty(),
            )
            .is_err()
        {
            log::debug!("unable to send reset to {}", pkt.src_addr());
        }
    }

    fn reply_invalid(&self, src: Addr, dst: Addr) {
        if self
            .send_control_pkt(
                src,
                dst,
                PacketType::Invalid,
                Payload::Size(0),
                ProtoFlags::empty(),
            )
            .is_err()
        {
            log::debug!("unable to send invalid reply to {dst}");
        }
    }

    /// Restricted peers may only talk to trusted or same-owner sockets. The
    /// hypervisor is always allowed.
    fn allow_packet(&self, sk: &VsockSocket<X>, peer_cid: u32) -> bool {
        if peer_cid == CID_HYPERVISOR {
            return true;
        }

        if !self.deps.context_restricted(peer_cid) {
            return true;
        }

        sk.trusted || self.deps.is_context_owner(peer_cid, sk.owner_uid)
    }

    /// Allocate or attach a queue pair, preferring a trusted allocation when
    /// the socket has the capability for it. A trusted attempt refused by the
    /// substrate (we are running in a guest) falls back to untrusted.
    pub(crate) fn queue_pair_alloc(
        &self,
        handle: QpHandle,
        produce_size: u64,
        consume_size: u64,
        peer: u32,
        flags: QpFlags,
        trusted: bool,
    ) -> Result<(X::QueuePair, QpHandle), QpError> {
        let req = QueuePairRequest {
            handle,
            produce_size,
            consume_size,
            peer,
            flags,
            trusted,
        };

        if trusted {
            match self.deps.alloc_queue_pair(req.clone()) {
                Err(QpError::NoAccess) => {}
                other => return other,
            }
        }

        self.deps.alloc_queue_pair(QueuePairRequest {
            trusted: false,
            ..req
        })
    }

    /// Release the resources a socket holds on the substrate and reset its
    /// strategy state.
    pub(crate) fn destruct(&self, core: &mut StreamCore<X>) {
        if let Some(sub) = core.detach_sub.take() {
            self.deps.unsubscribe(sub);
        }
        if let Some(qp) = core.qp.take() {
            self.deps.detach_queue_pair(qp);
        }
        if let Some(mut notify) = core.notify.take() {
            notify.socket_destruct();
        }
        core.qp_handle = QpHandle::INVALID;
    }

    // dispatch

    /// Datagram callback for the stream control resource. Runs in the
    /// substrate's delivery context: never sleeps, never takes a contended
    /// socket lock.
    pub fn receive_datagram(self: &Arc<Self>, data: &[u8]) -> Result<(), DispatchError> {
        // Ignore packets from contexts without sockets and from resources
        // that are not stream-control endpoints.
        if data.len() < 8 {
            return Err(DispatchError::InvalidArgs);
        }
        let src_cid = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let src_rid = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if !addr::is_stream_context(src_cid) || src_rid != control_rid(src_cid) {
            return Err(DispatchError::NoAccess);
        }

        if data.len() < PACKET_SIZE {
            return Err(DispatchError::InvalidArgs);
        }

        let pkt = match ControlPacket::parse(data) {
            Ok(pkt) => pkt,
            Err(ParseError::Truncated) => return Err(DispatchError::InvalidArgs),
            Err(ParseError::UnknownType { ty, src, dst }) => {
                // A type beyond everything we know; tell the peer so newer
                // implementations can fall back.
                log::debug!("unknown control packet type {ty} from {src}");
                self.reply_invalid(dst, src);
                return Err(DispatchError::InvalidArgs);
            }
        };

        if let Err(e) = pkt.validate() {
            log::debug!("dropping malformed control packet from {}: {e:?}", pkt.src_addr());
            return Err(DispatchError::InvalidArgs);
        }

        let src = pkt.src_addr();
        let dst = pkt.dst_addr();

        // Route to a connected socket first, then to a bound listener.
        let sk = {
            let tables = self.tables();
            tables
                .find_connected(src, dst)
                .or_else(|| tables.find_bound(dst))
        };

        let Some(sk) = sk else {
            // No socket for this address: answer RST (never to an RST).
            self.reply_reset(&pkt);
            return Err(DispatchError::NotFound);
        };

        if !self.allow_packet(&sk, src.cid) {
            return Err(DispatchError::NoAccess);
        }

        // Fast path: pure notification traffic on an uncontended connected
        // socket is handled right here. Everything else goes to the work
        // queue.
        if let Ok(mut core) = sk.core.try_lock() {
            // the local context id may be out of date
            core.local.cid = dst.cid;

            if core.state == State::Connected {
                let processed = with_notify_ctx(&self.deps, &mut core, |notify, ctx| {
                    notify.handle_notify_pkt(ctx, &pkt, true)
                })
                .unwrap_or(false);

                if processed {
                    drop(core);
                    sk.wake_all();
                    return Ok(());
                }
            }
        }

        let stack = Arc::clone(self);
        self.deps.defer(move || stack.recv_pkt_work(&sk, &pkt));

        Ok(())
    }

    /// Deferred handler: the state machine proper, with the socket lock held.
    fn recv_pkt_work(self: &Arc<Self>, sk: &Arc<VsockSocket<X>>, pkt: &ControlPacket) {
        let mut core = sk.lock();

        // the local context id may be out of date
        core.local.cid = pkt.dg_dst.context;

        match core.state {
            State::Listen => self.recv_listen(sk, &mut core, pkt),
            // Server-side pending children are reached through their
            // listener, see recv_listen().
            State::Connecting => self.recv_connecting_client(sk, &mut core, pkt),
            State::Connected => self.recv_connected(sk, &mut core, pkt),
            _ => {
                // The socket closed between dispatch and this work item; let
                // the other side know so it does not hang in its handshake.
                self.reply_reset(pkt);
            }
        }
    }

    // listen state

    fn recv_listen(
        self: &Arc<Self>,
        listener_sk: &Arc<VsockSocket<X>>,
        lcore: &mut StreamCore<X>,
        pkt: &ControlPacket,
    ) {
        let src = pkt.src_addr();

        // A packet in the listen state may belong to a previous connection
        // request; look for a matching pending child first.
        let pending = lcore
            .pending
            .iter()
            .find(|child| {
                let ccore = child.lock();
                ccore.remote == src && ccore.local.port == pkt.dst_port
            })
            .cloned();

        if let Some(child) = pending {
            let failed = {
                let mut ccore = child.lock();
                ccore.local.cid = pkt.dg_dst.context;

                match ccore.state {
                    State::Connecting => self
                        .recv_connecting_server(listener_sk, lcore, &child, &mut ccore, pkt)
                        .is_err(),
                    _ => {
                        self.reply_reset(pkt);
                        true
                    }
                }
            };

            if failed && listener::remove_pending(lcore, &child).is_some() {
                lcore.ack_backlog = lcore.ack_backlog.saturating_sub(1);
            }

            return;
        }

        // The listen state only accepts connection requests.
        if !matches!(pkt.ty, PacketType::Request | PacketType::Request2) {
            self.reply_reset(pkt);
            return;
        }

        let Payload::Size(request_size) = pkt.payload else {
            self.reply_reset(pkt);
            return;
        };
        debug_assert!(request_size > 0);

        // Connection refused when the backlog is full.
        if lcore.ack_backlog >= lcore.max_backlog {
            self.reply_reset(pkt);
            return;
        }

        let child = VsockSocket::new_child(listener_sk, lcore);
        let mut ccore = child.lock();
        ccore.local = pkt.dst_addr();
        ccore.remote = src;

        // Accept the proposed ring size if it fits our range, otherwise
        // counter-propose our configured size.
        let qp_size = if request_size >= ccore.qp_min && request_size <= ccore.qp_max {
            request_size
        } else {
            ccore.qp_size
        };

        let legacy = match self.config.proto_override {
            Some(ProtoOverride::Legacy) => true,
            Some(ProtoOverride::Modern) => false,
            None => pkt.ty == PacketType::Request,
        };

        let (notify_state, reply_ty, reply_proto) = if legacy {
            (
                select_strategy(ProtoFlags::empty(), true),
                PacketType::Negotiate,
                ProtoFlags::empty(),
            )
        } else {
            // The usable strategies are the intersection of what the client
            // offers and what we support; pick the highest.
            let offered = pkt.proto & ProtoFlags::ALL_SUPPORTED;
            match offered.highest() {
                Some(chosen) => (
                    select_strategy(chosen, false),
                    PacketType::Negotiate2,
                    chosen,
                ),
                None => (None, PacketType::Negotiate2, ProtoFlags::empty()),
            }
        };

        let Some(notify_state) = notify_state else {
            self.reply_reset(pkt);
            return;
        };
        ccore.notify = Some(notify_state);

        if self
            .send_to(&ccore, reply_ty, Payload::Size(qp_size), reply_proto)
            .is_err()
        {
            self.reply_reset(pkt);
            return;
        }

        listener::add_pending(lcore, &child);
        lcore.ack_backlog += 1;

        ccore.state = State::Connecting;
        ccore.produce_size = qp_size;
        ccore.consume_size = qp_size;
        ccore.qp_size = qp_size;
        ccore.listener = Arc::downgrade(listener_sk);

        let consume_size = ccore.consume_size;
        ccore.with_notify(|notify, _| notify.process_request(consume_size));
        drop(ccore);

        // We may never hear from this peer again, and the child is not yet
        // owned by any caller, so schedule its cleanup. The task is never
        // cancelled; it holds its own references and does nothing when the
        // child was accepted in time.
        let stack = Arc::clone(self);
        let listener_sk = Arc::clone(listener_sk);
        let deadline = self.deps.current_time() + X::Duration::from_millis(PENDING_TIMEOUT_MS);
        self.deps
            .register_timer(deadline, move || stack.pending_cleanup(&listener_sk, &child));
    }

    /// Reap a pending child that did not reach the accept queue (or was
    /// dequeued but rejected) within its grace period.
    fn pending_cleanup(&self, listener_sk: &Arc<VsockSocket<X>>, child: &Arc<VsockSocket<X>>) {
        let mut lcore = listener_sk.lock();
        let mut ccore = child.lock();

        // on the pending list, in the accept queue, or on neither; never both
        debug_assert!(
            !(listener::is_pending(&lcore, child) && listener::in_accept_queue(&lcore, child))
        );

        if listener::remove_pending(&mut lcore, child).is_none() {
            if !ccore.rejected {
                // Accepted by a user process (or still in the accept queue);
                // nothing to do but drop our references.
                return;
            }
        }

        lcore.ack_backlog = lcore.ack_backlog.saturating_sub(1);

        // Make the child unreachable for inbound packets.
        if child
            .in_connected_table
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            self.tables()
                .remove_connected(ccore.remote, ccore.local.port, child);
        }

        ccore.state = State::Free;
        self.destruct(&mut ccore);
    }

    // connecting state, server side

    /// A pending server-side child can only complete via a queue-pair offer.
    /// Anything else tears the child down; the caller removes it from the
    /// pending list when this returns an error.
    fn recv_connecting_server(
        &self,
        listener_sk: &Arc<VsockSocket<X>>,
        lcore: &mut StreamCore<X>,
        child: &Arc<VsockSocket<X>>,
        ccore: &mut StreamCore<X>,
        pkt: &ControlPacket,
    ) -> Result<(), ()> {
        debug_assert_eq!(ccore.state, State::Connecting);

        let destroy = |ccore: &mut StreamCore<X>, err: SocketError| {
            ccore.err = Some(err);
            ccore.state = State::Unconnected;
            self.destruct(ccore);
        };

        let handle = match (pkt.ty, pkt.payload) {
            (PacketType::Offer, Payload::Handle(handle)) if !handle.is_invalid() => handle,
            _ => {
                self.reply_reset(pkt);
                destroy(ccore, SocketError::Protocol);
                return Err(());
            }
        };

        // To complete the connection we attach to the offered pair and send
        // an attach notification. Subscribe to the detach event first so we
        // cannot miss the peer going away.
        match self.deps.subscribe_peer_detach(handle) {
            Ok(sub) => ccore.detach_sub = Some(sub),
            Err(e) => {
                self.reply_reset(pkt);
                destroy(ccore, qp_err_to_socket(e));
                return Err(());
            }
        }

        // the local address always has a real CID here
        let is_local = ccore.remote.cid == ccore.local.cid;
        let mut flags = QpFlags::ATTACH_ONLY;
        if is_local {
            flags |= QpFlags::LOCAL;
        }
        let trusted =
            child.trusted || self.deps.is_context_owner(ccore.remote.cid, child.owner_uid);

        match self.queue_pair_alloc(
            handle,
            ccore.produce_size,
            ccore.consume_size,
            pkt.dg_src.context,
            flags,
            trusted,
        ) {
            Ok((qp, attached)) => {
                debug_assert_eq!(attached, handle);
                ccore.qp_handle = attached;
                ccore.qp = Some(qp);
            }
            Err(e) => {
                self.reply_reset(pkt);
                destroy(ccore, qp_err_to_socket(e));
                return Err(());
            }
        }

        // Move to the connected state (and table) before sending the attach:
        // a packet triggered by the peer receiving it must find the child,
        // not the listener.
        ccore.state = State::Connected;
        self.tables()
            .insert_connected(ccore.remote, ccore.local.port, child);

        if self
            .send_to(ccore, PacketType::Attach, Payload::Handle(handle), ProtoFlags::empty())
            .is_err()
        {
            self.tables()
                .remove_connected(ccore.remote, ccore.local.port, child);
            log::debug!("could not send attach to {}", ccore.remote);
            self.reply_reset(pkt);
            destroy(ccore, SocketError::HostUnreach);
            return Err(());
        }

        // We have a connection; graduate the child to the accept queue and
        // wake anyone blocked in accept() on the listener.
        listener::remove_pending(lcore, child);
        listener::enqueue_accept(lcore, child);
        listener_sk.wake_all();

        Ok(())
    }

    // connecting state, client side

    fn recv_connecting_client(
        &self,
        sk: &Arc<VsockSocket<X>>,
        core: &mut StreamCore<X>,
        pkt: &ControlPacket,
    ) {
        let result: Result<(), SocketError> = match (pkt.ty, pkt.payload) {
            (PacketType::Attach, Payload::Handle(handle)) => {
                if handle.is_invalid() || handle != core.qp_handle {
                    Err(SocketError::Protocol)
                } else {
                    // Connected; make the socket routable for inbound packets
                    // and wake the caller blocked in connect().
                    core.state = State::Connected;
                    self.tables().insert_connected(core.remote, core.local.port, sk);
                    sk.wake_all();
                    Ok(())
                }
            }
            (PacketType::Negotiate | PacketType::Negotiate2, Payload::Size(size)) => {
                let src = pkt.src_addr();
                // every negotiation slot must still be empty
                if size == 0
                    || src != core.remote
                    || !core.qp_handle.is_invalid()
                    || core.qp.is_some()
                    || core.produce_size != 0
                    || core.consume_size != 0
                    || core.detach_sub.is_some()
                {
                    Err(SocketError::Protocol)
                } else {
                    self.client_negotiate(sk, core, pkt, size)
                }
            }
            (PacketType::Invalid, _) => self.client_recv_invalid(core),
            (PacketType::Rst, _) => {
                // An old peer vintage sends a stray RST right after an
                // INVALID; if we just resent the request, swallow exactly
                // one.
                if core.ignore_connecting_rst {
                    core.ignore_connecting_rst = false;
                    Ok(())
                } else {
                    Err(SocketError::ConnReset)
                }
            }
            _ => Err(SocketError::Protocol),
        };

        if let Err(skerr) = result {
            self.reply_reset(pkt);
            core.state = State::Unconnected;
            core.err = Some(skerr);
            sk.wake_all();
        }
    }

    /// Handle a NEGOTIATE/NEGOTIATE2: verify the size, bind the strategy,
    /// allocate the queue pair and offer it to the server.
    fn client_negotiate(
        &self,
        sk: &Arc<VsockSocket<X>>,
        core: &mut StreamCore<X>,
        pkt: &ControlPacket,
        size: u64,
    ) -> Result<(), SocketError> {
        // past the point where an old peer could send its bogus RST
        core.sent_request = false;
        core.ignore_connecting_rst = false;

        if size < core.qp_min || size > core.qp_max {
            return Err(SocketError::Invalid);
        }

        let legacy = match self.config.proto_override {
            Some(ProtoOverride::Legacy) => true,
            Some(ProtoOverride::Modern) => false,
            None => pkt.ty == PacketType::Negotiate,
        };
        let proto = if legacy { ProtoFlags::empty() } else { pkt.proto };
        let Some(notify_state) = select_strategy(proto, legacy) else {
            return Err(SocketError::Invalid);
        };

        let is_local = core.remote.cid == core.local.cid;
        let flags = if is_local {
            QpFlags::LOCAL
        } else {
            QpFlags::empty()
        };
        let trusted = sk.trusted || self.deps.is_context_owner(core.remote.cid, sk.owner_uid);

        // The substrate picks the handle for us.
        let (qp, handle) = self
            .queue_pair_alloc(QpHandle::INVALID, size, size, core.remote.cid, flags, trusted)
            .map_err(qp_err_to_socket)?;

        let sub = match self.deps.subscribe_peer_detach(handle) {
            Ok(sub) => sub,
            Err(e) => {
                self.deps.detach_queue_pair(qp);
                return Err(qp_err_to_socket(e));
            }
        };

        if self
            .send_to(core, PacketType::Offer, Payload::Handle(handle), ProtoFlags::empty())
            .is_err()
        {
            self.deps.unsubscribe(sub);
            self.deps.detach_queue_pair(qp);
            return Err(SocketError::HostUnreach);
        }

        core.qp_handle = handle;
        core.qp = Some(qp);
        core.produce_size = size;
        core.consume_size = size;
        core.detach_sub = Some(sub);
        core.notify = Some(notify_state);

        let consume_size = core.consume_size;
        core.with_notify(|notify, _| notify.process_negotiate(consume_size));

        Ok(())
    }

    /// An INVALID reply to our REQUEST2 means the peer predates it; fall back
    /// to the legacy request, and arm the one-shot RST filter for the buggy
    /// vintage that follows its INVALID with a reset.
    fn client_recv_invalid(&self, core: &mut StreamCore<X>) -> Result<(), SocketError> {
        if core.sent_request {
            core.sent_request = false;
            core.ignore_connecting_rst = true;

            if self
                .send_to(
                    core,
                    PacketType::Request,
                    Payload::Size(core.qp_size),
                    ProtoFlags::empty(),
                )
                .is_err()
            {
                return Err(SocketError::HostUnreach);
            }
        }

        Ok(())
    }

    // connected state

    fn recv_connected(&self, sk: &Arc<VsockSocket<X>>, core: &mut StreamCore<X>, pkt: &ControlPacket) {
        match pkt.ty {
            PacketType::Shutdown => {
                if let Payload::Mode(mode) = pkt.payload {
                    let mode = ShutdownFlags::from_bits_truncate(mode as u32);
                    if !mode.is_empty() {
                        core.peer_shutdown |= mode;
                        sk.wake_all();
                    }
                }
            }

            PacketType::Rst => {
                // A RST in the connected state is treated like a clean
                // shutdown: the peer may have detached right after we sent it
                // something, and data can still be sitting in our consume
                // queue for the local side to drain.
                core.done = true;
                core.peer_shutdown = ShutdownFlags::BOTH;
                if core.stream_has_data() == 0 {
                    core.state = State::Disconnecting;
                }
                sk.wake_all();
            }

            _ => {
                let processed = with_notify_ctx(&self.deps, core, |notify, ctx| {
                    notify.handle_notify_pkt(ctx, pkt, false)
                })
                .unwrap_or(false);

                if processed {
                    sk.wake_all();
                } else {
                    log::debug!(
                        "unexpected control packet {:?} on connected socket {}",
                        pkt.ty,
                        core.local
                    );
                }
            }
        }
    }

    // substrate events

    /// The peer detached from the queue pair `handle`: the connection is
    /// over, but buffered data may still be drained locally.
    pub fn peer_detach_event(&self, handle: QpHandle) {
        if handle.is_invalid() {
            return;
        }

        let candidates = {
            let tables = self.tables();
            let mut v = tables.connected_sockets();
            v.extend(tables.bound_sockets());
            v
        };

        for sk in candidates {
            let mut core = sk.lock();
            if core.qp_handle == handle {
                self.handle_detach(&sk, &mut core);
            }
        }
    }

    /// The VM was resumed: queue pairs did not survive, so every connected
    /// socket sees a detach.
    pub fn queue_pairs_resumed(&self) {
        let connected = self.tables().connected_sockets();
        for sk in connected {
            let mut core = sk.lock();
            self.handle_detach(&sk, &mut core);
        }
    }

    fn handle_detach(&self, sk: &Arc<VsockSocket<X>>, core: &mut StreamCore<X>) {
        if core.qp_handle.is_invalid() {
            return;
        }

        core.done = true;
        // the peer will not be sending or receiving anymore
        core.peer_shutdown = ShutdownFlags::BOTH;

        // We should not send anymore, but we can still receive whatever is
        // left in the consume queue; the teardown below waits for the drain.
        if core.stream_has_data() == 0 {
            match core.state {
                // The peer went away mid-handshake (e.g. killed after
                // attaching); treat it like a reset.
                State::Connecting | State::Connected => {
                    core.state = State::Unconnected;
                    core.set_error_if_unset(SocketError::ConnReset);
                }
                _ => {}
            }
        }

        sk.wake_all();
    }
}
