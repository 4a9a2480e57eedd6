//! Per-endpoint socket state.
//!
//! A socket is shared between process-context callers, the packet dispatcher,
//! and timer callbacks, so the mutable state lives behind one mutex with a
//! single condvar for every kind of waiter (readers, writers, connectors,
//! acceptors). Lookup-table membership flags sit outside the mutex; they are
//! owned by the tables lock, which nests strictly inside socket locks.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::addr::Addr;
use crate::notify::NotifyState;
use crate::qp::{QpHandle, QueuePair, SubscriptionId};
use crate::util::time::Duration as _;
use crate::{Credentials, Dependencies, StackConfig};

bitflags::bitflags! {
    /// Shutdown direction mask. Bits only ever get set, never cleared, except
    /// that a fresh `shutdown()` call clears the done flag on the socket (not
    /// the mask) before notifying the peer.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ShutdownFlags: u32 {
        const RCV = 1;
        const SEND = 2;
    }
}

impl ShutdownFlags {
    pub const BOTH: Self = Self::RCV.union(Self::SEND);
}

bitflags::bitflags! {
    /// Readiness mask returned by `poll`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const IN = 1 << 0;
        const RDNORM = 1 << 1;
        const OUT = 1 << 2;
        const WRNORM = 1 << 3;
        const ERR = 1 << 4;
        const HUP = 1 << 5;
        const RDHUP = 1 << 6;
    }
}

/// Connection state of a stream socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Freshly created, or torn down by the pending-cleanup task.
    Free,
    Unconnected,
    Listen,
    Connecting,
    Connected,
    Disconnecting,
}

/// The pending error slot (`sk_err`). A blocked caller observes this on wake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketError {
    ConnReset,
    TimedOut,
    /// The peer violated the handshake protocol.
    Protocol,
    /// The peer proposed something we cannot accept (e.g. a ring size outside
    /// our configured range).
    Invalid,
    NoMem,
    HostUnreach,
    AccessDenied,
}

/// A stream socket. Public handles are `Arc<VsockSocket<X>>`; each lookup
/// table entry, pending list entry and accept queue entry holds one more
/// strong reference.
#[derive(Debug)]
pub struct VsockSocket<X: Dependencies> {
    pub(crate) core: Mutex<StreamCore<X>>,
    pub(crate) cond: Condvar,
    /// Table membership, owned by the tables lock.
    pub(crate) in_bound_table: AtomicBool,
    pub(crate) in_connected_table: AtomicBool,
    /// Capability and identity bits are fixed at creation, so the dispatcher
    /// may read them without the socket lock.
    pub(crate) trusted: bool,
    pub(crate) owner_uid: u32,
}

impl<X: Dependencies> VsockSocket<X> {
    pub(crate) fn new(config: &StackConfig, creds: &Credentials) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(StreamCore::new(config, creds)),
            cond: Condvar::new(),
            in_bound_table: AtomicBool::new(false),
            in_connected_table: AtomicBool::new(false),
            trusted: creds.net_admin,
            owner_uid: creds.owner_uid,
        })
    }

    /// Create the server-side socket for an inbound connection request. The
    /// child inherits the listener's identity, capability bits, window
    /// configuration and connect timeout.
    pub(crate) fn new_child(parent: &VsockSocket<X>, parent_core: &StreamCore<X>) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(StreamCore::new_child(parent_core)),
            cond: Condvar::new(),
            in_bound_table: AtomicBool::new(false),
            in_connected_table: AtomicBool::new(false),
            trusted: parent.trusted,
            owner_uid: parent.owner_uid,
        })
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, StreamCore<X>> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake every waiter parked on this socket. Socket state changes are rare
    /// relative to waits, so a single condvar is enough.
    pub(crate) fn wake_all(&self) {
        self.cond.notify_all();
    }
}

/// The state guarded by the socket lock.
#[derive(Debug)]
pub(crate) struct StreamCore<X: Dependencies> {
    pub local: Addr,
    pub remote: Addr,
    pub state: State,

    pub err: Option<SocketError>,
    /// Set once the peer has cleanly finished the conversation (shutdown,
    /// reset processed as orderly, or detach). `recv` returns 0 instead of
    /// `NotConn` when this is set.
    pub done: bool,

    pub shutdown: ShutdownFlags,
    /// Peer shutdown bits are monotonic.
    pub peer_shutdown: ShutdownFlags,

    pub qp: Option<X::QueuePair>,
    pub qp_handle: QpHandle,
    pub produce_size: u64,
    pub consume_size: u64,

    /// Desired ring size and the acceptable negotiation range.
    pub qp_size: u64,
    pub qp_min: u64,
    pub qp_max: u64,

    pub connect_timeout: X::Duration,

    pub can_bind_privileged: bool,

    /// Back-reference from a pending/accept child to its listener. Weak so
    /// the listener's ownership of the child (through its lists) does not
    /// cycle.
    pub listener: Weak<VsockSocket<X>>,
    /// Children mid-handshake (listeners only).
    pub pending: Vec<Arc<VsockSocket<X>>>,
    /// Children ready for `accept` (listeners only).
    pub accept_queue: VecDeque<Arc<VsockSocket<X>>>,
    pub ack_backlog: u32,
    pub max_backlog: u32,
    /// Set by `accept` when the listener had an error; tells the cleanup task
    /// to tear the child down even though it was dequeued.
    pub rejected: bool,

    /// A legacy `REQUEST` is in flight; an `INVALID` reply makes us resend it
    /// once and ignore the stray RST that a specific peer vintage follows up
    /// with.
    pub sent_request: bool,
    pub ignore_connecting_rst: bool,

    pub detach_sub: Option<SubscriptionId>,

    /// Flow-control strategy state; bound at handshake time, absent before.
    pub notify: Option<NotifyState>,
}

impl<X: Dependencies> StreamCore<X> {
    pub fn new(config: &StackConfig, creds: &Credentials) -> Self {
        Self {
            local: Addr::ANY,
            remote: Addr::ANY,
            state: State::Free,
            err: None,
            done: false,
            shutdown: ShutdownFlags::empty(),
            peer_shutdown: ShutdownFlags::empty(),
            qp: None,
            qp_handle: QpHandle::INVALID,
            produce_size: 0,
            consume_size: 0,
            qp_size: config.qp_size,
            qp_min: config.qp_min,
            qp_max: config.qp_max,
            connect_timeout: X::Duration::from_millis(config.connect_timeout_ms),
            can_bind_privileged: creds.net_bind_service,
            listener: Weak::new(),
            pending: Vec::new(),
            accept_queue: VecDeque::new(),
            ack_backlog: 0,
            max_backlog: 0,
            rejected: false,
            sent_request: false,
            ignore_connecting_rst: false,
            detach_sub: None,
            notify: None,
        }
    }

    /// Core state for a child socket; window configuration and the connect
    /// timeout follow the listener.
    pub fn new_child(parent: &StreamCore<X>) -> Self {
        let mut child = Self::new(&StackConfig::default(), &Credentials::default());
        child.can_bind_privileged = parent.can_bind_privileged;
        child.qp_size = parent.qp_size;
        child.qp_min = parent.qp_min;
        child.qp_max = parent.qp_max;
        child.connect_timeout = parent.connect_timeout;
        child
    }

    /// Bytes ready to read. Zero when no queue pair is attached.
    pub fn stream_has_data(&self) -> u64 {
        self.qp.as_ref().map_or(0, |qp| qp.consume_buf_ready())
    }

    /// Free space to write into. Zero when no queue pair is attached.
    pub fn stream_has_space(&self) -> u64 {
        self.qp.as_ref().map_or(0, |qp| qp.produce_free_space())
    }

    /// Record an error if none is pending yet.
    pub fn set_error_if_unset(&mut self, err: SocketError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Run a closure against the bound notification strategy, or return
    /// `None` when no strategy has been selected yet (an unset ops table is a
    /// no-op). The strategy state is moved out for the duration of the call
    /// so the closure can borrow the rest of the core freely.
    pub fn with_notify<T>(
        &mut self,
        f: impl FnOnce(&mut NotifyState, &mut StreamCore<X>) -> T,
    ) -> Option<T> {
        let mut notify = self.notify.take()?;
        let rv = f(&mut notify, self);
        self.notify = Some(notify);
        Some(rv)
    }
}
