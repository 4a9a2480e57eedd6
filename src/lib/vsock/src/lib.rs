//! A VSock stream protocol engine: a connection-oriented, in-order, reliable
//! byte stream layered on a host/guest shared-memory queue-pair substrate,
//! with connection management riding on a control-datagram channel. It is
//! written as a ["sans-I/O"][sans-io] library with respect to that substrate:
//! the engine never allocates ring memory or touches a hypervisor device
//! itself. A [`Dependencies`] object supplies the current time, timers,
//! deferred work, control-datagram transmission and queue-pair allocation,
//! and the host feeds inbound control datagrams and substrate events into the
//! [`VsockStack`].
//!
//! [sans-io]: https://sans-io.readthedocs.io
//!
//! ```ignore
//! // Sketch of an embedding. `HostDeps` implements `Dependencies` against the
//! // real substrate; packets received on the stream control resource are fed
//! // to the dispatcher.
//! let stack = VsockStack::new(HostDeps::new(), StackConfig::default());
//!
//! let sk = stack.socket(Credentials::default());
//! VsockStack::connect(&stack, &sk, Addr::new(2, 5000), ConnectFlags::empty())?;
//! VsockStack::send(&stack, &sk, b"hello", SendFlags::empty())?;
//! ```
//!
//! The engine splits packet handling the way the underlying substrate demands
//! it: the datagram callback ([`VsockStack::receive_datagram`]) runs in a
//! context that must not sleep, handles pure WROTE/READ notifications on a
//! fast path when the socket lock is uncontended, and defers everything else
//! to a FIFO work queue via [`Dependencies::defer`].

#![forbid(unsafe_code)]

pub mod util;

mod addr;
mod api;
mod notify;
mod packet;
mod qp;
mod socket;
mod stack;
mod tables;

#[cfg(test)]
mod tests;

pub use addr::{
    is_privileged_port, is_stream_context, stream_reachable, Addr, CID_ANY, CID_HOST,
    CID_HYPERVISOR, CID_RESERVED, LAST_RESERVED_PORT, PORT_ANY,
};
pub use api::{ConnectFlags, RecvFlags, SendFlags};
pub use packet::{
    control_rid, ControlPacket, PacketType, ParseError, Payload, ProtoFlags, ValidateError,
    WaitingInfo, HYPERVISOR_STREAM_CONTROL_RID, PACKET_SIZE, PACKET_VERSION, STREAM_CONTROL_RID,
};
pub use qp::{QpError, QpFlags, QpHandle, QueuePair, QueuePairRequest, SendCtlError, SubscriptionId};
pub use socket::{PollEvents, ShutdownFlags, SocketError, State, VsockSocket};
pub use stack::{DispatchError, VsockStack};

/// Default ring size requested for new sockets.
pub const DEFAULT_QP_SIZE: u64 = 262144;
/// Smallest ring size a new socket will accept in negotiation.
pub const DEFAULT_QP_SIZE_MIN: u64 = 128;
/// Largest ring size a new socket will accept in negotiation.
pub const DEFAULT_QP_SIZE_MAX: u64 = 262144;
/// Default asynchronous-connect deadline.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
/// Server-side children that have not completed the handshake (or completed
/// it but were never accepted) are torn down this long after creation.
pub const PENDING_TIMEOUT_MS: u64 = 1000;

/// A collection of methods that let the engine interact with the external
/// system: the clock, a timer wheel, a FIFO work queue, and the queue-pair
/// substrate. The stack is driven from multiple threads, so implementations
/// must be shareable.
pub trait Dependencies: Send + Sync + Sized + 'static {
    type Instant: util::time::Instant<Duration = Self::Duration>;
    type Duration: util::time::Duration;
    type QueuePair: QueuePair;

    /// Get the current time.
    fn current_time(&self) -> Self::Instant;

    /// Register a timer. Used for the pending-child cleanup delay and the
    /// asynchronous-connect timeout.
    fn register_timer(&self, time: Self::Instant, f: impl FnOnce() + Send + 'static);

    /// Queue deferred work. All deferred packet work for the whole stack goes
    /// through this single queue; per-connection packet ordering relies on it
    /// being FIFO.
    fn defer(&self, f: impl FnOnce() + Send + 'static);

    /// The context id this endpoint currently has.
    fn local_cid(&self) -> u32;

    /// Whether a peer context runs with reduced privileges. Packets from a
    /// restricted context are only delivered to trusted or same-owner
    /// sockets.
    fn context_restricted(&self, cid: u32) -> bool;

    /// Whether the user named by `uid` owns the VM behind `cid`. Feeds the
    /// same-owner half of the restricted-context access check and trusted
    /// queue-pair allocation.
    fn is_context_owner(&self, cid: u32, uid: u32) -> bool;

    /// Transmit a control packet on the datagram channel. The engine builds
    /// the full packet with a wildcard source context; the substrate stamps
    /// the sender's real context id before delivery.
    fn send_control(&self, pkt: &ControlPacket) -> Result<(), SendCtlError>;

    /// Allocate or attach a queue pair (depending on `QpFlags::ATTACH_ONLY`).
    /// Returns the attached pair and its final handle.
    fn alloc_queue_pair(
        &self,
        req: QueuePairRequest,
    ) -> Result<(Self::QueuePair, QpHandle), QpError>;

    /// Release an attached queue pair.
    fn detach_queue_pair(&self, qp: Self::QueuePair);

    /// Ask to be told when the peer detaches from `handle`; the substrate
    /// reports it by calling [`VsockStack::peer_detach_event`].
    fn subscribe_peer_detach(&self, handle: QpHandle) -> Result<SubscriptionId, QpError>;

    /// Cancel a [`subscribe_peer_detach`](Self::subscribe_peer_detach)
    /// subscription.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Identity and capabilities of the caller creating a socket, captured at
/// creation time and inherited by accept()ed children.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub owner_uid: u32,
    /// Administrative capability; makes the socket trusted for restricted
    /// peers and trusted queue-pair allocation.
    pub net_admin: bool,
    /// Permission to bind ports at or below [`LAST_RESERVED_PORT`].
    pub net_bind_service: bool,
}

/// Which handshake flavour to speak, overriding what negotiation would pick.
/// Interoperability escape hatch; leave unset normally.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtoOverride {
    /// Speak the legacy REQUEST/NEGOTIATE handshake (packet-based strategy).
    Legacy,
    /// Speak REQUEST2/NEGOTIATE2 even to peers that look legacy.
    Modern,
}

/// Per-stack configuration; the per-socket values are starting points that
/// `set_buffer_*` and `set_connect_timeout` adjust per socket.
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub struct StackConfig {
    pub qp_size: u64,
    pub qp_min: u64,
    pub qp_max: u64,
    pub connect_timeout_ms: u64,
    pub proto_override: Option<ProtoOverride>,
}

impl StackConfig {
    pub fn proto_override(&mut self, over: Option<ProtoOverride>) {
        self.proto_override = over;
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            qp_size: DEFAULT_QP_SIZE,
            qp_min: DEFAULT_QP_SIZE_MIN,
            qp_max: DEFAULT_QP_SIZE_MAX,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            proto_override: None,
        }
    }
}

// errors for the public socket operations

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindError {
    /// Already bound, or the socket is in a state that cannot bind.
    Invalid,
    /// The requested CID is not this endpoint, or no ephemeral port was
    /// available.
    AddrNotAvailable,
    AddrInUse,
    /// Reserved port without the required capability.
    AccessDenied,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenError {
    /// Not bound, or not in a listenable state.
    Invalid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectError {
    /// Listening or mid-teardown; cannot connect.
    InvalidState,
    /// A previous connection attempt is still in progress.
    Already,
    IsConnected,
    /// The destination context has no stream endpoints.
    NetUnreach,
    /// Implicit autobind failed.
    Bind(BindError),
    /// The connection request could not be transmitted.
    SendFailed,
    /// Non-blocking connect started; completion is observable via `poll` and
    /// the scheduled timeout.
    InProgress,
    /// The handshake failed; carries the socket error a blocked connector
    /// observed on wake.
    Socket(SocketError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AcceptError {
    /// Not a listening socket.
    Invalid,
    WouldBlock,
    /// The listener has a pending error; the dequeued child (if any) was
    /// rejected.
    Socket(SocketError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendError {
    /// Stream closed in the sending direction (local SEND shutdown or peer
    /// RCV shutdown).
    Pipe,
    NotConnected,
    /// The socket has no remote address.
    AddrRequired,
    WouldBlock,
    /// The queue pair rejected the transfer.
    NoMem,
    /// A required flow-control notification could not be sent.
    HostUnreach,
    Socket(SocketError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecvError {
    NotConnected,
    /// The low-water target cannot fit in the receive ring, or the queue pair
    /// rejected the transfer.
    NoMem,
    WouldBlock,
    /// A required flow-control notification could not be sent.
    HostUnreach,
    Socket(SocketError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownError {
    NotConnected,
    /// Empty or out-of-range mode mask.
    Invalid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetOptError {
    /// Value outside the representable range.
    Range,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddrGetError {
    NotConnected,
}
