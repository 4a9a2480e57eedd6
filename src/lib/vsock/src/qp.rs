//! The queue-pair substrate seam.
//!
//! The engine never owns ring memory itself; a [`Dependencies`] implementation
//! hands it attached [`QueuePair`] objects and carries its control datagrams.
//! Everything here is the vocabulary of that seam.
//!
//! [`Dependencies`]: crate::Dependencies

use crate::addr::CID_ANY;

/// Identity of a queue pair: the owning context plus a resource id within it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QpHandle {
    pub context: u32,
    pub resource: u32,
}

impl QpHandle {
    pub const INVALID: Self = Self {
        context: CID_ANY,
        resource: CID_ANY,
    };

    pub const fn new(context: u32, resource: u32) -> Self {
        Self { context, resource }
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

bitflags::bitflags! {
    /// Allocation flags for [`QueuePairRequest`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct QpFlags: u32 {
        /// Attach to an existing pair instead of creating one.
        const ATTACH_ONLY = 1 << 0;
        /// Both endpoints live in the same context.
        const LOCAL = 1 << 1;
    }
}

/// A request to allocate (or attach to) a queue pair.
#[derive(Clone, Debug)]
pub struct QueuePairRequest {
    /// `QpHandle::INVALID` lets the substrate pick the handle.
    pub handle: QpHandle,
    pub produce_size: u64,
    pub consume_size: u64,
    /// The context id of the peer endpoint.
    pub peer: u32,
    pub flags: QpFlags,
    /// Request the allocation under the socket's trusted capability. The
    /// substrate may refuse with [`QpError::NoAccess`], in which case the
    /// engine retries untrusted.
    pub trusted: bool,
}

/// Errors reported by the substrate for queue-pair and event operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QpError {
    NoAccess,
    NoMem,
    InvalidArgs,
    /// The pair named by the handle does not exist (stale offer).
    NotFound,
    /// The substrate is not available (e.g. device quiesced).
    Unavailable,
}

/// Errors from sending a control datagram. The engine treats every variant as
/// retryable inside its bounded notification-retry loops; `Unreachable` is
/// surfaced to callers where a handshake packet could not be sent at all.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendCtlError {
    /// Transient resource shortage; a retry may succeed.
    Again,
    /// The destination context cannot be reached.
    Unreachable,
}

/// Ticket for a peer-detach event subscription, returned to the substrate on
/// unsubscribe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// One direction pair of an attached shared-memory ring. "Produce" is the
/// ring this endpoint writes into, "consume" the ring it reads from; the
/// peer's view is mirrored.
///
/// All byte counts are as observed at call time; the engine serializes its
/// calls under the socket lock, and issues its own fences where a strategy
/// requires stronger ordering between a transfer and an index read.
pub trait QueuePair: Send + std::fmt::Debug + 'static {
    /// Append bytes to the produce ring. Returns the number of bytes actually
    /// enqueued, which may be short if the ring fills.
    fn enqueue(&self, buf: &[u8]) -> Result<usize, QpError>;

    /// Remove bytes from the consume ring into `buf`.
    fn dequeue(&self, buf: &mut [u8]) -> Result<usize, QpError>;

    /// Copy bytes from the consume ring without removing them.
    fn peek(&self, buf: &mut [u8]) -> Result<usize, QpError>;

    /// Bytes available for the peer to read from our produce ring.
    fn produce_buf_ready(&self) -> u64;

    /// Bytes available for us to read from our consume ring.
    fn consume_buf_ready(&self) -> u64;

    /// Free space remaining in our produce ring.
    fn produce_free_space(&self) -> u64;

    /// Free space remaining in our consume ring (i.e. room the peer still has
    /// to write).
    fn consume_free_space(&self) -> u64;

    /// `(tail, head)` indexes of the produce ring.
    fn produce_indexes(&self) -> (u64, u64);

    /// `(tail, head)` indexes of the consume ring.
    fn consume_indexes(&self) -> (u64, u64);
}
