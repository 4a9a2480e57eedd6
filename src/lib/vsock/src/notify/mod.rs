//! Flow-control notification strategies.
//!
//! Two interchangeable strategies decide when WROTE/READ (and for the legacy
//! strategy, WAITING_READ/WAITING_WRITE) control packets are emitted so the
//! peer makes forward progress without either side spinning. The strategy is
//! chosen per socket at handshake time: a legacy `REQUEST`/`NEGOTIATE`
//! handshake binds the packet-based strategy, a `REQUEST2`/`NEGOTIATE2`
//! handshake binds the highest strategy bit both sides support.
//!
//! The strategies share one operation set, invoked by the state machine and
//! the API loops at well-defined points (before/after blocking, around each
//! queue-pair transfer, near the end of request/negotiate processing).

mod pkt;
mod qstate;

pub(crate) use pkt::PktNotify;
pub(crate) use qstate::QStateNotify;

use enum_dispatch::enum_dispatch;

use crate::packet::{ControlPacket, Payload, PacketType, ProtoFlags};
use crate::qp::{QueuePair, SendCtlError};

/// How many times a notification datagram send is retried before the failure
/// is logged and swallowed. Losing a notification degrades to a timing hazard
/// only: the partner eventually emits a WAITING_* or times out.
pub(crate) const MAX_DGRAM_RESENDS: usize = 10;

/// Window adjustment step.
pub(crate) const NOTIFY_PAGE: u64 = 4096;

/// Scratch state threaded through one recv call's hook sequence.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RecvData {
    pub produce_tail: u64,
    pub consume_head: u64,
    /// Emit a READ notification the next time this recv blocks; set when
    /// raising the minimum window means the sender may be waiting on a
    /// threshold we will no longer reach.
    pub notify_on_block: bool,
}

/// Scratch state threaded through one send call's hook sequence.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SendData {
    pub produce_tail: u64,
    pub consume_head: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NotifyError {
    /// A required handshake-adjacent notification (a WAITING_*) could not be
    /// sent at all; the peer would never wake us.
    HostUnreach,
}

/// Sink for the control packets a strategy emits. Implemented by the stack
/// with the socket's current addresses baked in.
pub(crate) trait ControlSend {
    fn send_ctl(&self, ty: PacketType, payload: Payload) -> Result<(), SendCtlError>;
}

/// What a strategy needs to see of the socket while a hook runs. The strategy
/// state itself is taken out of the socket for the duration of the call, so
/// this can borrow the rest freely.
pub(crate) struct NotifyCtx<'a> {
    pub qp: &'a dyn QueuePair,
    pub consume_size: u64,
    pub produce_size: u64,
    /// Peer already said it will not receive; suppress further notifications.
    pub peer_rcv_shutdown: bool,
    /// The socket is in the connected state.
    pub connected: bool,
    pub sender: &'a dyn ControlSend,
}

/// The operation set both strategies implement. See the module docs for when
/// each hook fires.
#[enum_dispatch]
pub(crate) trait NotifyOps {
    fn socket_init(&mut self);
    fn socket_destruct(&mut self);

    /// Readable-check. When no data is ready, the strategy records that we
    /// want to be notified once there is some.
    fn poll_in(&mut self, ctx: &NotifyCtx, target: u64) -> Result<bool, NotifyError>;

    /// Writable-check. When the produce queue is full, the strategy records
    /// that we want a space notification.
    fn poll_out(&mut self, ctx: &NotifyCtx, target: u64) -> Result<bool, NotifyError>;

    /// Inbound WROTE/READ/WAITING_* on a connected socket. Returns true if
    /// the packet was fully handled (the caller then wakes the socket's
    /// waiters).
    fn handle_notify_pkt(&mut self, ctx: &NotifyCtx, pkt: &ControlPacket, bottom_half: bool)
        -> bool;

    fn recv_init(&mut self, consume_size: u64, target: u64, data: &mut RecvData);
    fn recv_pre_block(
        &mut self,
        ctx: &NotifyCtx,
        target: u64,
        data: &mut RecvData,
    ) -> Result<(), NotifyError>;
    fn recv_pre_dequeue(&mut self, ctx: &NotifyCtx, data: &mut RecvData);
    fn recv_post_dequeue(
        &mut self,
        ctx: &NotifyCtx,
        target: u64,
        copied: u64,
        data_read: bool,
        data: &mut RecvData,
    );

    fn send_init(&mut self, data: &mut SendData);
    fn send_pre_block(&mut self, ctx: &NotifyCtx, data: &mut SendData) -> Result<(), NotifyError>;
    fn send_pre_enqueue(&mut self, ctx: &NotifyCtx, data: &mut SendData);
    fn send_post_enqueue(&mut self, ctx: &NotifyCtx, written: u64, data: &mut SendData);

    /// Called near the end of connection-request processing, once the
    /// negotiated sizes are in place.
    fn process_request(&mut self, consume_size: u64);
    /// Called near the end of negotiate processing, once the negotiated sizes
    /// are in place.
    fn process_negotiate(&mut self, consume_size: u64);
}

/// Per-socket strategy state. One variant per strategy; the live variant is
/// picked by [`select_strategy`] during the handshake.
#[enum_dispatch(NotifyOps)]
#[derive(Debug)]
pub(crate) enum NotifyState {
    Pkt(PktNotify),
    QState(QStateNotify),
}

/// Map a negotiated strategy to fresh per-socket state. `legacy` is set when
/// the handshake used the original `REQUEST`/`NEGOTIATE` packets, which imply
/// the packet-based strategy. Otherwise exactly one supported strategy bit
/// must be set.
pub(crate) fn select_strategy(proto: ProtoFlags, legacy: bool) -> Option<NotifyState> {
    if legacy {
        let mut state = NotifyState::Pkt(PktNotify::default());
        state.socket_init();
        return Some(state);
    }

    if proto == ProtoFlags::QUEUE_STATE {
        let mut state = NotifyState::QState(QStateNotify::default());
        state.socket_init();
        return Some(state);
    }

    None
}
