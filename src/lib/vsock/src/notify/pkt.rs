//! The packet-based ("legacy") flow-control strategy.
//!
//! A blocked reader or writer tells the peer so with an explicit WAITING_READ
//! or WAITING_WRITE carrying the queue position it is waiting for; the peer
//! answers with WROTE/READ once the condition can be met. The write-notify
//! window throttles READ notifications to a fast sender: each time the peer is
//! seen blocking on a full queue the window shrinks by a page, so the
//! notification (and with it the sender's next burst) is delayed until the
//! reader has drained further.

use crate::notify::{
    ControlSend, NotifyCtx, NotifyError, NotifyOps, RecvData, SendData, MAX_DGRAM_RESENDS,
    NOTIFY_PAGE,
};
use crate::packet::{ControlPacket, PacketType, Payload, WaitingInfo};

#[derive(Debug, Default)]
pub(crate) struct PktNotify {
    write_notify_window: u64,
    write_notify_min_window: u64,
    peer_waiting_read: bool,
    peer_waiting_write: bool,
    peer_waiting_write_detected: bool,
    sent_waiting_read: bool,
    sent_waiting_write: bool,
    // The recorded positions are protocol state we must keep for the peer's
    // benefit; the notify decisions themselves currently only look at queue
    // fill levels, which keeps mixed-version endpoints compatible.
    #[allow(dead_code)]
    peer_waiting_read_info: WaitingInfo,
    #[allow(dead_code)]
    peer_waiting_write_info: WaitingInfo,
    produce_q_generation: u64,
    consume_q_generation: u64,
}

impl PktNotify {
    /// Should a waiting writer be notified now? Shrinks the notify window on
    /// the first detection of the blocked writer, then requires the free
    /// space in the consume queue to exceed `consume_size - window`.
    fn should_notify_waiting_write(&mut self, ctx: &NotifyCtx) -> bool {
        if !self.peer_waiting_write {
            return false;
        }

        if !self.peer_waiting_write_detected {
            self.peer_waiting_write_detected = true;
            if self.write_notify_window < NOTIFY_PAGE {
                self.write_notify_window = self.write_notify_min_window;
            } else {
                self.write_notify_window -= NOTIFY_PAGE;
                if self.write_notify_window < self.write_notify_min_window {
                    self.write_notify_window = self.write_notify_min_window;
                }
            }
        }

        // Expressed in free space: notify once freeSpace > consumeSize -
        // window. Equivalently: once window > bytes buffered.
        let notify_limit = ctx.consume_size - self.write_notify_window;
        let notify = ctx.qp.consume_free_space() > notify_limit;

        if notify {
            // the next block detection shrinks the window again
            self.peer_waiting_write_detected = false;
        }

        notify
    }

    /// Should a waiting reader be notified now? The recorded wait info is a
    /// hint only; any produced data is enough and stays compatible with peers
    /// that inspect the offset.
    fn should_notify_waiting_read(&self, ctx: &NotifyCtx) -> bool {
        self.peer_waiting_read && ctx.qp.produce_buf_ready() > 0
    }

    /// Tell the peer we are waiting to read `room_needed` bytes. Idempotent
    /// until the peer answers with a WROTE.
    fn send_waiting_read(&mut self, ctx: &NotifyCtx, room_needed: u64) -> bool {
        if self.sent_waiting_read {
            return true;
        }

        // A reader that has to wait grows the window back toward the full
        // queue size, undoing earlier flow-control shrinkage.
        if self.write_notify_window < ctx.consume_size {
            self.write_notify_window =
                std::cmp::min(self.write_notify_window + NOTIFY_PAGE, ctx.consume_size);
        }

        let (_tail, head) = ctx.qp.consume_indexes();
        let room_left = ctx.consume_size - head;
        let info = if room_needed >= room_left {
            WaitingInfo {
                offset: room_needed - room_left,
                generation: self.consume_q_generation.wrapping_add(1),
            }
        } else {
            WaitingInfo {
                offset: head + room_needed,
                generation: self.consume_q_generation,
            }
        };

        let sent = ctx
            .sender
            .send_ctl(PacketType::WaitingRead, Payload::Wait(info))
            .is_ok();
        if sent {
            self.sent_waiting_read = true;
        }
        sent
    }

    /// Tell the peer we are waiting for room to write `room_needed` bytes.
    /// Idempotent until the peer answers with a READ.
    fn send_waiting_write(&mut self, ctx: &NotifyCtx, room_needed: u64) -> bool {
        if self.sent_waiting_write {
            return true;
        }

        let (tail, _head) = ctx.qp.produce_indexes();
        let room_left = ctx.produce_size - tail;
        let info = if room_needed + 1 >= room_left {
            // wraps around to the current generation
            WaitingInfo {
                offset: room_needed + 1 - room_left,
                generation: self.produce_q_generation,
            }
        } else {
            WaitingInfo {
                offset: tail + room_needed + 1,
                generation: self.produce_q_generation.wrapping_sub(1),
            }
        };

        let sent = ctx
            .sender
            .send_ctl(PacketType::WaitingWrite, Payload::Wait(info))
            .is_ok();
        if sent {
            self.sent_waiting_write = true;
        }
        sent
    }

    /// Notify a waiting writer that we have read, retrying on transient send
    /// failure up to the resend budget. Exhausting the budget is logged and
    /// otherwise swallowed; the peer will re-announce itself.
    fn send_read_notification(&mut self, ctx: &NotifyCtx) {
        if !self.should_notify_waiting_write(ctx) {
            return;
        }

        let mut sent = false;
        let mut retries = 0;
        while !ctx.peer_rcv_shutdown && !sent && retries < MAX_DGRAM_RESENDS {
            sent = ctx
                .sender
                .send_ctl(PacketType::Read, Payload::Size(0))
                .is_ok();
            retries += 1;
        }

        if retries >= MAX_DGRAM_RESENDS && !sent {
            log::warn!("unable to send read notification to peer");
        } else {
            self.peer_waiting_write = false;
        }
    }

    /// Notify a waiting reader that we have written, with the same retry
    /// policy as [`send_read_notification`](Self::send_read_notification).
    fn send_wrote_notification(&mut self, ctx: &NotifyCtx) {
        if !self.should_notify_waiting_read(ctx) {
            return;
        }

        let mut sent = false;
        let mut retries = 0;
        while !ctx.peer_rcv_shutdown && !sent && retries < MAX_DGRAM_RESENDS {
            sent = ctx
                .sender
                .send_ctl(PacketType::Wrote, Payload::Size(0))
                .is_ok();
            retries += 1;
        }

        if retries >= MAX_DGRAM_RESENDS && !sent {
            log::warn!("unable to send wrote notification to peer");
        } else {
            self.peer_waiting_read = false;
        }
    }
}

impl NotifyOps for PktNotify {
    fn socket_init(&mut self) {
        self.write_notify_window = NOTIFY_PAGE;
        self.write_notify_min_window = NOTIFY_PAGE;
        self.peer_waiting_read = false;
        self.peer_waiting_write = false;
        self.peer_waiting_write_detected = false;
        self.sent_waiting_read = false;
        self.sent_waiting_write = false;
        self.peer_waiting_read_info = WaitingInfo::default();
        self.peer_waiting_write_info = WaitingInfo::default();
        self.produce_q_generation = 0;
        self.consume_q_generation = 0;
    }

    fn socket_destruct(&mut self) {}

    fn poll_in(&mut self, ctx: &NotifyCtx, _target: u64) -> Result<bool, NotifyError> {
        if ctx.qp.consume_buf_ready() > 0 {
            return Ok(true);
        }

        // Nothing to read right now; ask to be notified once there is
        // something.
        if ctx.connected && !self.send_waiting_read(ctx, 1) {
            return Err(NotifyError::HostUnreach);
        }

        Ok(false)
    }

    fn poll_out(&mut self, ctx: &NotifyCtx, _target: u64) -> Result<bool, NotifyError> {
        if ctx.qp.produce_free_space() > 0 {
            return Ok(true);
        }

        // Only announce a waiting writer on a completely full queue;
        // otherwise the two sides ping-pong WAITING_WRITE/READ forever.
        if !self.send_waiting_write(ctx, 1) {
            return Err(NotifyError::HostUnreach);
        }

        Ok(false)
    }

    fn handle_notify_pkt(
        &mut self,
        ctx: &NotifyCtx,
        pkt: &ControlPacket,
        _bottom_half: bool,
    ) -> bool {
        match pkt.ty {
            PacketType::Wrote => {
                self.sent_waiting_read = false;
                true
            }
            PacketType::Read => {
                self.sent_waiting_write = false;
                true
            }
            PacketType::WaitingWrite => {
                self.peer_waiting_write = true;
                if let Payload::Wait(info) = pkt.payload {
                    self.peer_waiting_write_info = info;
                }

                if self.should_notify_waiting_write(ctx) {
                    let sent = ctx
                        .sender
                        .send_ctl(PacketType::Read, Payload::Size(0))
                        .is_ok();
                    if sent {
                        self.peer_waiting_write = false;
                    }
                }
                true
            }
            PacketType::WaitingRead => {
                self.peer_waiting_read = true;
                if let Payload::Wait(info) = pkt.payload {
                    self.peer_waiting_read_info = info;
                }

                if self.should_notify_waiting_read(ctx) {
                    let sent = ctx
                        .sender
                        .send_ctl(PacketType::Wrote, Payload::Size(0))
                        .is_ok();
                    if sent {
                        self.peer_waiting_read = false;
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn recv_init(&mut self, consume_size: u64, target: u64, data: &mut RecvData) {
        *data = RecvData::default();

        if self.write_notify_min_window < target + 1 {
            debug_assert!(target < consume_size);
            self.write_notify_min_window = target + 1;
            if self.write_notify_window < self.write_notify_min_window {
                // The current window no longer covers the new minimum; if we
                // end up blocking, first tell the sender where we now stand.
                self.write_notify_window = self.write_notify_min_window;
                data.notify_on_block = true;
            }
        }
    }

    fn recv_pre_block(
        &mut self,
        ctx: &NotifyCtx,
        target: u64,
        data: &mut RecvData,
    ) -> Result<(), NotifyError> {
        if !self.send_waiting_read(ctx, target) {
            return Err(NotifyError::HostUnreach);
        }

        if data.notify_on_block {
            self.send_read_notification(ctx);
            data.notify_on_block = false;
        }

        Ok(())
    }

    fn recv_pre_dequeue(&mut self, ctx: &NotifyCtx, data: &mut RecvData) {
        (data.produce_tail, data.consume_head) = ctx.qp.consume_indexes();
    }

    fn recv_post_dequeue(
        &mut self,
        ctx: &NotifyCtx,
        _target: u64,
        copied: u64,
        data_read: bool,
        data: &mut RecvData,
    ) {
        if !data_read {
            return;
        }

        // Wrap-around of the consume queue bumps its generation. Safe because
        // the socket lock is held across the dequeue and this check.
        if copied >= ctx.consume_size - data.consume_head {
            self.consume_q_generation = self.consume_q_generation.wrapping_add(1);
        }

        self.send_read_notification(ctx);
    }

    fn send_init(&mut self, data: &mut SendData) {
        *data = SendData::default();
    }

    fn send_pre_block(&mut self, ctx: &NotifyCtx, _data: &mut SendData) -> Result<(), NotifyError> {
        if !self.send_waiting_write(ctx, 1) {
            return Err(NotifyError::HostUnreach);
        }
        Ok(())
    }

    fn send_pre_enqueue(&mut self, ctx: &NotifyCtx, data: &mut SendData) {
        (data.produce_tail, data.consume_head) = ctx.qp.produce_indexes();
    }

    fn send_post_enqueue(&mut self, ctx: &NotifyCtx, written: u64, data: &mut SendData) {
        // Wrap-around of the produce queue bumps its generation.
        if written >= ctx.produce_size - data.produce_tail {
            self.produce_q_generation = self.produce_q_generation.wrapping_add(1);
        }

        self.send_wrote_notification(ctx);
    }

    fn process_request(&mut self, consume_size: u64) {
        self.write_notify_window = consume_size;
        if consume_size < self.write_notify_min_window {
            self.write_notify_min_window = consume_size;
        }
    }

    fn process_negotiate(&mut self, consume_size: u64) {
        self.write_notify_window = consume_size;
        if consume_size < self.write_notify_min_window {
            self.write_notify_min_window = consume_size;
        }
    }
}
