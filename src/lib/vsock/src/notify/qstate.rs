//! The queue-state-based flow-control strategy.
//!
//! Instead of announcing blocked readers and writers with WAITING_* packets,
//! each side infers the peer's situation from the queue indexes around its own
//! transfers: a dequeue that empties a previously-full queue means the peer's
//! writer may be blocked, an enqueue into a previously-empty queue means the
//! peer's reader may be waiting. A full memory fence between the transfer and
//! the index read keeps that inference sound against the peer's concurrent
//! ring updates.

use std::sync::atomic::{fence, Ordering};

use crate::notify::{
    ControlSend, NotifyCtx, NotifyError, NotifyOps, RecvData, SendData, MAX_DGRAM_RESENDS,
    NOTIFY_PAGE,
};
use crate::packet::{ControlPacket, PacketType, Payload};

#[derive(Debug, Default)]
pub(crate) struct QStateNotify {
    write_notify_window: u64,
    write_notify_min_window: u64,
    peer_waiting_write: bool,
    peer_waiting_write_detected: bool,
}

impl QStateNotify {
    /// Same shrinking-window throttle as the packet-based strategy: a blocked
    /// writer is a sign the sender outpaces us, so the READ notification is
    /// delayed until the queue drains below `consume_size - window`.
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

        let notify_limit = ctx.consume_size - self.write_notify_window;
        let notify = ctx.qp.consume_free_space() > notify_limit;

        if notify {
            self.peer_waiting_write_detected = false;
        }

        notify
    }

    /// A reader that finds nothing grows the window back toward the full
    /// queue size.
    fn block_update_write_window(&mut self, consume_size: u64) {
        if self.write_notify_window < consume_size {
            self.write_notify_window =
                std::cmp::min(self.write_notify_window + NOTIFY_PAGE, consume_size);
        }
    }

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
}

impl NotifyOps for QStateNotify {
    fn socket_init(&mut self) {
        self.write_notify_window = NOTIFY_PAGE;
        self.write_notify_min_window = NOTIFY_PAGE;
        self.peer_waiting_write = false;
        self.peer_waiting_write_detected = false;
    }

    fn socket_destruct(&mut self) {
        self.socket_init();
    }

    fn poll_in(&mut self, ctx: &NotifyCtx, _target: u64) -> Result<bool, NotifyError> {
        if ctx.qp.consume_buf_ready() > 0 {
            return Ok(true);
        }

        if ctx.connected {
            self.block_update_write_window(ctx.consume_size);
        }

        Ok(false)
    }

    fn poll_out(&mut self, ctx: &NotifyCtx, _target: u64) -> Result<bool, NotifyError> {
        // A full queue needs no announcement; the peer notices on its next
        // dequeue.
        Ok(ctx.qp.produce_free_space() > 0)
    }

    fn handle_notify_pkt(
        &mut self,
        _ctx: &NotifyCtx,
        pkt: &ControlPacket,
        _bottom_half: bool,
    ) -> bool {
        // WROTE wakes readers, READ wakes writers; the caller does the waking.
        // WAITING_* packets are not part of this strategy.
        matches!(pkt.ty, PacketType::Wrote | PacketType::Read)
    }

    fn recv_init(&mut self, consume_size: u64, target: u64, data: &mut RecvData) {
        *data = RecvData::default();

        if self.write_notify_min_window < target + 1 {
            debug_assert!(target < consume_size);
            self.write_notify_min_window = target + 1;
            if self.write_notify_window < self.write_notify_min_window {
                self.write_notify_window = self.write_notify_min_window;
                data.notify_on_block = true;
            }
        }
    }

    fn recv_pre_block(
        &mut self,
        ctx: &NotifyCtx,
        _target: u64,
        data: &mut RecvData,
    ) -> Result<(), NotifyError> {
        self.block_update_write_window(ctx.consume_size);

        if data.notify_on_block {
            self.send_read_notification(ctx);
            data.notify_on_block = false;
        }

        Ok(())
    }

    fn recv_pre_dequeue(&mut self, _ctx: &NotifyCtx, _data: &mut RecvData) {}

    fn recv_post_dequeue(
        &mut self,
        ctx: &NotifyCtx,
        _target: u64,
        copied: u64,
        data_read: bool,
        _data: &mut RecvData,
    ) {
        if !data_read {
            return;
        }

        fence(Ordering::SeqCst);

        // If what we just consumed is all the free space there is, the queue
        // was full before this dequeue and the peer's writer may be blocked.
        let free_space = ctx.qp.consume_free_space();
        if free_space == copied {
            self.peer_waiting_write = true;
        }

        self.send_read_notification(ctx);
    }

    fn send_init(&mut self, data: &mut SendData) {
        *data = SendData::default();
    }

    fn send_pre_block(&mut self, _ctx: &NotifyCtx, _data: &mut SendData) -> Result<(), NotifyError> {
        Ok(())
    }

    fn send_pre_enqueue(&mut self, _ctx: &NotifyCtx, _data: &mut SendData) {}

    fn send_post_enqueue(&mut self, ctx: &NotifyCtx, written: u64, _data: &mut SendData) {
        fence(Ordering::SeqCst);

        // If everything ready to read is what we just wrote, the queue was
        // empty and the peer's reader may be waiting.
        let was_empty = ctx.qp.produce_buf_ready() == written;
        if !was_empty {
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
        }
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
