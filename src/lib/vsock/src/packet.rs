//! The stream control packet.
//!
//! Connection management rides on a fixed-resource datagram channel; the data
//! bytes themselves never appear here, they move through the queue pair. The
//! wire format is packed little-endian and must not change shape: peers
//! predating the `REQUEST2` extension reply RST to packets whose reserved
//! fields are non-zero.

use bytes::{Buf, BufMut};

use crate::addr::{Addr, CID_ANY, CID_HYPERVISOR, PORT_ANY};
use crate::qp::QpHandle;

/// The resource id carrying stream control packets.
pub const STREAM_CONTROL_RID: u32 = 1;
/// Stream-to-hypervisor endpoints were added after [`STREAM_CONTROL_RID`] was
/// taken on the hypervisor side, so that direction uses a dedicated resource.
pub const HYPERVISOR_STREAM_CONTROL_RID: u32 = 15;

/// On-wire packet version. Bump only if the packet format itself changes.
pub const PACKET_VERSION: u8 = 1;

/// Size of the datagram header (source handle, destination handle, payload
/// length).
const DG_HEADER_SIZE: usize = 24;
/// Size of the discriminated payload union.
const BODY_SIZE: usize = 16;
/// Total encoded packet size.
pub const PACKET_SIZE: usize = DG_HEADER_SIZE + 16 + BODY_SIZE;

static_assertions::const_assert_eq!(PACKET_SIZE, 56);

/// The control resource a context listens on.
pub fn control_rid(cid: u32) -> u32 {
    if cid == CID_HYPERVISOR {
        HYPERVISOR_STREAM_CONTROL_RID
    } else {
        STREAM_CONTROL_RID
    }
}

/// Control packet types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Reply to a packet we do not understand.
    Invalid = 0,
    /// Connection request (legacy, implies the packet-based strategy).
    Request = 1,
    /// Size negotiation reply to [`Request`](Self::Request).
    Negotiate = 2,
    /// Client offers the allocated queue pair.
    Offer = 3,
    /// Server has attached to the offered queue pair.
    Attach = 4,
    /// Producer notification: bytes were written to the queue pair.
    Wrote = 5,
    /// Consumer notification: bytes were read from the queue pair.
    Read = 6,
    /// Abortive reset.
    Rst = 7,
    /// Orderly shutdown with a direction mask.
    Shutdown = 8,
    /// A writer is blocked waiting for queue space (strategy A only).
    WaitingWrite = 9,
    /// A reader is blocked waiting for data (strategy A only).
    WaitingRead = 10,
    /// Connection request carrying a strategy bitmask.
    Request2 = 11,
    /// Negotiation reply carrying the chosen strategy.
    Negotiate2 = 12,
}

impl PacketType {
    /// One past the last known type id.
    pub const MAX: u8 = 13;

    pub fn from_wire(raw: u8) -> Option<Self> {
        use PacketType::*;
        Some(match raw {
            0 => Invalid,
            1 => Request,
            2 => Negotiate,
            3 => Offer,
            4 => Attach,
            5 => Wrote,
            6 => Read,
            7 => Rst,
            8 => Shutdown,
            9 => WaitingWrite,
            10 => WaitingRead,
            11 => Request2,
            12 => Negotiate2,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Strategy bitmask exchanged in `REQUEST2` / `NEGOTIATE2`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ProtoFlags: u16 {
        /// The queue-state-based strategy.
        const QUEUE_STATE = 1 << 0;
    }
}

impl ProtoFlags {
    /// Every strategy this implementation can negotiate. The legacy
    /// packet-based strategy is implied by `REQUEST`/`NEGOTIATE` and has no
    /// bit.
    pub const ALL_SUPPORTED: Self = Self::QUEUE_STATE;

    /// The highest strategy bit in `self`, if any. Negotiation picks the
    /// highest bit of the client/server intersection.
    pub fn highest(self) -> Option<Self> {
        let bits = self.bits();
        if bits == 0 {
            return None;
        }
        let top = 1u16 << (15 - bits.leading_zeros() as u16);
        Self::from_bits(top)
    }
}

/// Position a blocked peer reports so the other side knows which offset it is
/// waiting to see produced or consumed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WaitingInfo {
    /// Wrap-around generation of the queue.
    pub generation: u64,
    /// Offset within the queue.
    pub offset: u64,
}

/// The discriminated packet payload. The discriminant is implied by the
/// packet type; types with no logical payload carry `Size(0)` so that the
/// reserved bytes stay zero on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Size(u64),
    Mode(u64),
    Handle(QpHandle),
    Wait(WaitingInfo),
}

/// A parsed (or to-be-sent) stream control packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlPacket {
    /// Source handle of the carrying datagram. Sent as `(CID_ANY, rid)`; the
    /// transport stamps the sender's real context id before delivery.
    pub dg_src: QpHandle,
    /// Destination handle of the carrying datagram.
    pub dg_dst: QpHandle,
    pub version: u8,
    pub ty: PacketType,
    /// Strategy bitmask; zero for every type below [`PacketType::Request2`].
    pub proto: ProtoFlags,
    pub src_port: u32,
    pub dst_port: u32,
    /// Must be zero for every type below [`PacketType::Request2`].
    pub(crate) reserved2: u32,
    pub payload: Payload,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The datagram does not contain a full packet.
    Truncated,
    /// The type id is beyond everything this implementation knows. The
    /// addresses are preserved so the dispatcher can reply `INVALID`.
    UnknownType { ty: u8, src: Addr, dst: Addr },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValidateError {
    BadAddr,
    BadVersion,
    BadReservedBytes,
    BadPayload,
}

impl ControlPacket {
    /// Build a packet from `src` to `dst`. `proto` is only carried by
    /// `REQUEST2`/`NEGOTIATE2` and is zeroed for every other type, matching
    /// what legacy peers demand of the reserved bytes.
    ///
    /// We receive on an any-CID control handle, so the datagram source is
    /// always `(CID_ANY, rid)` with the rid chosen by the *local* context.
    pub fn new(
        src: Addr,
        dst: Addr,
        local_cid: u32,
        ty: PacketType,
        payload: Payload,
        proto: ProtoFlags,
    ) -> Self {
        let proto = match ty {
            PacketType::Request2 | PacketType::Negotiate2 => proto,
            _ => ProtoFlags::empty(),
        };

        Self {
            dg_src: QpHandle::new(CID_ANY, control_rid(local_cid)),
            dg_dst: QpHandle::new(dst.cid, control_rid(dst.cid)),
            version: PACKET_VERSION,
            ty,
            proto,
            src_port: src.port,
            dst_port: dst.port,
            reserved2: 0,
            payload,
        }
    }

    /// The remote address: where the packet came from, or where it is going.
    pub fn src_addr(&self) -> Addr {
        Addr::new(self.dg_src.context, self.src_port)
    }

    /// The local address the packet was addressed to.
    pub fn dst_addr(&self) -> Addr {
        Addr::new(self.dg_dst.context, self.dst_port)
    }

    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut out = [0u8; PACKET_SIZE];
        let mut buf = &mut out[..];

        buf.put_u32_le(self.dg_src.context);
        buf.put_u32_le(self.dg_src.resource);
        buf.put_u32_le(self.dg_dst.context);
        buf.put_u32_le(self.dg_dst.resource);
        buf.put_u64_le((PACKET_SIZE - DG_HEADER_SIZE) as u64);

        buf.put_u8(self.version);
        buf.put_u8(self.ty as u8);
        buf.put_u16_le(self.proto.bits());
        buf.put_u32_le(self.src_port);
        buf.put_u32_le(self.dst_port);
        buf.put_u32_le(self.reserved2);

        match self.payload {
            Payload::Size(size) => buf.put_u64_le(size),
            Payload::Mode(mode) => buf.put_u64_le(mode),
            Payload::Handle(handle) => {
                buf.put_u32_le(handle.context);
                buf.put_u32_le(handle.resource);
            }
            Payload::Wait(wait) => {
                buf.put_u64_le(wait.generation);
                buf.put_u64_le(wait.offset);
            }
        }

        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < PACKET_SIZE {
            return Err(ParseError::Truncated);
        }

        let mut buf = data;

        let dg_src = QpHandle::new(buf.get_u32_le(), buf.get_u32_le());
        let dg_dst = QpHandle::new(buf.get_u32_le(), buf.get_u32_le());
        let _dg_payload_size = buf.get_u64_le();

        let version = buf.get_u8();
        let raw_ty = buf.get_u8();
        let proto = ProtoFlags::from_bits_retain(buf.get_u16_le());
        let src_port = buf.get_u32_le();
        let dst_port = buf.get_u32_le();
        let reserved2 = buf.get_u32_le();

        let Some(ty) = PacketType::from_wire(raw_ty) else {
            return Err(ParseError::UnknownType {
                ty: raw_ty,
                src: Addr::new(dg_src.context, src_port),
                dst: Addr::new(dg_dst.context, dst_port),
            });
        };

        let payload = match ty {
            PacketType::Offer | PacketType::Attach => {
                Payload::Handle(QpHandle::new(buf.get_u32_le(), buf.get_u32_le()))
            }
            PacketType::Shutdown => Payload::Mode(buf.get_u64_le()),
            PacketType::WaitingWrite | PacketType::WaitingRead => Payload::Wait(WaitingInfo {
                generation: buf.get_u64_le(),
                offset: buf.get_u64_le(),
            }),
            _ => Payload::Size(buf.get_u64_le()),
        };

        Ok(Self {
            dg_src,
            dg_dst,
            version,
            ty,
            proto,
            src_port,
            dst_port,
            reserved2,
            payload,
        })
    }

    /// Semantic validation, applied by the dispatcher after parsing.
    pub fn validate(&self) -> Result<(), ValidateError> {
        if self.dg_src.is_invalid() || self.dg_dst.is_invalid() {
            return Err(ValidateError::BadAddr);
        }

        if self.src_port == PORT_ANY || self.dst_port == PORT_ANY {
            return Err(ValidateError::BadAddr);
        }

        if self.version != PACKET_VERSION {
            return Err(ValidateError::BadVersion);
        }

        // Peers that shipped before REQUEST2 validate these as all-zero and
        // reply RST otherwise, so we hold ourselves to the same rule.
        if (self.ty as u8) < PacketType::Request2 as u8
            && (!self.proto.is_empty() || self.reserved2 != 0)
        {
            return Err(ValidateError::BadReservedBytes);
        }

        match self.ty {
            PacketType::Invalid | PacketType::Wrote | PacketType::Read | PacketType::Rst => {
                if self.payload != Payload::Size(0) {
                    return Err(ValidateError::BadPayload);
                }
            }
            PacketType::Request
            | PacketType::Negotiate
            | PacketType::Request2
            | PacketType::Negotiate2 => {
                if self.payload == Payload::Size(0) {
                    return Err(ValidateError::BadPayload);
                }
            }
            PacketType::Offer | PacketType::Attach => {
                let Payload::Handle(handle) = self.payload else {
                    return Err(ValidateError::BadPayload);
                };
                if handle.is_invalid() {
                    return Err(ValidateError::BadPayload);
                }
            }
            PacketType::Shutdown | PacketType::WaitingWrite | PacketType::WaitingRead => {}
        }

        Ok(())
    }
}
