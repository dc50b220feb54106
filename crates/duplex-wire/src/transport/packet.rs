//! Multiplexer packets.
//!
//! After authentication every byte on the connection is a sequence of
//! frames, each sealed by the session cipher and carrying one
//! MessagePack-encoded [`Packet`]. Channel ids are allocated by the opening
//! side (odd for clients, even for servers), so both ends refer to a channel
//! by the same id and an open can never collide with one from the other side.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum encoded size of one packet.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Maximum payload carried by one data packet; larger writes are split.
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Bytes either side may send on a channel before the receiver grants more.
///
/// Data and error sub-stream bytes draw on the same window. The receiver
/// returns credit with [`Packet::WindowAdjust`] as the application reads.
pub const CHANNEL_WINDOW: u32 = 2 * 1024 * 1024;

/// Why a channel-open was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl RejectionReason {
    /// Numeric code, in the order the variants are declared (starting at 1).
    pub fn code(self) -> u32 {
        match self {
            Self::AdministrativelyProhibited => 1,
            Self::ConnectFailed => 2,
            Self::UnknownChannelType => 3,
            Self::ResourceShortage => 4,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    ChannelOpen {
        id: u32,
        kind: String,
        extra: Bytes,
    },
    ChannelOpenConfirm {
        id: u32,
    },
    ChannelOpenFailure {
        id: u32,
        reason: RejectionReason,
        message: String,
    },
    Data {
        id: u32,
        data: Bytes,
    },
    /// Data on the channel's error sub-stream.
    ExtendedData {
        id: u32,
        data: Bytes,
    },
    /// Credit returned by the receiver of a channel.
    WindowAdjust {
        id: u32,
        bytes: u32,
    },
    Eof {
        id: u32,
    },
    Close {
        id: u32,
    },
    /// Connection-level out-of-band request.
    Request {
        request_id: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
    /// Out-of-band request scoped to one channel.
    ChannelRequest {
        id: u32,
        request_id: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
    Reply {
        request_id: u32,
        ok: bool,
        payload: Bytes,
    },
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(packet)
}

pub fn decode_packet(bytes: &[u8]) -> Result<Packet, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}
