//! Frames exchanged between fusionees
//!
//! Every frame starts with a 5-byte envelope (`"FUSN"` magic plus a version
//! byte) followed by a tag byte and the tag-specific body. All integers are
//! little-endian. A frame never exceeds [`MAX_FRAME_SIZE`] so that it always
//! fits in a single local datagram.

use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};

use crate::error::{Result, WireError};
use crate::ids::{CallFlags, CallId, FusionId, ReactorId, SharedPtr};

/// Magic bytes at the start of every frame
pub const FRAME_MAGIC: [u8; 4] = *b"FUSN";

/// Current frame format version
pub const FRAME_VERSION: u8 = 1;

/// Size of the envelope preceding the tag byte
pub const ENVELOPE_SIZE: usize = 5;

/// Largest encoded frame (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// One frame on the wire
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Invocation of a call owned by the receiver
    #[brw(magic = 1u8)]
    Call(CallFrame),
    /// Several one-way invocations flushed together
    #[brw(magic = 2u8)]
    CallBatch(CallBatch),
    /// Answer to a blocking invocation
    #[brw(magic = 3u8)]
    CallReply(CallReply),
    /// Reactor message forwarded to a listening fusionee
    #[brw(magic = 4u8)]
    Reactor(ReactorFrame),
    /// A fusionee left the world (delivered to the master)
    #[brw(magic = 5u8)]
    Leave(LeaveFrame),
    /// Unblocks a dispatch loop so it can observe a stop request
    #[brw(magic = 6u8)]
    Wakeup(WakeupFrame),
}

impl Frame {
    /// Short tag name for diagnostics
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Call(_) => "call",
            Self::CallBatch(_) => "call-batch",
            Self::CallReply(_) => "call-reply",
            Self::Reactor(_) => "reactor",
            Self::Leave(_) => "leave",
            Self::Wakeup(_) => "wakeup",
        }
    }

    /// Encode into a datagram-sized buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(ENVELOPE_SIZE + self.body_hint());
        buffer.extend_from_slice(&FRAME_MAGIC);
        buffer.push(FRAME_VERSION);

        let mut cursor = Cursor::new(buffer);
        cursor.set_position(ENVELOPE_SIZE as u64);
        self.write(&mut cursor)?;
        let buffer = cursor.into_inner();

        if buffer.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge {
                size: buffer.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(buffer)
    }

    /// Decode one complete frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        if data.len() <= ENVELOPE_SIZE {
            return Err(WireError::Truncated {
                expected: ENVELOPE_SIZE + 1,
                actual: data.len(),
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[..4]);
        if magic != FRAME_MAGIC {
            return Err(WireError::InvalidMagic(magic));
        }
        if data[4] != FRAME_VERSION {
            return Err(WireError::UnsupportedVersion {
                expected: FRAME_VERSION,
                found: data[4],
            });
        }

        let mut cursor = Cursor::new(&data[ENVELOPE_SIZE..]);
        let frame = Self::read(&mut cursor)?;
        let consumed = cursor.position() as usize;
        let body_len = data.len() - ENVELOPE_SIZE;
        if consumed != body_len {
            return Err(WireError::TrailingBytes(body_len - consumed));
        }
        Ok(frame)
    }

    fn body_hint(&self) -> usize {
        match self {
            Self::Call(call) => 48 + call.data.len(),
            Self::CallBatch(batch) => batch
                .entries
                .iter()
                .map(|entry| 48 + entry.data.len())
                .sum::<usize>(),
            Self::CallReply(reply) => 24 + reply.data.len(),
            Self::Reactor(message) => 32 + message.payload.len(),
            Self::Leave(_) | Self::Wakeup(_) => 9,
        }
    }
}

/// Invocation of a call
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// Target call
    pub call_id: CallId,
    /// Per-invocation serial; keys the reply
    pub serial: u32,
    /// Fusionee that issued the call
    pub caller: FusionId,
    /// Execution flags
    #[br(map = |bits: u32| CallFlags::from_bits_truncate(bits))]
    #[bw(map = |flags: &CallFlags| flags.bits())]
    pub flags: CallFlags,
    /// Scalar argument
    pub arg: i32,
    /// Shared pointer argument
    pub ptr: SharedPtr,
    /// Largest reply payload the caller accepts
    pub ret_size: u32,
    #[br(temp)]
    #[bw(calc = data.len() as u32)]
    data_len: u32,
    /// Variable-length input
    #[br(count = data_len)]
    pub data: Vec<u8>,
}

impl CallFrame {
    /// Whether the caller waits for a reply
    pub const fn expects_reply(&self) -> bool {
        !self.flags.contains(CallFlags::ONE_WAY)
    }
}

/// Batched one-way invocations
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallBatch {
    #[br(temp)]
    #[bw(calc = entries.len() as u16)]
    count: u16,
    /// Invocations in issue order
    #[br(count = count)]
    pub entries: Vec<CallFrame>,
}

/// Outcome carried by a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(repr = u8)]
#[bw(repr = u8)]
pub enum ReplyStatus {
    /// The handler produced a value
    Ok = 0,
    /// The call was destroyed before the handler could answer
    Destroyed = 1,
}

/// Reply to a blocking invocation
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReply {
    /// Call that was invoked
    pub call_id: CallId,
    /// Serial of the invocation being answered
    pub serial: u32,
    /// Outcome
    pub status: ReplyStatus,
    /// Handler return value
    pub value: i32,
    #[br(temp)]
    #[bw(calc = data.len() as u32)]
    data_len: u32,
    /// Variable-length output
    #[br(count = data_len)]
    pub data: Vec<u8>,
}

impl CallReply {
    /// Successful reply with an optional payload
    pub const fn ok(call_id: CallId, serial: u32, value: i32, data: Vec<u8>) -> Self {
        Self {
            call_id,
            serial,
            status: ReplyStatus::Ok,
            value,
            data,
        }
    }

    /// Reply signalling that the call no longer exists
    pub const fn destroyed(call_id: CallId, serial: u32) -> Self {
        Self {
            call_id,
            serial,
            status: ReplyStatus::Destroyed,
            value: 0,
            data: Vec::new(),
        }
    }
}

/// Reactor message forwarded to a remote listener
#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorFrame {
    /// Reactor the message belongs to
    pub reactor_id: ReactorId,
    /// Channel within the reactor
    pub channel: i32,
    /// Dispatching fusionee
    pub sender: FusionId,
    /// Dispatch-callback countdown to tick once processed, zero for none
    pub countdown: u32,
    #[br(temp)]
    #[bw(calc = payload.len() as u32)]
    payload_len: u32,
    /// Message body
    #[br(count = payload_len)]
    pub payload: Vec<u8>,
}

/// Notification that a fusionee has left
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveFrame {
    /// Fusionee that left
    pub fusion_id: FusionId,
}

/// Wake-up for a dispatch loop
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupFrame {
    /// Fusionee being woken
    pub fusion_id: FusionId,
}
