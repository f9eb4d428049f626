//! Wire types for the Fusion multi-process coordination layer
//!
//! This crate holds the parts of the coordination layer that cross process
//! boundaries byte for byte:
//!
//! - **Identifiers**: small integer newtypes naming fusionees, skirmishes,
//!   references, reactors, calls, pools, objects and shared pointers
//! - **Frames**: the binary messages exchanged between fusionees (call
//!   invocations and replies, reactor messages, lifecycle notifications)
//!
//! Frames are encoded with binrw in little-endian order behind a short
//! `"FUSN"` envelope and always fit in one local datagram.

#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod ids;

pub use error::{Result, WireError};
pub use frame::{
    CallBatch, CallFrame, CallReply, FRAME_MAGIC, FRAME_VERSION, Frame, LeaveFrame,
    MAX_FRAME_SIZE, ReactorFrame, ReplyStatus, WakeupFrame,
};
pub use ids::{
    CallFlags, CallId, FusionId, ObjectId, PoolId, ReactorId, RefId, SharedPtr, SkirmishId,
};
