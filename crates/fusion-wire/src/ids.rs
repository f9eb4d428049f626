//! Process-portable identifiers.
//!
//! Every primitive shared through a world is named by a small integer that
//! means the same thing in every joined process. None of these carry any
//! structure beyond uniqueness within their world.

use std::fmt;

use binrw::{BinRead, BinWrite};
use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident($inner:ty), $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Default,
            BinRead,
            BinWrite,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Raw integer value.
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Identity of one process joined to a world (a "fusionee").
    FusionId(u64),
    "fusionee"
);
define_id!(
    /// Cross-process recursive lock.
    SkirmishId(u32),
    "skirmish"
);
define_id!(
    /// Shared reference counter.
    RefId(u32),
    "ref"
);
define_id!(
    /// Publish/subscribe dispatcher.
    ReactorId(u32),
    "reactor"
);
define_id!(
    /// Remote procedure owned by one fusionee.
    CallId(u32),
    "call"
);
define_id!(
    /// Shared memory pool or object pool.
    PoolId(u32),
    "pool"
);
define_id!(
    /// Object inside an object pool.
    ObjectId(u32),
    "object"
);
define_id!(
    /// Opaque handle to a block handed out by a shared memory pool.
    SharedPtr(u64),
    "ptr"
);

impl FusionId {
    /// Pseudo identity used for messages originated by the world itself,
    /// such as reference watch notifications.
    pub const WORLD: Self = Self(0);

    /// Reserved identity of the first joiner.
    pub const MASTER: Self = Self(1);

    /// Whether this is the reserved master identity.
    pub const fn is_master(self) -> bool {
        self.0 == Self::MASTER.0
    }
}

impl SharedPtr {
    /// The null handle; never returned by an allocator.
    pub const NULL: Self = Self(0);

    /// Whether this handle is null.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Flags accepted by call execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallFlags(u32);

impl CallFlags {
    /// Blocking call, executed in-line when the caller owns the call.
    pub const NONE: Self = Self(0);
    /// Do not wait for a reply.
    pub const ONE_WAY: Self = Self(0x1);
    /// Never run the handler in-line, even when the caller is the owner.
    pub const NO_DIRECT: Self = Self(0x2);
    /// Accumulate one-way calls from the calling thread and flush them in a batch.
    pub const QUEUE: Self = Self(0x4);

    /// Construct from raw bits, dropping unknown ones.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    /// Raw bit value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for CallFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_fusion_ids() {
        assert!(FusionId::MASTER.is_master());
        assert!(!FusionId::WORLD.is_master());
        assert!(!FusionId(7).is_master());
    }

    #[test]
    fn test_display() {
        assert_eq!(FusionId(3).to_string(), "fusionee#3");
        assert_eq!(SkirmishId(12).to_string(), "skirmish#12");
        assert_eq!(CallId(1).to_string(), "call#1");
    }

    #[test]
    fn test_call_flags() {
        let flags = CallFlags::ONE_WAY | CallFlags::QUEUE;
        assert!(flags.contains(CallFlags::ONE_WAY));
        assert!(flags.contains(CallFlags::QUEUE));
        assert!(!flags.contains(CallFlags::NO_DIRECT));
        assert!(flags.contains(CallFlags::NONE));
        assert_eq!(CallFlags::from_bits_truncate(0xFF).bits(), 0x7);
    }

    #[test]
    fn test_null_ptr() {
        assert!(SharedPtr::NULL.is_null());
        assert!(!SharedPtr(9).is_null());
    }
}
