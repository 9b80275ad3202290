// Topic descriptors
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::message::MessageKind;

/// Consume/produce mode bitmask of a topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mode(u8);

impl Mode {
    pub const NONE: Mode = Mode(0);
    pub const CONSUME: Mode = Mode(1);
    pub const PRODUCE: Mode = Mode(1 << 1);

    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

/// A logical stream of messages of a single kind. Immutable after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub kind: MessageKind,
    pub mode: Mode,
}

impl Topic {
    pub fn new(name: impl Into<String>, kind: MessageKind, mode: Mode) -> Self {
        Self {
            name: name.into(),
            kind,
            mode,
        }
    }

    pub fn consume(&self) -> bool {
        self.mode.contains(Mode::CONSUME)
    }

    pub fn produce(&self) -> bool {
        self.mode.contains(Mode::PRODUCE)
    }
}
