use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a worker slot is in its lease cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Leasing,
    Processing,
    Acking,
    Failing,
    Stopped,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotState::Leasing,
            2 => SlotState::Processing,
            3 => SlotState::Acking,
            4 => SlotState::Failing,
            5 => SlotState::Stopped,
            _ => SlotState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SlotState::Idle => 0,
            SlotState::Leasing => 1,
            SlotState::Processing => 2,
            SlotState::Acking => 3,
            SlotState::Failing => 4,
            SlotState::Stopped => 5,
        }
    }

    /// A slot that may be holding a lease.
    pub fn is_busy(self) -> bool {
        !matches!(self, SlotState::Idle | SlotState::Stopped)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Idle => "idle",
            SlotState::Leasing => "leasing",
            SlotState::Processing => "processing",
            SlotState::Acking => "acking",
            SlotState::Failing => "failing",
            SlotState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Shared view of one slot's state.
#[derive(Debug, Default)]
pub struct SlotHandle {
    state: AtomicU8,
}

impl SlotHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: SlotState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}
