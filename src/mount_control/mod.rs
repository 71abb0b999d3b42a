mod axis;
mod mount;
pub mod pid;

pub use axis::{Axis, AxisContext, AxisError, AxisStatus};
pub use mount::{Mount, MountError, MountResult, MountStatus, PARK_POSITION};

use crate::units::Degrees;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One rotational degree of freedom of the mount.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AxisKind {
    Azimuth,
    Elevation,
}

/// Per-axis finite state machine states.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum AxisState {
    #[default]
    Idle,
    GotoPosition,
    GotoVelocity,
    Abort,
    Track,
    OutOfLimits,
    Park,
}

impl AxisState {
    pub fn as_str(self) -> &'static str {
        match self {
            AxisState::Idle => "IDLE",
            AxisState::GotoPosition => "GOTO_POSITION",
            AxisState::GotoVelocity => "GOTO_VELOCITY",
            AxisState::Abort => "ABORT",
            AxisState::Track => "TRACK",
            AxisState::OutOfLimits => "OOL",
            AxisState::Park => "PARK",
        }
    }
}

impl std::fmt::Display for AxisState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a command verb, returned to the caller instead of an error.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    const REJECTED: &'static str = "not in correct state or transition in progress";

    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn rejected() -> Self {
        Self::failed(Self::REJECTED)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// Last-known mount-frame angles of both axes, shared between the two
/// control loops for the celestial-frame conversion. Single-word atomic
/// cells; each loop stores its own angle and reads the pair.
#[derive(Debug, Clone, Default)]
pub struct MountFrame {
    cells: Arc<FrameCells>,
}

#[derive(Debug, Default)]
struct FrameCells {
    azimuth: AtomicU64,
    elevation: AtomicU64,
}

impl MountFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, kind: AxisKind, degrees: Degrees) {
        let cell = match kind {
            AxisKind::Azimuth => &self.cells.azimuth,
            AxisKind::Elevation => &self.cells.elevation,
        };
        cell.store(degrees.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> (Degrees, Degrees) {
        (
            f64::from_bits(self.cells.azimuth.load(Ordering::Relaxed)),
            f64::from_bits(self.cells.elevation.load(Ordering::Relaxed)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(AxisState::OutOfLimits.as_str(), "OOL");
        assert_eq!(AxisState::GotoPosition.to_string(), "GOTO_POSITION");
    }

    #[test]
    fn test_mount_frame_store_load() {
        let frame = MountFrame::new();
        assert_eq!(frame.load(), (0., 0.));
        frame.store(AxisKind::Azimuth, -12.5);
        frame.store(AxisKind::Elevation, 33.25);
        assert_eq!(frame.load(), (-12.5, 33.25));
    }
}
