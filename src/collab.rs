//! Interfaces of the external collaborators the control core depends on.
//!
//! The ephemeris service, the guider pipeline and the guider camera live
//! outside this crate; the core only sees these traits, injected at
//! construction.

use crate::mount_control::AxisKind;
use crate::units::Degrees;
use thiserror::Error;
use tracing::info;

/// Ephemeris-side provider of the trajectory setpoint for the loaded target.
pub trait TargetSource: Send + Sync {
    /// Predicted (azimuth, elevation) of the target in the celestial frame,
    /// for the current instant.
    fn position(&self) -> (Degrees, Degrees);

    /// Whether a target (TLE, body or catalog star) is currently loaded.
    fn loaded(&self) -> bool;

    fn position_axis(&self, kind: AxisKind) -> Degrees {
        let (az, el) = self.position();
        match kind {
            AxisKind::Azimuth => az,
            AxisKind::Elevation => el,
        }
    }
}

/// No target loaded. The trajectory setpoint parks at the origin.
pub struct NoTarget;

impl TargetSource for NoTarget {
    fn position(&self) -> (Degrees, Degrees) {
        (0., 0.)
    }

    fn loaded(&self) -> bool {
        false
    }
}

/// A target fixed at one celestial position.
pub struct FixedTarget(pub Degrees, pub Degrees);

impl TargetSource for FixedTarget {
    fn position(&self) -> (Degrees, Degrees) {
        (self.0, self.1)
    }

    fn loaded(&self) -> bool {
        true
    }
}

/// Guider-side provider of the measured and configured off-axis offsets.
pub trait GuiderSource: Send + Sync {
    /// Measured object offset from the configured image center, projected
    /// onto the axis.
    fn off_axis_value(&self, kind: AxisKind) -> Degrees;

    /// Configured nominal offset for the axis.
    fn off_axis_setpoint(&self, kind: AxisKind) -> Degrees;

    fn detection_enabled(&self) -> bool;

    /// Whether the detector currently reports a non-empty keypoint set.
    fn has_detection(&self) -> bool;
}

/// Guider without a detection pipeline attached.
pub struct NoGuider;

impl GuiderSource for NoGuider {
    fn off_axis_value(&self, _kind: AxisKind) -> Degrees {
        0.
    }

    fn off_axis_setpoint(&self, _kind: AxisKind) -> Degrees {
        0.
    }

    fn detection_enabled(&self) -> bool {
        false
    }

    fn has_detection(&self) -> bool {
        false
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CameraMode {
    /// Single-frame captures; required for calibration runs.
    Still,
    Streaming,
}

#[derive(Debug, Error)]
#[error("capture failed: {0}")]
pub struct CaptureError(pub String);

/// Control surface of the guider camera used during calibration.
pub trait GuiderCamera: Send + Sync {
    fn mode(&self) -> CameraMode;

    /// Captures one calibration frame for the waypoint with the given index.
    fn capture_calibration_frame(&self, index: usize) -> Result<(), CaptureError>;
}

/// Camera stand-in that accepts captures without producing frames.
pub struct NoCamera;

impl GuiderCamera for NoCamera {
    fn mode(&self) -> CameraMode {
        CameraMode::Still
    }

    fn capture_calibration_frame(&self, index: usize) -> Result<(), CaptureError> {
        info!(index, "calibration frame requested, no camera attached");
        Ok(())
    }
}
