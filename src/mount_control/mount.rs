use crate::collab::{CameraMode, CaptureError, GuiderCamera, GuiderSource, TargetSource};
use crate::config::Config;
use crate::drive::AxisDrives;
use crate::metrics::MetricsSink;
use crate::mount_control::{
    Axis, AxisContext, AxisError, AxisKind, AxisState, AxisStatus, CommandResult, MountFrame,
};
use crate::pointing_model::{ModelError, ModelStore};
use crate::units::Degrees;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Home position in the mount frame; inside every limit envelope by
/// construction, which makes PARK the safe escape from OOL.
pub const PARK_POSITION: (Degrees, Degrees) = (0., 0.);

/// Settle after issuing a command pair, before polling axis states.
const PAIRED_COMMAND_SETTLE: Duration = Duration::from_secs(2);
const IDLE_POLL_PERIOD: Duration = Duration::from_secs(1);

pub type MountResult<T> = Result<T, MountError>;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("{axis} target {value:.4} deg outside of limits [{min:.4}, {max:.4}]")]
    OutsideLimits {
        axis: String,
        value: Degrees,
        min: Degrees,
        max: Degrees,
    },
    #[error("axes not ready: azimuth {azimuth}, elevation {elevation}")]
    NotIdle {
        azimuth: AxisState,
        elevation: AxisState,
    },
    #[error("axis commanding failed: azimuth: {azimuth}, elevation: {elevation}")]
    Command { azimuth: String, elevation: String },
    #[error("{axis} went out of limits while moving")]
    OutOfLimitsDuringMotion { axis: String },
    #[error("no target loaded")]
    NoTarget,
    #[error("guider camera must be in still mode for calibration")]
    GuiderStreaming,
    #[error("pointing model rejected: {0}")]
    Model(#[from] ModelError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

#[derive(Debug, Clone)]
pub struct MountStatus {
    pub azimuth: AxisStatus,
    pub elevation: AxisStatus,
    pub model_active: bool,
}

/// Coordinates the two axis controllers: whole-mount verbs, limit policy,
/// the pointing model and the calibration sequence.
pub struct Mount {
    azimuth: Axis,
    elevation: Axis,
    model: Arc<ModelStore>,
    target: Arc<dyn TargetSource>,
    camera: Arc<dyn GuiderCamera>,
    calibration_points: Vec<(Degrees, Degrees)>,
    calibration_settle: Duration,
    stopped: bool,
}

impl Mount {
    pub fn new(
        drives: AxisDrives,
        config: &Config,
        target: Arc<dyn TargetSource>,
        guider: Arc<dyn GuiderSource>,
        camera: Arc<dyn GuiderCamera>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, AxisError> {
        let model = Arc::new(ModelStore::new());
        let frame = MountFrame::new();
        let ctx = AxisContext {
            frame,
            model: model.clone(),
            target: target.clone(),
            guider,
            metrics,
        };

        let mut azimuth = Axis::new(
            AxisKind::Azimuth,
            drives.azimuth,
            config.azimuth.clone(),
            ctx.clone(),
        )?;
        let mut elevation = Axis::new(
            AxisKind::Elevation,
            drives.elevation,
            config.elevation.clone(),
            ctx,
        )?;
        azimuth.start();
        elevation.start();
        info!(name = %config.mount.name, "mount started");

        Ok(Self {
            azimuth,
            elevation,
            model,
            target,
            camera,
            calibration_points: config
                .mount
                .calibration_points
                .iter()
                .map(|p| (p.azimuth, p.elevation))
                .collect(),
            calibration_settle: Duration::from_secs(config.mount.calibration_settle_secs),
            stopped: false,
        })
    }

    /// Validates and activates a pointing-model coefficient set; a rejected
    /// set leaves the previous model untouched.
    pub fn set_pointing_model(&self, coefficients: &[f64]) -> MountResult<()> {
        self.model.set_coefficients(coefficients)?;
        info!("pointing model activated");
        Ok(())
    }

    pub fn clear_pointing_model(&self) {
        self.model.clear();
        info!("pointing model deactivated");
    }

    pub fn model_active(&self) -> bool {
        self.model.active()
    }

    /// Slews to a celestial position and blocks until both axes are back at
    /// IDLE.
    pub fn goto_position(&self, azimuth: Degrees, elevation: Degrees) -> MountResult<()> {
        let (mount_az, mount_el) = self.model.apply(azimuth, elevation);
        self.goto_mount(mount_az, mount_el)
    }

    /// As [`goto_position`] but the angles are already in the mount frame.
    /// Blocked by OOL: an axis out of limits is not IDLE.
    ///
    /// [`goto_position`]: Mount::goto_position
    pub fn goto_mount_position(&self, azimuth: Degrees, elevation: Degrees) -> MountResult<()> {
        self.goto_mount(azimuth, elevation)
    }

    fn goto_mount(&self, azimuth: Degrees, elevation: Degrees) -> MountResult<()> {
        self.check_within_limits(&self.azimuth, azimuth)?;
        self.check_within_limits(&self.elevation, elevation)?;
        self.require_both_idle()?;
        let response_azimuth = self.azimuth.goto_position(azimuth);
        let response_elevation = self.elevation.goto_position(elevation);
        self.complete_paired(response_azimuth, response_elevation)
    }

    /// Constant-rate rotation of both axes; rates are clamped per axis.
    pub fn goto_velocity(&self, azimuth: f64, elevation: f64) -> MountResult<()> {
        let response_azimuth = self.azimuth.goto_velocity(azimuth);
        let response_elevation = self.elevation.goto_velocity(elevation);
        thread::sleep(PAIRED_COMMAND_SETTLE);
        check_pair(response_azimuth, response_elevation)
    }

    /// Syncs both axes' position registers to the given mount-frame angles.
    pub fn set_position(&self, azimuth: Degrees, elevation: Degrees) -> MountResult<()> {
        let response_azimuth = self.azimuth.set_position(azimuth);
        let response_elevation = self.elevation.set_position(elevation);
        thread::sleep(PAIRED_COMMAND_SETTLE);
        check_pair(response_azimuth, response_elevation)
    }

    /// Hands both axes to the tracking controller. Requires a loaded target
    /// that is currently inside both limit envelopes.
    pub fn start_tracking(&self) -> MountResult<()> {
        if !self.target.loaded() {
            return Err(MountError::NoTarget);
        }
        self.require_both_idle()?;
        let (target_az, target_el) = self.target.position();
        let (mount_az, mount_el) = self.model.apply(target_az, target_el);
        self.check_within_limits(&self.azimuth, mount_az)?;
        self.check_within_limits(&self.elevation, mount_el)?;
        let response_azimuth = self.azimuth.start_tracking();
        let response_elevation = self.elevation.start_tracking();
        check_pair(response_azimuth, response_elevation)
    }

    /// Moves both axes to the home position. Valid from IDLE and from OOL.
    pub fn park(&self) -> MountResult<()> {
        info!(target = ?PARK_POSITION, "parking mount");
        let response_azimuth = self.azimuth.park();
        let response_elevation = self.elevation.park();
        self.complete_paired(response_azimuth, response_elevation)
    }

    /// Stops both axes and blocks until both reach IDLE.
    pub fn abort(&self) -> MountResult<()> {
        let response_azimuth = self.azimuth.abort();
        let response_elevation = self.elevation.abort();
        self.complete_paired(response_azimuth, response_elevation)
    }

    /// Visits the configured mount-frame waypoints, capturing a calibration
    /// frame at each after the settle delay. Blocks until the sequence
    /// completes; an abort or limit violation ends it with an error.
    pub fn calibrate(&self) -> MountResult<()> {
        if self.camera.mode() != CameraMode::Still {
            return Err(MountError::GuiderStreaming);
        }
        let waypoints = self.calibration_points.clone();
        info!(waypoints = waypoints.len(), "calibration run starting");
        for (index, (azimuth, elevation)) in waypoints.iter().enumerate() {
            info!(index, azimuth, elevation, "calibration waypoint");
            self.goto_mount(*azimuth, *elevation)?;
            thread::sleep(self.calibration_settle);
            self.camera.capture_calibration_frame(index)?;
        }
        info!("calibration run complete");
        Ok(())
    }

    /// Retunes the inner (position) loop of both axes.
    pub fn set_position_gains(&self, kp: f64, ki: f64, kd: f64) {
        self.azimuth.set_position_gains(kp, ki, kd);
        self.elevation.set_position_gains(kp, ki, kd);
    }

    pub fn status(&self) -> MountStatus {
        MountStatus {
            azimuth: self.azimuth.status(),
            elevation: self.elevation.status(),
            model_active: self.model.active(),
        }
    }

    pub fn azimuth(&self) -> &Axis {
        &self.azimuth
    }

    pub fn elevation(&self) -> &Axis {
        &self.elevation
    }

    /// Stops both axes and joins their threads. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.azimuth.stop();
        self.elevation.stop();
        self.stopped = true;
        info!("mount stopped");
    }

    /// Strictly-inside check against an axis' soft limits: the limit values
    /// themselves are rejected.
    fn check_within_limits(&self, axis: &Axis, value: Degrees) -> MountResult<()> {
        let settings = axis.settings();
        if value <= settings.limit_min || value >= settings.limit_max {
            return Err(MountError::OutsideLimits {
                axis: axis.name().to_string(),
                value,
                min: settings.limit_min,
                max: settings.limit_max,
            });
        }
        Ok(())
    }

    fn require_both_idle(&self) -> MountResult<()> {
        let (azimuth, elevation) = (self.azimuth.state(), self.elevation.state());
        if azimuth == AxisState::Idle && elevation == AxisState::Idle {
            Ok(())
        } else {
            Err(MountError::NotIdle { azimuth, elevation })
        }
    }

    fn complete_paired(
        &self,
        response_azimuth: CommandResult,
        response_elevation: CommandResult,
    ) -> MountResult<()> {
        thread::sleep(PAIRED_COMMAND_SETTLE);
        check_pair(response_azimuth, response_elevation)?;
        self.wait_until_both_idle()
    }

    /// Cooperative wait: one axis can reach IDLE while the other is still
    /// moving; both must be observed at IDLE before the command is released.
    fn wait_until_both_idle(&self) -> MountResult<()> {
        loop {
            let (azimuth, elevation) = (self.azimuth.state(), self.elevation.state());
            if azimuth == AxisState::Idle && elevation == AxisState::Idle {
                return Ok(());
            }
            for (axis, state) in [(&self.azimuth, azimuth), (&self.elevation, elevation)] {
                if state == AxisState::OutOfLimits {
                    warn!(axis = %axis.name(), "axis hit its limits mid-command");
                    return Err(MountError::OutOfLimitsDuringMotion {
                        axis: axis.name().to_string(),
                    });
                }
            }
            thread::sleep(IDLE_POLL_PERIOD);
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_pair(
    response_azimuth: CommandResult,
    response_elevation: CommandResult,
) -> MountResult<()> {
    if response_azimuth.is_success() && response_elevation.is_success() {
        Ok(())
    } else {
        Err(MountError::Command {
            azimuth: describe(&response_azimuth),
            elevation: describe(&response_elevation),
        })
    }
}

fn describe(result: &CommandResult) -> String {
    if result.is_success() {
        "ok".to_string()
    } else {
        result.message.clone()
    }
}
