use crate::collab::{GuiderSource, TargetSource};
use crate::config::{AxisSettings, ConfigError, Thresholds};
use crate::drive::params::axis_param;
use crate::drive::{Drive, DriveError};
use crate::metrics::{Field, MetricsSink};
use crate::mount_control::pid::{Pid, PidTerms};
use crate::mount_control::{AxisKind, AxisState, CommandResult, MountFrame};
use crate::periodic::PeriodicTask;
use crate::pointing_model::ModelStore;
use crate::units::{Degrees, DegreesPerSecond, Microsteps, UnitConverter};
use parking_lot::Mutex;
use retry::delay::Fixed;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Attempts for an externally issued drive command.
const COMMAND_TRIES: usize = 5;
/// Attempts for the unconditional out-of-limits stop.
const OOL_STOP_TRIES: usize = 10;
const RETRY_DELAY_MS: u64 = 500;

const VOLTAGE_CHANNEL: u8 = 8;
const TEMPERATURE_CHANNEL: u8 = 9;

#[derive(Debug, Error)]
pub enum AxisError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("axis {axis}: writing driver parameter {parameter} failed: {source}")]
    Configure {
        axis: String,
        parameter: u8,
        #[source]
        source: DriveError,
    },
}

/// Telemetry and control snapshot of one axis, published at every publish
/// tick and served to the status surface.
#[derive(Debug, Clone, Default)]
pub struct AxisStatus {
    pub state: AxisState,
    pub errors: u64,
    pub success: u64,
    pub last_error: String,
    pub last_command: String,
    pub looptime: f64,
    pub looprate: f64,
    pub pos_mount_microsteps: Microsteps,
    pub pos_mount_degrees: Degrees,
    pub pos_celestial_degrees: Degrees,
    pub pos_encoder_microsteps: Microsteps,
    pub pos_encoder_degrees: Degrees,
    pub vel_internal_microsteps: i32,
    pub vel_internal_degrees: DegreesPerSecond,
    pub driver_status_flags: u32,
    pub driver_error_flags: u32,
    pub driver_temperature: i32,
    pub driver_voltage: f64,
    pub trajectory_setpoint: Degrees,
    pub trajectory_error: Degrees,
    pub off_axis_setpoint: Degrees,
    pub off_axis_value: Degrees,
    pub off_axis_error: Degrees,
    pub on_target: bool,
    pub off_axis_on_target: bool,
    pub out_of_limits: bool,
    pub correction_active: bool,
    pub position_terms: PidTerms,
    pub off_axis_terms: PidTerms,
}

impl AxisStatus {
    /// Flat key/value record for the metrics sink.
    pub fn fields(&self) -> Vec<(&'static str, Field)> {
        vec![
            ("state", self.state.as_str().into()),
            ("errors", self.errors.into()),
            ("success", self.success.into()),
            ("last_error", self.last_error.as_str().into()),
            ("last_command", self.last_command.as_str().into()),
            ("looptime", self.looptime.into()),
            ("looprate", self.looprate.into()),
            ("pos_mount_microsteps", self.pos_mount_microsteps.into()),
            ("pos_mount_degrees", self.pos_mount_degrees.into()),
            ("pos_celestial_degrees", self.pos_celestial_degrees.into()),
            ("pos_encoder_microsteps", self.pos_encoder_microsteps.into()),
            ("pos_encoder_degrees", self.pos_encoder_degrees.into()),
            ("vel_internal_microsteps", self.vel_internal_microsteps.into()),
            ("vel_internal_degrees", self.vel_internal_degrees.into()),
            ("driver_status_flags", self.driver_status_flags.into()),
            ("driver_error_flags", self.driver_error_flags.into()),
            ("driver_temperature", self.driver_temperature.into()),
            ("driver_voltage", self.driver_voltage.into()),
            ("pos_target_degrees", self.trajectory_setpoint.into()),
            ("pos_error_degrees", self.trajectory_error.into()),
            ("off_axis_setpoint", self.off_axis_setpoint.into()),
            ("off_axis_value", self.off_axis_value.into()),
            ("off_axis_error", self.off_axis_error.into()),
            ("on_target", self.on_target.into()),
            ("off_axis_on_target", self.off_axis_on_target.into()),
            ("out_of_limits", self.out_of_limits.into()),
            ("correction_active", self.correction_active.into()),
            ("position_p", self.position_terms.p.into()),
            ("position_i", self.position_terms.i.into()),
            ("position_d", self.position_terms.d.into()),
            ("off_axis_p", self.off_axis_terms.p.into()),
            ("off_axis_i", self.off_axis_terms.i.into()),
            ("off_axis_d", self.off_axis_terms.d.into()),
        ]
    }
}

/// Collaborators shared by both axes, injected at construction.
#[derive(Clone)]
pub struct AxisContext {
    pub frame: MountFrame,
    pub model: Arc<ModelStore>,
    pub target: Arc<dyn TargetSource>,
    pub guider: Arc<dyn GuiderSource>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// State owned by the per-axis mutex: the drive client and all shared
/// mutable control state.
struct Inner {
    drive: Box<dyn Drive>,
    state: AxisState,
    next_state: AxisState,
    position_pid: Pid,
    off_axis_pid: Pid,
    previous_velocity: Microsteps,
    status: AxisStatus,
}

/// Everything the control loop needs, detached from the [`Axis`] handle so
/// the loop thread owns its own copy.
#[derive(Clone)]
struct LoopContext {
    kind: AxisKind,
    name: String,
    conv: UnitConverter,
    max_velocity: Microsteps,
    limit_min: Degrees,
    limit_max: Degrees,
    thresholds: Thresholds,
    inner: Arc<Mutex<Inner>>,
    frame: MountFrame,
    model: Arc<ModelStore>,
    target: Arc<dyn TargetSource>,
    guider: Arc<dyn GuiderSource>,
}

/// Controller of one physical axis: owns the drive client, both PID loops,
/// the state machine and the control-loop thread.
pub struct Axis {
    kind: AxisKind,
    name: String,
    settings: AxisSettings,
    conv: UnitConverter,
    max_velocity: Microsteps,
    inner: Arc<Mutex<Inner>>,
    ctx: AxisContext,
    running: Arc<AtomicBool>,
    loop_handle: Option<JoinHandle<()>>,
    poll_task: Option<PeriodicTask>,
    publish_task: Option<PeriodicTask>,
}

impl Axis {
    pub fn new(
        kind: AxisKind,
        mut drive: Box<dyn Drive>,
        settings: AxisSettings,
        ctx: AxisContext,
    ) -> Result<Self, AxisError> {
        settings.validate()?;
        let name = settings.name.clone();
        let conv = settings.gearing.converter();
        let max_velocity = settings.max_velocity()?;

        configure_drive(&name, drive.as_mut(), &settings)?;

        let position_sample = settings
            .position_loop
            .sample_period
            .unwrap_or(settings.loop_period);
        // The inner loop saturates at the configured max velocity, so its
        // integrator is bounded by the same figure in degrees/s.
        let position_windup = conv.microsteps_to_degrees(max_velocity).abs();
        let position_pid = Pid::new(
            settings.position_loop.kp,
            settings.position_loop.ki,
            settings.position_loop.kd,
            Duration::from_secs_f64(position_sample),
            position_windup,
        );
        let off_axis_pid = Pid::new(
            settings.off_axis_loop.kp,
            settings.off_axis_loop.ki,
            settings.off_axis_loop.kd,
            Duration::from_secs_f64(settings.off_axis_loop.sample_period),
            settings.off_axis_loop.windup,
        );

        let inner = Inner {
            drive,
            state: AxisState::Idle,
            next_state: AxisState::Idle,
            position_pid,
            off_axis_pid,
            previous_velocity: 0,
            status: AxisStatus::default(),
        };

        info!(axis = %name, ?kind, "axis initialised");
        Ok(Self {
            kind,
            name,
            settings,
            conv,
            max_velocity,
            inner: Arc::new(Mutex::new(inner)),
            ctx,
            running: Arc::new(AtomicBool::new(false)),
            loop_handle: None,
            poll_task: None,
            publish_task: None,
        })
    }

    /// Spawns the control-loop thread and the poll/publish timers.
    pub fn start(&mut self) {
        if self.loop_handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let loop_ctx = self.loop_context();
        let running = self.running.clone();
        let period = Duration::from_secs_f64(self.settings.loop_period);
        let handle = thread::Builder::new()
            .name(format!("{}-loop", self.name))
            .spawn(move || {
                debug!(axis = %loop_ctx.name, "control loop started");
                let mut previous_tick = None;
                while running.load(Ordering::SeqCst) {
                    run_iteration(&loop_ctx, &mut previous_tick);
                    spin_sleep::sleep(period);
                }
                debug!(axis = %loop_ctx.name, "control loop stopped");
            })
            .expect("failed to spawn control loop thread");
        self.loop_handle = Some(handle);

        let inner = self.inner.clone();
        self.poll_task = Some(PeriodicTask::spawn(
            &format!("{}-poll", self.name),
            Duration::from_secs_f64(self.settings.poll_interval),
            move || poll_telemetry(&inner),
        ));

        let inner = self.inner.clone();
        let metrics = self.ctx.metrics.clone();
        let name = self.name.clone();
        self.publish_task = Some(PeriodicTask::spawn(
            &format!("{}-publish", self.name),
            Duration::from_secs_f64(self.settings.publish_interval),
            move || {
                let status = inner.lock().status.clone();
                metrics.publish(&name, &status.fields());
            },
        ));
    }

    /// Aborts any motion and joins the control loop and timers.
    pub fn stop(&mut self) {
        if self.loop_handle.is_none() {
            return;
        }
        let _ = self.abort();
        thread::sleep(Duration::from_secs(1));
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
        self.poll_task.take();
        self.publish_task.take();
        info!(axis = %self.name, "axis stopped");
    }

    /* Command verbs. Each runs atomically under the axis mutex, retries the
     * drive transaction and advances the FSM only on success. */

    /// Syncs the drive's position registers (and the encoder) to the given
    /// mount-frame angle.
    pub fn set_position(&self, degrees: Degrees) -> CommandResult {
        let microsteps = self.conv.degrees_to_microsteps(degrees);
        // The azimuth encoder counts against the commanded direction.
        let encoder = match self.kind {
            AxisKind::Azimuth => -microsteps,
            AxisKind::Elevation => microsteps,
        };
        self.execute(
            "set_position",
            AxisState::Idle,
            |state, next| state == next && state == AxisState::Idle,
            move |drive| {
                drive.set_actual_position(microsteps)?;
                drive.set_target_position(microsteps)?;
                drive.set_axis_parameter(axis_param::ENCODER_POSITION, encoder)
            },
        )
    }

    /// Positioning move to a mount-frame angle.
    pub fn goto_position(&self, degrees: Degrees) -> CommandResult {
        let microsteps = self.conv.degrees_to_microsteps(degrees);
        self.execute(
            "goto_position",
            AxisState::GotoPosition,
            |state, next| state == next && state == AxisState::Idle,
            move |drive| drive.move_to(microsteps),
        )
    }

    /// Constant-rate rotation. Rates beyond the configured max velocity are
    /// clamped, not rejected.
    pub fn goto_velocity(&self, velocity: DegreesPerSecond) -> CommandResult {
        let microsteps = self
            .conv
            .degrees_to_microsteps(velocity)
            .clamp(-self.max_velocity, self.max_velocity);
        self.execute(
            "goto_velocity",
            AxisState::GotoVelocity,
            |state, next| {
                state == next
                    && (state == AxisState::Idle || state == AxisState::GotoVelocity)
            },
            move |drive| drive.rotate(microsteps),
        )
    }

    /// Hands the axis to the closed-loop tracking controller. No drive call;
    /// the control loop takes over on the next iteration.
    pub fn start_tracking(&self) -> CommandResult {
        let mut inner = self.inner.lock();
        inner.status.last_command = "start_tracking".to_string();
        if inner.state == inner.next_state && inner.state == AxisState::Idle {
            inner.next_state = AxisState::Track;
            info!(axis = %self.name, "tracking armed");
            CommandResult::ok()
        } else {
            CommandResult::rejected()
        }
    }

    pub fn abort(&self) -> CommandResult {
        self.execute(
            "abort",
            AxisState::Abort,
            |state, next| {
                state == next
                    && matches!(
                        state,
                        AxisState::GotoPosition
                            | AxisState::GotoVelocity
                            | AxisState::Track
                            | AxisState::Park
                    )
            },
            |drive| drive.stop(),
        )
    }

    /// Moves to the home position. The only verb accepted in OOL: home is
    /// inside every limit envelope by construction.
    pub fn park(&self) -> CommandResult {
        self.execute(
            "park",
            AxisState::Park,
            |state, next| {
                state == next
                    && (state == AxisState::Idle || state == AxisState::OutOfLimits)
            },
            |drive| drive.move_to(0),
        )
    }

    /// Retunes the inner (position) loop.
    pub fn set_position_gains(&self, kp: f64, ki: f64, kd: f64) {
        self.inner.lock().position_pid.set_gains(kp, ki, kd);
        info!(axis = %self.name, kp, ki, kd, "position loop gains updated");
    }

    pub fn state(&self) -> AxisState {
        self.inner.lock().state
    }

    pub fn status(&self) -> AxisStatus {
        self.inner.lock().status.clone()
    }

    pub fn kind(&self) -> AxisKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &AxisSettings {
        &self.settings
    }

    fn execute<F>(
        &self,
        label: &'static str,
        next_state: AxisState,
        allowed: fn(AxisState, AxisState) -> bool,
        op: F,
    ) -> CommandResult
    where
        F: Fn(&mut dyn Drive) -> Result<(), DriveError>,
    {
        let mut inner = self.inner.lock();
        inner.status.last_command = label.to_string();
        if !allowed(inner.state, inner.next_state) {
            debug!(axis = %self.name, command = label, state = %inner.state, "command rejected");
            return CommandResult::rejected();
        }

        let drive = inner.drive.as_mut();
        let result = retry::retry(
            Fixed::from_millis(RETRY_DELAY_MS).take(COMMAND_TRIES - 1),
            || {
                let r = op(&mut *drive);
                if let Err(e) = &r {
                    warn!(axis = %self.name, command = label, "drive command failed: {e} -- retrying");
                }
                r
            },
        );

        match result {
            Ok(()) => {
                inner.next_state = next_state;
                info!(axis = %self.name, command = label, next = %next_state, "command executed");
                CommandResult::ok()
            }
            Err(retry::Error::Operation { error, tries, .. }) => {
                warn!(axis = %self.name, command = label, tries, "command failed: {error}");
                CommandResult::failed(error.to_string())
            }
            Err(e) => CommandResult::failed(e.to_string()),
        }
    }

    fn loop_context(&self) -> LoopContext {
        LoopContext {
            kind: self.kind,
            name: self.name.clone(),
            conv: self.conv,
            max_velocity: self.max_velocity,
            limit_min: self.settings.limit_min,
            limit_max: self.settings.limit_max,
            thresholds: self.settings.thresholds,
            inner: self.inner.clone(),
            frame: self.ctx.frame.clone(),
            model: self.ctx.model.clone(),
            target: self.ctx.target.clone(),
            guider: self.ctx.guider.clone(),
        }
    }
}

impl Drop for Axis {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.take() {
            let _ = handle.join();
        }
    }
}

fn configure_drive(
    name: &str,
    drive: &mut dyn Drive,
    settings: &AxisSettings,
) -> Result<(), AxisError> {
    for (&parameter, &value) in &settings.axis_parameters {
        let result = retry::retry(
            Fixed::from_millis(RETRY_DELAY_MS).take(COMMAND_TRIES - 1),
            || drive.set_axis_parameter(parameter, value),
        );
        match result {
            Ok(()) => debug!(axis = %name, parameter, value, "driver parameter written"),
            Err(retry::Error::Operation { error, .. }) => {
                return Err(AxisError::Configure {
                    axis: name.to_string(),
                    parameter,
                    source: error,
                })
            }
            Err(e) => {
                return Err(AxisError::Configure {
                    axis: name.to_string(),
                    parameter,
                    source: DriveError::BadReply(e.to_string()),
                })
            }
        }
    }
    Ok(())
}

/// One pass of the control loop: telemetry, setpoints, the single state
/// latch, the state action and the limit check, all under the axis mutex.
fn run_iteration(ctx: &LoopContext, previous_tick: &mut Option<Instant>) {
    let now = Instant::now();
    let looptime = previous_tick
        .map(|p| now.duration_since(p).as_secs_f64())
        .unwrap_or(0.);
    *previous_tick = Some(now);

    let mut guard = ctx.inner.lock();
    let inner = &mut *guard;

    if looptime > 0. {
        inner.status.looptime = looptime;
        inner.status.looprate = (1000. / looptime).round() / 1000.;
    }

    read_telemetry(ctx, inner);

    let trajectory_setpoint = ctx.target.position_axis(ctx.kind);
    let off_axis_setpoint = ctx.guider.off_axis_setpoint(ctx.kind);
    let off_axis_value = ctx.guider.off_axis_value(ctx.kind);
    let trajectory_error =
        trajectory_setpoint + inner.off_axis_pid.output() - inner.status.pos_celestial_degrees;
    let off_axis_error = off_axis_setpoint - off_axis_value;

    inner.status.trajectory_setpoint = trajectory_setpoint;
    inner.status.trajectory_error = trajectory_error;
    inner.status.off_axis_setpoint = off_axis_setpoint;
    inner.status.off_axis_value = off_axis_value;
    inner.status.off_axis_error = off_axis_error;
    inner.status.on_target = trajectory_error.abs() < ctx.thresholds.trajectory_on_target;
    inner.status.off_axis_on_target = off_axis_error.abs() < ctx.thresholds.off_axis_on_target;

    // The one place the FSM advances.
    inner.state = inner.next_state;
    inner.status.state = inner.state;

    match inner.state {
        AxisState::Idle => {}
        AxisState::GotoPosition | AxisState::Park => {
            if position_reached(inner) == Some(true) {
                inner.next_state = AxisState::Idle;
            }
        }
        AxisState::GotoVelocity => {
            if is_stopped(inner) == Some(true) {
                inner.next_state = AxisState::Idle;
            }
        }
        AxisState::Abort => {
            if is_stopped(inner) == Some(true) {
                inner.position_pid.clear();
                inner.off_axis_pid.clear();
                inner.next_state = AxisState::Idle;
            }
        }
        AxisState::Track => {
            inner.off_axis_pid.setpoint = off_axis_setpoint;
            inner.off_axis_pid.update(off_axis_value);
            // With a live detection the outer loop steers the inner setpoint;
            // otherwise the ephemeris trajectory is followed open-loop.
            let setpoint = if ctx.guider.detection_enabled() && ctx.guider.has_detection() {
                trajectory_setpoint - inner.off_axis_pid.output()
            } else {
                trajectory_setpoint
            };
            inner.position_pid.setpoint = setpoint;
            let measurement = inner.status.pos_celestial_degrees;
            inner.position_pid.update(measurement);
            let output = inner.position_pid.output();
            if output.abs() > 0. {
                set_velocity(ctx, inner, output);
            }
        }
        AxisState::OutOfLimits => {
            if is_stopped(inner) == Some(false) {
                force_stop(&ctx.name, inner);
            }
        }
    }

    inner.status.position_terms = inner.position_pid.terms();
    inner.status.off_axis_terms = inner.off_axis_pid.terms();

    // Limit supervision is always in the mount frame.
    let position = inner.status.pos_mount_degrees;
    if position < ctx.limit_min || position > ctx.limit_max {
        inner.status.out_of_limits = true;
        if inner.state != AxisState::Park {
            // Parking from OOL must not be thrown back into OOL: the home
            // position is inside the limit envelope by construction.
            inner.next_state = AxisState::OutOfLimits;
        }
    } else {
        inner.status.out_of_limits = false;
    }
}

fn read_telemetry(ctx: &LoopContext, inner: &mut Inner) {
    match inner.drive.actual_position() {
        Ok(microsteps) => {
            inner.status.pos_mount_microsteps = microsteps;
            inner.status.pos_mount_degrees = ctx.conv.microsteps_to_degrees(microsteps);
            inner.status.success += 1;
        }
        Err(e) => record_telemetry_error(inner, e),
    }

    ctx.frame.store(ctx.kind, inner.status.pos_mount_degrees);
    let correction_active = ctx.model.active();
    inner.status.correction_active = correction_active;
    inner.status.pos_celestial_degrees = if correction_active {
        let (az, el) = ctx.frame.load();
        let (cel_az, cel_el) = ctx.model.reverse(az, el);
        match ctx.kind {
            AxisKind::Azimuth => cel_az,
            AxisKind::Elevation => cel_el,
        }
    } else {
        inner.status.pos_mount_degrees
    };

    match inner.drive.get_axis_parameter(axis_param::ENCODER_POSITION) {
        Ok(raw) => {
            // Azimuth encoder counts against the commanded direction.
            let microsteps = match ctx.kind {
                AxisKind::Azimuth => -raw,
                AxisKind::Elevation => raw,
            };
            inner.status.pos_encoder_microsteps = microsteps;
            inner.status.pos_encoder_degrees = ctx.conv.microsteps_to_degrees(microsteps);
            inner.status.success += 1;
        }
        Err(e) => record_telemetry_error(inner, e),
    }

    match inner.drive.actual_velocity() {
        Ok(velocity) => {
            inner.status.vel_internal_microsteps = velocity;
            inner.status.vel_internal_degrees = ctx.conv.microsteps_to_degrees(velocity);
            inner.status.success += 1;
        }
        Err(e) => record_telemetry_error(inner, e),
    }
}

/// Telemetry read failures are not critical: record and retry next cycle.
fn record_telemetry_error(inner: &mut Inner, error: DriveError) {
    inner.status.last_error = error.to_string();
    inner.status.errors += 1;
}

fn position_reached(inner: &mut Inner) -> Option<bool> {
    match inner.drive.position_reached() {
        Ok(reached) => Some(reached),
        Err(e) => {
            record_telemetry_error(inner, e);
            None
        }
    }
}

fn is_stopped(inner: &mut Inner) -> Option<bool> {
    match inner.drive.actual_velocity() {
        Ok(velocity) => Some(velocity == 0),
        Err(e) => {
            record_telemetry_error(inner, e);
            None
        }
    }
}

/// Clamps to the configured max velocity, suppresses writes of an unchanged
/// rate and swallows transient failures (the next iteration rewrites).
fn set_velocity(ctx: &LoopContext, inner: &mut Inner, velocity: DegreesPerSecond) {
    let microsteps = ctx
        .conv
        .degrees_to_microsteps(velocity)
        .clamp(-ctx.max_velocity, ctx.max_velocity);
    if microsteps == inner.previous_velocity {
        return;
    }
    match inner.drive.rotate(microsteps) {
        Ok(()) => inner.previous_velocity = microsteps,
        Err(e) => record_telemetry_error(inner, e),
    }
}

/// Unconditional stop for an axis caught outside its limits.
fn force_stop(name: &str, inner: &mut Inner) {
    let drive = inner.drive.as_mut();
    let result = retry::retry(
        Fixed::from_millis(RETRY_DELAY_MS).take(OOL_STOP_TRIES - 1),
        || drive.stop(),
    );
    match result {
        Ok(()) => info!(axis = %name, "axis stopped out of limits"),
        Err(_) => warn!(axis = %name, "could not stop axis out of limits"),
    }
}

fn poll_telemetry(inner: &Arc<Mutex<Inner>>) {
    let mut guard = inner.lock();
    let inner = &mut *guard;

    match inner.drive.status_flags() {
        Ok(flags) => {
            inner.status.driver_status_flags = flags;
            inner.status.success += 1;
        }
        Err(e) => record_telemetry_error(inner, e),
    }
    match inner.drive.error_flags() {
        Ok(flags) => {
            inner.status.driver_error_flags = flags;
            inner.status.success += 1;
        }
        Err(e) => record_telemetry_error(inner, e),
    }
    match inner.drive.analog_input(VOLTAGE_CHANNEL) {
        Ok(raw) => {
            inner.status.driver_voltage = raw as f64 / 10.;
            inner.status.success += 1;
        }
        Err(e) => record_telemetry_error(inner, e),
    }
    match inner.drive.analog_input(TEMPERATURE_CHANNEL) {
        Ok(temperature) => {
            inner.status.driver_temperature = temperature;
            inner.status.success += 1;
        }
        Err(e) => record_telemetry_error(inner, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{FixedTarget, NoGuider, NoTarget};
    use crate::drive::sim::{SimDrive, SimHandle};
    use crate::metrics::LogSink;
    use crate::units::Gearing;

    struct TestGuider {
        value: Degrees,
        setpoint: Degrees,
        detecting: bool,
    }

    impl GuiderSource for TestGuider {
        fn off_axis_value(&self, _kind: AxisKind) -> Degrees {
            self.value
        }

        fn off_axis_setpoint(&self, _kind: AxisKind) -> Degrees {
            self.setpoint
        }

        fn detection_enabled(&self) -> bool {
            self.detecting
        }

        fn has_detection(&self) -> bool {
            self.detecting
        }
    }

    fn context(target: Arc<dyn TargetSource>, guider: Arc<dyn GuiderSource>) -> AxisContext {
        AxisContext {
            frame: MountFrame::new(),
            model: Arc::new(ModelStore::new()),
            target,
            guider,
            metrics: Arc::new(LogSink),
        }
    }

    fn build_axis(
        kind: AxisKind,
        ctx: AxisContext,
    ) -> (Axis, SimHandle, LoopContext) {
        let (drive, handle) = SimDrive::new();
        let settings = match kind {
            AxisKind::Azimuth => AxisSettings::azimuth(),
            AxisKind::Elevation => AxisSettings::elevation(),
        };
        let axis = Axis::new(kind, Box::new(drive), settings, ctx).unwrap();
        let loop_ctx = axis.loop_context();
        (axis, handle, loop_ctx)
    }

    fn idle_axis() -> (Axis, SimHandle, LoopContext) {
        build_axis(
            AxisKind::Azimuth,
            context(Arc::new(NoTarget), Arc::new(NoGuider)),
        )
    }

    fn step(ctx: &LoopContext) {
        run_iteration(ctx, &mut None);
    }

    fn microsteps_per_degree() -> i32 {
        Gearing::default().converter().degrees_to_microsteps(1.)
    }

    #[test]
    fn test_configure_writes_axis_parameters() {
        let (_axis, handle, _ctx) = idle_axis();
        assert_eq!(handle.parameter(4), Some(100_000));
        assert_eq!(handle.parameter(5), Some(50_000));
    }

    #[test]
    fn test_goto_position_transitions_and_completes() {
        let (axis, handle, ctx) = idle_axis();
        handle.set_instant_moves(false);

        let result = axis.goto_position(45.);
        assert!(result.is_success());
        assert_eq!(handle.moves(), vec![1_152_000]);
        // Still IDLE until the loop latches the pending state.
        assert_eq!(axis.state(), AxisState::Idle);

        step(&ctx);
        assert_eq!(axis.state(), AxisState::GotoPosition);

        // Drive reaches the target.
        handle.set_actual_position(1_152_000);
        step(&ctx);
        step(&ctx);
        assert_eq!(axis.state(), AxisState::Idle);
    }

    #[test]
    fn test_goto_position_rejected_outside_idle() {
        let (axis, _handle, ctx) = idle_axis();
        axis.goto_position(10.);
        step(&ctx);
        let result = axis.goto_position(20.);
        assert!(!result.is_success());
        assert_eq!(result.message, "not in correct state or transition in progress");
    }

    #[test]
    fn test_start_tracking_from_track_is_rejected() {
        let (axis, _handle, ctx) = idle_axis();
        assert!(axis.start_tracking().is_success());
        step(&ctx);
        assert_eq!(axis.state(), AxisState::Track);
        assert!(!axis.start_tracking().is_success());
    }

    #[test]
    fn test_goto_velocity_clamps_preserving_sign() {
        let (axis, handle, ctx) = idle_axis();
        // 100 deg/s is far beyond max velocity (100_000 usteps/s).
        assert!(axis.goto_velocity(100.).is_success());
        assert_eq!(handle.last_rotation(), Some(100_000));

        // Re-command is allowed once the loop has latched GOTO_VELOCITY.
        step(&ctx);
        assert!(axis.goto_velocity(-100.).is_success());
        assert_eq!(handle.last_rotation(), Some(-100_000));

        // In-range velocities pass through unclamped.
        step(&ctx);
        assert!(axis.goto_velocity(1.).is_success());
        assert_eq!(handle.last_rotation(), Some(microsteps_per_degree()));
    }

    #[test]
    fn test_goto_velocity_completes_when_stopped() {
        let (axis, handle, ctx) = idle_axis();
        axis.goto_velocity(1.);
        step(&ctx);
        assert_eq!(axis.state(), AxisState::GotoVelocity);
        handle.set_velocity(0);
        step(&ctx);
        step(&ctx);
        assert_eq!(axis.state(), AxisState::Idle);
    }

    #[test]
    fn test_abort_clears_pids_when_stopped() {
        let target: Arc<dyn TargetSource> = Arc::new(FixedTarget(10., 10.));
        let (axis, handle, ctx) = build_axis(AxisKind::Azimuth, context(target, Arc::new(NoGuider)));

        axis.start_tracking();
        step(&ctx);
        step(&ctx);
        assert_eq!(axis.state(), AxisState::Track);
        assert!(axis.status().position_terms.i != 0.);

        assert!(axis.abort().is_success());
        assert_eq!(handle.stops(), 1);
        handle.set_velocity(0);
        step(&ctx); // latch ABORT, observe stopped, clear
        assert_eq!(axis.state(), AxisState::Abort);
        step(&ctx);
        assert_eq!(axis.state(), AxisState::Idle);
        let status = axis.status();
        assert_eq!(status.position_terms, PidTerms::default());
        assert_eq!(status.off_axis_terms, PidTerms::default());
    }

    #[test]
    fn test_abort_rejected_when_idle() {
        let (axis, _handle, _ctx) = idle_axis();
        assert!(!axis.abort().is_success());
    }

    #[test]
    fn test_track_commands_clamped_velocity() {
        let target: Arc<dyn TargetSource> = Arc::new(FixedTarget(10., 10.));
        let (axis, handle, ctx) = build_axis(AxisKind::Azimuth, context(target, Arc::new(NoGuider)));

        axis.start_tracking();
        step(&ctx);
        step(&ctx);
        // 10 deg of error through kp=5 saturates the velocity command.
        assert_eq!(handle.last_rotation(), Some(100_000));

        // Redundant writes of the same rate are suppressed.
        let writes = handle.rotations().len();
        step(&ctx);
        assert_eq!(handle.rotations().len(), writes);
    }

    #[test]
    fn test_track_negative_error_negative_velocity() {
        let target: Arc<dyn TargetSource> = Arc::new(FixedTarget(-10., 0.));
        let (axis, handle, ctx) = build_axis(AxisKind::Azimuth, context(target, Arc::new(NoGuider)));
        axis.start_tracking();
        step(&ctx);
        step(&ctx);
        assert_eq!(handle.last_rotation(), Some(-100_000));
    }

    #[test]
    fn test_set_position_gains_applies_to_inner_loop() {
        let target: Arc<dyn TargetSource> = Arc::new(FixedTarget(1., 0.));
        let (axis, handle, ctx) = build_axis(AxisKind::Azimuth, context(target, Arc::new(NoGuider)));
        axis.set_position_gains(0.5, 0., 0.);
        axis.start_tracking();
        step(&ctx);
        // 1 deg of error through kp=0.5 commands 0.5 deg/s.
        assert_eq!(handle.last_rotation(), Some(12_800));
    }

    #[test]
    fn test_track_off_axis_correction_shifts_setpoint() {
        let target: Arc<dyn TargetSource> = Arc::new(FixedTarget(10., 0.));
        let guider = Arc::new(TestGuider {
            value: 0.01,
            setpoint: 0.,
            detecting: true,
        });
        let (axis, _handle, ctx) = build_axis(AxisKind::Azimuth, context(target, guider));

        axis.start_tracking();
        step(&ctx);
        step(&ctx);
        let status = axis.status();
        // The outer loop reacts to the 0.01 deg offset and biases the inner
        // setpoint away from the raw trajectory.
        assert!(status.off_axis_terms.p != 0.);
        let setpoint = axis.inner.lock().position_pid.setpoint;
        // First effective outer update: p = 0.4 * -0.01, i = 0.05 * -0.01 * 1s.
        assert_float_eq::assert_float_absolute_eq!(setpoint, 10. + 0.004 + 0.0005, 1e-9);
    }

    #[test]
    fn test_ool_within_one_iteration_and_stop() {
        let (axis, handle, ctx) = idle_axis();
        let beyond_limit = Gearing::default().converter().degrees_to_microsteps(181.);
        handle.set_actual_position(beyond_limit);
        handle.set_velocity(500);

        step(&ctx);
        let status = axis.status();
        assert!(status.out_of_limits);
        assert_eq!(axis.inner.lock().next_state, AxisState::OutOfLimits);

        step(&ctx);
        assert_eq!(axis.state(), AxisState::OutOfLimits);
        assert_eq!(handle.stops(), 1);
        assert_eq!(handle.last_rotation(), None);
    }

    #[test]
    fn test_park_recovers_from_ool() {
        let (axis, handle, ctx) = idle_axis();
        let beyond_limit = Gearing::default().converter().degrees_to_microsteps(181.);
        handle.set_actual_position(beyond_limit);
        step(&ctx);
        step(&ctx);
        assert_eq!(axis.state(), AxisState::OutOfLimits);

        assert!(axis.park().is_success());
        assert_eq!(handle.moves(), vec![0]);
        step(&ctx); // latch PARK; home is reached instantly in the sim
        assert_eq!(axis.state(), AxisState::Park);
        step(&ctx);
        assert_eq!(axis.state(), AxisState::Idle);
        assert!(!axis.status().out_of_limits);
    }

    #[test]
    fn test_park_not_thrown_back_into_ool() {
        let (axis, handle, ctx) = idle_axis();
        handle.set_instant_moves(false);
        let beyond_limit = Gearing::default().converter().degrees_to_microsteps(181.);
        handle.set_actual_position(beyond_limit);
        step(&ctx);
        step(&ctx);
        assert!(axis.park().is_success());
        step(&ctx);
        assert_eq!(axis.state(), AxisState::Park);
        // Still outside the envelope while slewing home, but PARK persists.
        step(&ctx);
        assert_eq!(axis.state(), AxisState::Park);
        assert!(axis.status().out_of_limits);
    }

    #[test]
    fn test_set_position_inverts_azimuth_encoder() {
        let (axis, handle, _ctx) = idle_axis();
        assert!(axis.set_position(45.).is_success());
        assert_eq!(handle.actual_position(), 1_152_000);
        assert_eq!(handle.parameter(axis_param::ENCODER_POSITION), Some(-1_152_000));
    }

    #[test]
    fn test_encoder_readback_inverted_for_azimuth() {
        let (axis, handle, ctx) = idle_axis();
        handle.set_encoder_raw(u32::MAX); // -1 after sign handling
        step(&ctx);
        assert_eq!(axis.status().pos_encoder_microsteps, 1);
    }

    #[test]
    fn test_telemetry_errors_are_not_fatal() {
        let (axis, handle, ctx) = idle_axis();
        handle.fail_next(3);
        step(&ctx);
        let status = axis.status();
        assert!(status.errors >= 3);
        assert!(status.last_error.contains("injected failure"));
        assert_eq!(axis.state(), AxisState::Idle);
        // Next cycle recovers.
        step(&ctx);
        assert!(axis.status().success > 0);
    }

    #[test]
    fn test_command_retries_then_fails() {
        let (axis, handle, _ctx) = idle_axis();
        handle.fail_next(COMMAND_TRIES as u32);
        let result = axis.goto_position(10.);
        assert!(!result.is_success());
        assert!(result.message.contains("injected failure"));
        // The FSM did not advance.
        assert_eq!(axis.inner.lock().next_state, AxisState::Idle);
    }

    #[test]
    fn test_command_retry_recovers() {
        let (axis, handle, _ctx) = idle_axis();
        handle.fail_next(2);
        let result = axis.goto_position(10.);
        assert!(result.is_success());
        assert_eq!(axis.inner.lock().next_state, AxisState::GotoPosition);
    }

    #[test]
    fn test_poll_task_reads_flags_and_analogs() {
        let (axis, handle, _ctx) = idle_axis();
        handle.set_analog(VOLTAGE_CHANNEL, 238);
        handle.set_analog(TEMPERATURE_CHANNEL, 41);
        poll_telemetry(&axis.inner);
        let status = axis.status();
        assert_float_eq::assert_float_absolute_eq!(status.driver_voltage, 23.8, 1e-9);
        assert_eq!(status.driver_temperature, 41);
    }

    #[test]
    fn test_celestial_frame_follows_model() {
        let ctx_pack = context(Arc::new(NoTarget), Arc::new(NoGuider));
        let model = ctx_pack.model.clone();
        let (axis, handle, ctx) = build_axis(AxisKind::Azimuth, ctx_pack);

        handle.set_actual_position(Gearing::default().converter().degrees_to_microsteps(45.));
        step(&ctx);
        assert_float_eq::assert_float_absolute_eq!(axis.status().pos_celestial_degrees, 45., 1e-9);

        model
            .set_coefficients(&[0.1, 0., 0., 0., 0., 0., 0., 0.])
            .unwrap();
        step(&ctx);
        let status = axis.status();
        assert!(status.correction_active);
        assert_float_eq::assert_float_absolute_eq!(status.pos_celestial_degrees, 44.9, 1e-6);
    }
}
