//! Software-simulated drive module.
//!
//! Stands in for a stepper module on the bench and in tests: positioning
//! moves complete instantly (unless disabled), velocity and stop commands
//! latch their arguments, and failures can be injected per call.

use super::{Drive, DriveError, DriveResult};
use crate::drive::params::{axis_param, global_param};
use crate::units::Microsteps;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
struct SimState {
    serial_address: u8,
    actual_position: Microsteps,
    target_position: Microsteps,
    encoder_position: Microsteps,
    velocity: i32,
    status_flags: u32,
    error_flags: u32,
    analog: BTreeMap<u8, i32>,
    parameters: BTreeMap<u8, i32>,
    /// When set, `move_to` teleports to the target.
    instant_moves: bool,
    fail_next: u32,
    rotations: Vec<i32>,
    moves: Vec<Microsteps>,
    stops: u32,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            serial_address: 1,
            actual_position: 0,
            target_position: 0,
            encoder_position: 0,
            velocity: 0,
            status_flags: 0,
            error_flags: 0,
            analog: BTreeMap::new(),
            parameters: BTreeMap::new(),
            instant_moves: true,
            fail_next: 0,
            rotations: Vec::new(),
            moves: Vec::new(),
            stops: 0,
        }
    }
}

pub struct SimDrive {
    state: Arc<Mutex<SimState>>,
}

/// Test-side handle onto a [`SimDrive`]'s internal state.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimDrive {
    pub fn new() -> (Self, SimHandle) {
        Self::with_address(1)
    }

    pub fn with_address(serial_address: u8) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState {
            serial_address,
            ..SimState::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            SimHandle { state },
        )
    }

    fn check_failure(state: &mut SimState) -> DriveResult<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DriveError::BadReply("injected failure".to_string()));
        }
        Ok(())
    }
}

impl SimHandle {
    pub fn set_actual_position(&self, microsteps: Microsteps) {
        self.state.lock().actual_position = microsteps;
    }

    pub fn set_velocity(&self, microsteps_per_sec: i32) {
        self.state.lock().velocity = microsteps_per_sec;
    }

    pub fn set_encoder_raw(&self, raw: u32) {
        self.state.lock().encoder_position = raw as i32;
    }

    pub fn set_analog(&self, channel: u8, value: i32) {
        self.state.lock().analog.insert(channel, value);
    }

    pub fn set_instant_moves(&self, instant: bool) {
        self.state.lock().instant_moves = instant;
    }

    /// The next `count` transactions fail with a communication error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    pub fn actual_position(&self) -> Microsteps {
        self.state.lock().actual_position
    }

    pub fn rotations(&self) -> Vec<i32> {
        self.state.lock().rotations.clone()
    }

    pub fn last_rotation(&self) -> Option<i32> {
        self.state.lock().rotations.last().copied()
    }

    pub fn moves(&self) -> Vec<Microsteps> {
        self.state.lock().moves.clone()
    }

    pub fn stops(&self) -> u32 {
        self.state.lock().stops
    }

    pub fn parameter(&self, parameter: u8) -> Option<i32> {
        self.state.lock().parameters.get(&parameter).copied()
    }
}

impl Drive for SimDrive {
    fn set_axis_parameter(&mut self, parameter: u8, value: i32) -> DriveResult<()> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        state.parameters.insert(parameter, value);
        match parameter {
            axis_param::ACTUAL_POSITION => state.actual_position = value,
            axis_param::TARGET_POSITION => state.target_position = value,
            axis_param::ENCODER_POSITION => state.encoder_position = value,
            _ => {}
        }
        Ok(())
    }

    fn get_axis_parameter(&mut self, parameter: u8) -> DriveResult<i32> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        Ok(match parameter {
            axis_param::ACTUAL_POSITION => state.actual_position,
            axis_param::TARGET_POSITION => state.target_position,
            axis_param::ENCODER_POSITION => state.encoder_position,
            axis_param::ACTUAL_SPEED => state.velocity,
            axis_param::POSITION_REACHED => (state.actual_position == state.target_position) as i32,
            other => state.parameters.get(&other).copied().unwrap_or(0),
        })
    }

    fn set_actual_position(&mut self, microsteps: Microsteps) -> DriveResult<()> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        state.actual_position = microsteps;
        Ok(())
    }

    fn set_target_position(&mut self, microsteps: Microsteps) -> DriveResult<()> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        state.target_position = microsteps;
        Ok(())
    }

    fn move_to(&mut self, microsteps: Microsteps) -> DriveResult<()> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        state.target_position = microsteps;
        state.moves.push(microsteps);
        if state.instant_moves {
            state.actual_position = microsteps;
            state.velocity = 0;
        }
        Ok(())
    }

    fn rotate(&mut self, microsteps_per_sec: i32) -> DriveResult<()> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        state.velocity = microsteps_per_sec;
        state.rotations.push(microsteps_per_sec);
        Ok(())
    }

    fn stop(&mut self) -> DriveResult<()> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        state.velocity = 0;
        state.stops += 1;
        Ok(())
    }

    fn actual_position(&mut self) -> DriveResult<Microsteps> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        Ok(state.actual_position)
    }

    fn actual_velocity(&mut self) -> DriveResult<i32> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        Ok(state.velocity)
    }

    fn position_reached(&mut self) -> DriveResult<bool> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        Ok(state.actual_position == state.target_position)
    }

    fn status_flags(&mut self) -> DriveResult<u32> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        Ok(state.status_flags)
    }

    fn error_flags(&mut self) -> DriveResult<u32> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        Ok(state.error_flags)
    }

    fn analog_input(&mut self, channel: u8) -> DriveResult<i32> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        Ok(state.analog.get(&channel).copied().unwrap_or(0))
    }

    fn global_parameter(&mut self, parameter: u8, _bank: u8) -> DriveResult<i32> {
        let mut state = self.state.lock();
        SimDrive::check_failure(&mut state)?;
        if parameter == global_param::SERIAL_ADDRESS {
            Ok(state.serial_address as i32)
        } else {
            Ok(0)
        }
    }
}
