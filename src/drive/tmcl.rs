use super::{Drive, DriveResult};
use crate::drive::codec::{Reply, Request, FRAME_LEN};
use crate::drive::params::{axis_param, Instruction, IO_BANK_ANALOG, MVP_ABSOLUTE};
use crate::units::Microsteps;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::trace;

/// Module address used before the serial-address handshake has identified
/// the module. The link is point-to-point, so the module answers regardless;
/// the discovered address is adopted afterwards.
const DEFAULT_MODULE_ADDRESS: u8 = 1;

/// Drive client speaking TMCL over a dedicated serial link.
pub struct TmclDrive {
    port: Box<dyn SerialPort>,
    port_name: String,
    module_address: u8,
}

impl TmclDrive {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> DriveResult<Self> {
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        Ok(Self {
            port,
            port_name: path.to_string(),
            module_address: DEFAULT_MODULE_ADDRESS,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn set_module_address(&mut self, address: u8) {
        self.module_address = address;
    }

    fn transact(
        &mut self,
        instruction: Instruction,
        type_code: u8,
        motor: u8,
        value: i32,
    ) -> DriveResult<Reply> {
        let request = Request::new(self.module_address, instruction, type_code, motor, value);
        self.port.write_all(&request.encode())?;
        let mut frame = [0u8; FRAME_LEN];
        self.port.read_exact(&mut frame)?;
        let reply = Reply::decode(&frame)?.accepted()?;
        trace!(
            port = %self.port_name,
            instruction = ?instruction,
            value,
            reply = reply.value_signed(),
            "transaction"
        );
        Ok(reply)
    }
}

impl Drive for TmclDrive {
    fn set_axis_parameter(&mut self, parameter: u8, value: i32) -> DriveResult<()> {
        self.transact(Instruction::SetAxisParameter, parameter, 0, value)?;
        Ok(())
    }

    fn get_axis_parameter(&mut self, parameter: u8) -> DriveResult<i32> {
        Ok(self
            .transact(Instruction::GetAxisParameter, parameter, 0, 0)?
            .value_signed())
    }

    fn set_actual_position(&mut self, microsteps: Microsteps) -> DriveResult<()> {
        self.set_axis_parameter(axis_param::ACTUAL_POSITION, microsteps)
    }

    fn set_target_position(&mut self, microsteps: Microsteps) -> DriveResult<()> {
        self.set_axis_parameter(axis_param::TARGET_POSITION, microsteps)
    }

    fn move_to(&mut self, microsteps: Microsteps) -> DriveResult<()> {
        self.transact(Instruction::MoveTo, MVP_ABSOLUTE, 0, microsteps)?;
        Ok(())
    }

    fn rotate(&mut self, microsteps_per_sec: i32) -> DriveResult<()> {
        // Classic TMCL: direction is carried by the opcode, speed is unsigned.
        let (instruction, speed) = if microsteps_per_sec < 0 {
            (Instruction::RotateLeft, -microsteps_per_sec)
        } else {
            (Instruction::RotateRight, microsteps_per_sec)
        };
        self.transact(instruction, 0, 0, speed)?;
        Ok(())
    }

    fn stop(&mut self) -> DriveResult<()> {
        self.transact(Instruction::MotorStop, 0, 0, 0)?;
        Ok(())
    }

    fn actual_position(&mut self) -> DriveResult<Microsteps> {
        self.get_axis_parameter(axis_param::ACTUAL_POSITION)
    }

    fn actual_velocity(&mut self) -> DriveResult<i32> {
        self.get_axis_parameter(axis_param::ACTUAL_SPEED)
    }

    fn position_reached(&mut self) -> DriveResult<bool> {
        Ok(self.get_axis_parameter(axis_param::POSITION_REACHED)? != 0)
    }

    fn status_flags(&mut self) -> DriveResult<u32> {
        Ok(self
            .transact(Instruction::GetAxisParameter, axis_param::STATUS_FLAGS, 0, 0)?
            .value_raw())
    }

    fn error_flags(&mut self) -> DriveResult<u32> {
        Ok(self
            .transact(Instruction::GetAxisParameter, axis_param::ERROR_FLAGS, 0, 0)?
            .value_raw())
    }

    fn analog_input(&mut self, channel: u8) -> DriveResult<i32> {
        Ok(self
            .transact(Instruction::GetInput, channel, IO_BANK_ANALOG, 0)?
            .value_signed())
    }

    fn global_parameter(&mut self, parameter: u8, bank: u8) -> DriveResult<i32> {
        Ok(self
            .transact(Instruction::GetGlobalParameter, parameter, bank, 0)?
            .value_signed())
    }
}
