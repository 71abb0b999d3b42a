use num_enum::{IntoPrimitive, TryFromPrimitive};

/// TMCL instruction opcodes used by the mount.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Instruction {
    RotateRight = 1,
    RotateLeft = 2,
    MotorStop = 3,
    MoveTo = 4,
    SetAxisParameter = 5,
    GetAxisParameter = 6,
    SetGlobalParameter = 9,
    GetGlobalParameter = 10,
    GetInput = 15,
}

/// Status byte of a TMCL reply frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ReplyStatus {
    WrongChecksum = 1,
    InvalidCommand = 2,
    WrongType = 3,
    InvalidValue = 4,
    EepromLocked = 5,
    CommandNotAvailable = 6,
    Ok = 100,
    LoadedToEeprom = 101,
}

impl ReplyStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, ReplyStatus::Ok | ReplyStatus::LoadedToEeprom)
    }
}

/// MVP addressing mode: absolute target position.
pub const MVP_ABSOLUTE: u8 = 0;

/// Bank selector for analog inputs of the GIO instruction.
pub const IO_BANK_ANALOG: u8 = 1;

/// Axis parameter numbers of the stepper module.
pub mod axis_param {
    pub const TARGET_POSITION: u8 = 0;
    pub const ACTUAL_POSITION: u8 = 1;
    pub const ACTUAL_SPEED: u8 = 3;
    pub const MAX_POSITIONING_SPEED: u8 = 4;
    pub const POSITION_REACHED: u8 = 8;
    pub const ERROR_FLAGS: u8 = 207;
    pub const STATUS_FLAGS: u8 = 208;
    pub const ENCODER_POSITION: u8 = 209;
}

/// Global parameter numbers (bank 0).
pub mod global_param {
    pub const SERIAL_ADDRESS: u8 = 66;
}
