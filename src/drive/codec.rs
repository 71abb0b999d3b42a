use super::DriveError;
use crate::drive::params::{Instruction, ReplyStatus};

pub const FRAME_LEN: usize = 9;

/// A host-to-module TMCL request.
///
/// Wire layout: `[address, instruction, type, motor/bank, value(4, BE), checksum]`
/// where the checksum is the wrapping u8 sum of the first eight bytes.
#[derive(Debug, Copy, Clone)]
pub struct Request {
    pub address: u8,
    pub instruction: Instruction,
    pub type_code: u8,
    pub motor: u8,
    pub value: i32,
}

impl Request {
    pub fn new(address: u8, instruction: Instruction, type_code: u8, motor: u8, value: i32) -> Self {
        Self {
            address,
            instruction,
            type_code,
            motor,
            value,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = self.address;
        frame[1] = self.instruction.into();
        frame[2] = self.type_code;
        frame[3] = self.motor;
        frame[4..8].copy_from_slice(&self.value.to_be_bytes());
        frame[8] = checksum(&frame[..8]);
        frame
    }
}

/// A module-to-host TMCL reply.
///
/// Wire layout: `[reply address, module address, status, instruction, value(4, BE), checksum]`.
#[derive(Debug, Copy, Clone)]
pub struct Reply {
    pub reply_address: u8,
    pub module_address: u8,
    pub status: ReplyStatus,
    pub instruction: u8,
    value: u32,
}

impl Reply {
    pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Self, DriveError> {
        let expected = checksum(&frame[..8]);
        if frame[8] != expected {
            return Err(DriveError::BadReply(format!(
                "checksum mismatch: got {:#04x}, computed {:#04x}",
                frame[8], expected
            )));
        }
        let status = ReplyStatus::try_from(frame[2])
            .map_err(|_| DriveError::BadReply(format!("unknown status code {}", frame[2])))?;
        Ok(Self {
            reply_address: frame[0],
            module_address: frame[1],
            status,
            instruction: frame[3],
            value: u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
        })
    }

    /// Raw register word as transmitted.
    pub fn value_raw(&self) -> u32 {
        self.value
    }

    /// Register word reinterpreted as a signed value.
    ///
    /// Registers travel as unsigned 32-bit words; a raw value >= 2^31
    /// represents `raw - 2^32`.
    pub fn value_signed(&self) -> i32 {
        self.value as i32
    }

    /// Fails with [`DriveError::Nak`] unless the module accepted the command.
    pub fn accepted(self) -> Result<Self, DriveError> {
        if self.status.is_ok() {
            Ok(self)
        } else {
            Err(DriveError::Nak {
                instruction: self.instruction,
                status: self.status,
            })
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_frame(status: u8, value: u32) -> [u8; FRAME_LEN] {
        let mut frame = [2u8, 1, status, 6, 0, 0, 0, 0, 0];
        frame[4..8].copy_from_slice(&value.to_be_bytes());
        frame[8] = checksum(&frame[..8]);
        frame
    }

    #[test]
    fn test_request_encoding() {
        let req = Request::new(1, Instruction::MoveTo, 0, 0, 1_152_000);
        let frame = req.encode();
        assert_eq!(frame[0], 1);
        assert_eq!(frame[1], 4);
        assert_eq!(&frame[4..8], &1_152_000i32.to_be_bytes());
        assert_eq!(frame[8], checksum(&frame[..8]));
    }

    #[test]
    fn test_negative_value_encoding() {
        let req = Request::new(1, Instruction::RotateLeft, 0, 0, -25_600);
        let frame = req.encode();
        assert_eq!(i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]), -25_600);
    }

    #[test]
    fn test_reply_round_trip() {
        let frame = reply_frame(100, 42);
        let reply = Reply::decode(&frame).unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.value_signed(), 42);
        assert!(reply.accepted().is_ok());
    }

    #[test]
    fn test_reply_sign_extension() {
        // Encoder register wraps below zero: raw >= 2^31 is negative.
        let reply = Reply::decode(&reply_frame(100, u32::MAX)).unwrap();
        assert_eq!(reply.value_signed(), -1);

        let reply = Reply::decode(&reply_frame(100, 1 << 31)).unwrap();
        assert_eq!(reply.value_signed(), i32::MIN);

        let reply = Reply::decode(&reply_frame(100, (1 << 31) - 1)).unwrap();
        assert_eq!(reply.value_signed(), i32::MAX);
    }

    #[test]
    fn test_reply_checksum_rejected() {
        let mut frame = reply_frame(100, 7);
        frame[8] ^= 0xff;
        assert!(matches!(Reply::decode(&frame), Err(DriveError::BadReply(_))));
    }

    #[test]
    fn test_reply_nak() {
        let reply = Reply::decode(&reply_frame(4, 0)).unwrap();
        let err = reply.accepted().unwrap_err();
        assert!(matches!(
            err,
            DriveError::Nak {
                status: ReplyStatus::InvalidValue,
                ..
            }
        ));
    }
}
