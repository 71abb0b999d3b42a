pub mod codec;
pub mod params;
pub mod sim;
mod tmcl;

use crate::config::SerialSettings;
use crate::drive::params::{global_param, ReplyStatus};
use crate::drive::sim::SimDrive;
use crate::units::Microsteps;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub use tmcl::TmclDrive;

pub type DriveResult<T> = Result<T, DriveError>;

/// A failed transaction with the stepper module. All variants are treated as
/// transient by callers, which retry per the axis command policy.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("serial: {0}")]
    Serial(#[from] serialport::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("module rejected instruction {instruction} with status {status:?}")]
    Nak { instruction: u8, status: ReplyStatus },
    #[error("malformed reply: {0}")]
    BadReply(String),
}

/// Synchronous request/reply surface of one stepper-driver module.
///
/// Every call is a single short transaction; any call may fail transiently
/// and the contract is that callers retry.
pub trait Drive: Send {
    fn set_axis_parameter(&mut self, parameter: u8, value: i32) -> DriveResult<()>;
    fn get_axis_parameter(&mut self, parameter: u8) -> DriveResult<i32>;
    fn set_actual_position(&mut self, microsteps: Microsteps) -> DriveResult<()>;
    fn set_target_position(&mut self, microsteps: Microsteps) -> DriveResult<()>;
    fn move_to(&mut self, microsteps: Microsteps) -> DriveResult<()>;
    fn rotate(&mut self, microsteps_per_sec: i32) -> DriveResult<()>;
    fn stop(&mut self) -> DriveResult<()>;
    fn actual_position(&mut self) -> DriveResult<Microsteps>;
    fn actual_velocity(&mut self) -> DriveResult<i32>;
    fn position_reached(&mut self) -> DriveResult<bool>;
    fn status_flags(&mut self) -> DriveResult<u32>;
    fn error_flags(&mut self) -> DriveResult<u32>;
    fn analog_input(&mut self, channel: u8) -> DriveResult<i32>;
    fn global_parameter(&mut self, parameter: u8, bank: u8) -> DriveResult<i32>;
}

/// The two drive clients after the serial-address handshake.
pub struct AxisDrives {
    pub azimuth: Box<dyn Drive>,
    pub elevation: Box<dyn Drive>,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),
    #[error("expected exactly 2 candidate serial ports, found {0}")]
    PortCount(usize),
    #[error("could not open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: DriveError,
    },
    #[error("serial-address handshake failed on {port}: {source}")]
    Handshake {
        port: String,
        #[source]
        source: DriveError,
    },
    #[error("unexpected serial addresses {0} and {1} (want 1 = azimuth, 2 = elevation)")]
    Addresses(u8, u8),
}

/// Which axis a drive module serves, as encoded in its serial address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Azimuth,
    Elevation,
}

/// Maps a pair of reported serial addresses onto axis roles.
/// Address 1 is the azimuth module, address 2 the elevation module.
pub fn assign_roles(first: u8, second: u8) -> Result<(Role, Role), DiscoveryError> {
    match (first, second) {
        (1, 2) => Ok((Role::Azimuth, Role::Elevation)),
        (2, 1) => Ok((Role::Elevation, Role::Azimuth)),
        (a, b) => Err(DiscoveryError::Addresses(a, b)),
    }
}

/// Enumerates the serial links, reads each module's serial address and binds
/// the two drives to their axes. Port assignment is discovered, never
/// hard-coded; a missing or mismatched module is fatal.
pub fn discover(settings: &SerialSettings) -> Result<AxisDrives, DiscoveryError> {
    if settings.simulate {
        info!("serial simulation enabled, using simulated drive modules");
        let (azimuth, _) = SimDrive::with_address(1);
        let (elevation, _) = SimDrive::with_address(2);
        return Ok(AxisDrives {
            azimuth: Box::new(azimuth),
            elevation: Box::new(elevation),
        });
    }

    let ports = candidate_ports(settings)?;
    if ports.len() != 2 {
        return Err(DiscoveryError::PortCount(ports.len()));
    }

    let timeout = Duration::from_millis(settings.timeout_millis);
    let mut bound = Vec::with_capacity(2);
    for port in &ports {
        let mut drive = TmclDrive::open(port, settings.baud_rate, timeout).map_err(|source| {
            DiscoveryError::Open {
                port: port.clone(),
                source,
            }
        })?;
        let address = drive
            .global_parameter(global_param::SERIAL_ADDRESS, 0)
            .map_err(|source| DiscoveryError::Handshake {
                port: port.clone(),
                source,
            })? as u8;
        info!(port = %port, address, "drive module responded");
        bound.push((drive, address));
    }

    let (first, second) = (bound.remove(0), bound.remove(0));
    let (first_role, _) = assign_roles(first.1, second.1)?;
    let ((mut azimuth, az_addr), (mut elevation, el_addr)) = if first_role == Role::Azimuth {
        (first, second)
    } else {
        (second, first)
    };
    azimuth.set_module_address(az_addr);
    elevation.set_module_address(el_addr);
    info!(
        azimuth = %azimuth.port_name(),
        elevation = %elevation.port_name(),
        "axes bound to serial ports"
    );

    Ok(AxisDrives {
        azimuth: Box::new(azimuth),
        elevation: Box::new(elevation),
    })
}

fn candidate_ports(settings: &SerialSettings) -> Result<Vec<String>, DiscoveryError> {
    if !settings.ports.is_empty() {
        return Ok(settings.ports.clone());
    }

    let available = serialport::available_ports().map_err(DiscoveryError::Enumerate)?;
    let ports: Vec<String> = available
        .into_iter()
        .filter(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
        .map(|p| p.port_name)
        .collect();
    if ports.is_empty() {
        warn!("no USB serial ports found");
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_roles() {
        assert_eq!(
            assign_roles(1, 2).unwrap(),
            (Role::Azimuth, Role::Elevation)
        );
        assert_eq!(
            assign_roles(2, 1).unwrap(),
            (Role::Elevation, Role::Azimuth)
        );
        assert!(matches!(
            assign_roles(1, 1),
            Err(DiscoveryError::Addresses(1, 1))
        ));
        assert!(matches!(
            assign_roles(0, 3),
            Err(DiscoveryError::Addresses(0, 3))
        ));
    }
}
