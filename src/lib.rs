//! Control core of an optical ground station mount: two-axis closed-loop
//! motion control with optical (off-axis) feedback, pointing-model
//! correction and limit supervision.
//!
//! The HTTP command surface, scheduler, camera pipelines and ephemeris
//! computation are external collaborators; see [`collab`] for the
//! interfaces this core consumes.

pub mod collab;
pub mod config;
pub mod drive;
pub mod metrics;
pub mod mount_control;
pub mod periodic;
pub mod pointing_model;
pub mod units;

pub use config::Config;
pub use mount_control::{
    Axis, AxisKind, AxisState, AxisStatus, CommandResult, Mount, MountError, MountStatus,
    PARK_POSITION,
};
pub use units::{Degrees, DegreesPerSecond};
