use crate::units::{Degrees, Gearing};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("axis {axis}: required axis parameter {parameter} (max velocity) is missing")]
    MissingMaxVelocity { axis: String, parameter: u8 },
    #[error("axis {axis}: max velocity must be positive, got {value}")]
    NonPositiveMaxVelocity { axis: String, value: i32 },
    #[error("axis {axis}: limit-min {min} must be below limit-max {max}")]
    InvalidLimits { axis: String, min: f64, max: f64 },
    #[error("axis {axis}: loop-period must be positive")]
    InvalidLoopPeriod { axis: String },
}

/* Config */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub serial: SerialSettings,
    pub mount: MountSettings,
    pub azimuth: AxisSettings,
    pub elevation: AxisSettings,
    pub metrics: MetricsSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            mount: MountSettings::default(),
            azimuth: AxisSettings::azimuth(),
            elevation: AxisSettings::elevation(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.azimuth.validate()?;
        self.elevation.validate()
    }
}

/* Serial link settings */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SerialSettings {
    /// Candidate device paths; empty for automatic enumeration.
    pub ports: Vec<String>,
    pub baud_rate: u32,
    pub timeout_millis: u64,
    /// Replace the serial link with simulated drive modules.
    pub simulate: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: 1_000_000,
            timeout_millis: 50,
            simulate: false,
        }
    }
}

/* Mount-level settings */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MountSettings {
    pub name: String,
    /// Settle time between reaching a waypoint and capturing its frame.
    pub calibration_settle_secs: u64,
    pub site: Site,
    /// Mount-frame waypoints visited by a calibration run.
    pub calibration_points: Vec<CalibrationPoint>,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            name: "mount".to_string(),
            calibration_settle_secs: 60,
            site: Site::default(),
            calibration_points: vec![
                CalibrationPoint::new(-90., 25.),
                CalibrationPoint::new(-45., 45.),
                CalibrationPoint::new(0., 60.),
                CalibrationPoint::new(45., 45.),
                CalibrationPoint::new(90., 25.),
            ],
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Site {
    pub latitude: Degrees,
    pub longitude: Degrees,
    pub altitude: f64,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            latitude: 51.05,
            longitude: 4.36,
            altitude: 15.,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CalibrationPoint {
    pub azimuth: Degrees,
    pub elevation: Degrees,
}

impl CalibrationPoint {
    pub fn new(azimuth: Degrees, elevation: Degrees) -> Self {
        Self { azimuth, elevation }
    }
}

/* Per-axis settings */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AxisSettings {
    pub name: String,
    /// Soft limits in the mount frame, degrees.
    pub limit_min: Degrees,
    pub limit_max: Degrees,
    /// Control-loop period in seconds.
    pub loop_period: f64,
    /// Slow-telemetry poll period in seconds.
    pub poll_interval: f64,
    /// Status publish period in seconds.
    pub publish_interval: f64,
    pub gearing: Gearing,
    /// Driver axis parameters written at startup. Parameter 4 (max velocity
    /// in microsteps/s) is required.
    #[serde(with = "numeric_keys")]
    pub axis_parameters: BTreeMap<u8, i32>,
    pub position_loop: PositionLoopSettings,
    pub off_axis_loop: OffAxisLoopSettings,
    pub thresholds: Thresholds,
}

impl Default for AxisSettings {
    fn default() -> Self {
        Self::azimuth()
    }
}

impl AxisSettings {
    pub const MAX_VELOCITY_PARAMETER: u8 = 4;

    pub fn azimuth() -> Self {
        Self {
            name: "azimuth".to_string(),
            limit_min: -180.,
            limit_max: 180.,
            ..Self::base()
        }
    }

    pub fn elevation() -> Self {
        Self {
            name: "elevation".to_string(),
            limit_min: -5.,
            limit_max: 95.,
            ..Self::base()
        }
    }

    fn base() -> Self {
        let mut axis_parameters = BTreeMap::new();
        axis_parameters.insert(4, 100_000); // max velocity, microsteps/s
        axis_parameters.insert(5, 50_000); // max acceleration
        Self {
            name: String::new(),
            limit_min: 0.,
            limit_max: 0.,
            loop_period: 0.1,
            poll_interval: 2.,
            publish_interval: 1.,
            gearing: Gearing::default(),
            axis_parameters,
            position_loop: PositionLoopSettings::default(),
            off_axis_loop: OffAxisLoopSettings::default(),
            thresholds: Thresholds::default(),
        }
    }

    /// Max velocity in microsteps/s, from axis parameter 4.
    pub fn max_velocity(&self) -> Result<i32, ConfigError> {
        self.axis_parameters
            .get(&Self::MAX_VELOCITY_PARAMETER)
            .copied()
            .ok_or_else(|| ConfigError::MissingMaxVelocity {
                axis: self.name.clone(),
                parameter: Self::MAX_VELOCITY_PARAMETER,
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_velocity = self.max_velocity()?;
        if max_velocity <= 0 {
            return Err(ConfigError::NonPositiveMaxVelocity {
                axis: self.name.clone(),
                value: max_velocity,
            });
        }
        if self.limit_min >= self.limit_max {
            return Err(ConfigError::InvalidLimits {
                axis: self.name.clone(),
                min: self.limit_min,
                max: self.limit_max,
            });
        }
        if self.loop_period <= 0. {
            return Err(ConfigError::InvalidLoopPeriod {
                axis: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PositionLoopSettings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Sample period in seconds; defaults to the loop period, so the inner
    /// loop updates every control-loop iteration.
    pub sample_period: Option<f64>,
}

impl Default for PositionLoopSettings {
    fn default() -> Self {
        Self {
            kp: 5.,
            ki: 0.8,
            kd: 0.,
            sample_period: None,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OffAxisLoopSettings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Sample period in seconds; longer than the loop period, so the outer
    /// loop runs slower than the inner one.
    pub sample_period: f64,
    /// Integrator windup bound, degrees.
    pub windup: f64,
}

impl Default for OffAxisLoopSettings {
    fn default() -> Self {
        Self {
            kp: 0.4,
            ki: 0.05,
            kd: 0.,
            sample_period: 1.,
            windup: 0.05,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Thresholds {
    /// On-target band for the trajectory error, degrees.
    pub trajectory_on_target: Degrees,
    /// On-target band for the off-axis error, degrees.
    pub off_axis_on_target: Degrees,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            trajectory_on_target: 0.05,
            off_axis_on_target: 0.005,
        }
    }
}

/* Metrics endpoint */
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MetricsSettings {
    /// UDP line-protocol endpoint, e.g. "127.0.0.1:8094"; unset logs instead.
    pub address: Option<String>,
}

/// TOML table keys are strings; the axis-parameter map is keyed by the
/// numeric driver parameter.
mod numeric_keys {
    use serde::de::{Error, MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::collections::BTreeMap;
    use std::fmt::Formatter;

    pub fn serialize<S>(map: &BTreeMap<u8, i32>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut m = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            m.serialize_entry(&key.to_string(), value)?;
        }
        m.end()
    }

    struct NumericKeyVisitor;
    impl<'de> Visitor<'de> for NumericKeyVisitor {
        type Value = BTreeMap<u8, i32>;

        fn expecting(&self, formatter: &mut Formatter) -> core::fmt::Result {
            formatter.write_str("a map of numeric parameter ids to values")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut map = BTreeMap::new();
            while let Some((key, value)) = access.next_entry::<String, i32>()? {
                let parameter = key
                    .parse::<u8>()
                    .map_err(|_| A::Error::custom(format!("invalid parameter id: \"{key}\"")))?;
                map.insert(parameter, value);
            }
            Ok(map)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<u8, i32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(NumericKeyVisitor)
    }
}
