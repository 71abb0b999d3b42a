use serde::{Deserialize, Serialize};

pub type Degrees = f64;
pub type DegreesPerSecond = f64;
pub type Microsteps = i32;

/// Mechanical reduction between a stepper motor and a mount axis.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Gearing {
    /// Microsteps per full motor step.
    pub microsteps: f64,
    /// Full steps per motor revolution.
    pub pulses_per_rev: f64,
    /// Motor revolutions per revolution about the telescope axis.
    pub axis_ratio: f64,
}

impl Default for Gearing {
    fn default() -> Self {
        Self {
            microsteps: 64.,
            pulses_per_rev: 200.,
            axis_ratio: 720.,
        }
    }
}

impl Gearing {
    pub fn degrees_per_microstep(&self) -> Degrees {
        360. / (self.microsteps * self.pulses_per_rev * self.axis_ratio)
    }

    pub fn converter(&self) -> UnitConverter {
        UnitConverter {
            degrees_per_microstep: self.degrees_per_microstep(),
        }
    }
}

/// Microstep/degree conversion for one axis.
#[derive(Debug, Copy, Clone)]
pub struct UnitConverter {
    degrees_per_microstep: Degrees,
}

impl UnitConverter {
    pub fn microsteps_to_degrees(&self, microsteps: Microsteps) -> Degrees {
        microsteps as f64 * self.degrees_per_microstep
    }

    pub fn degrees_to_microsteps(&self, degrees: Degrees) -> Microsteps {
        (degrees / self.degrees_per_microstep).round() as Microsteps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_float_eq::*;

    fn converter() -> UnitConverter {
        Gearing::default().converter()
    }

    #[test]
    fn test_degrees_per_microstep() {
        // 64 * 200 * 720 microsteps per axis revolution
        assert_float_absolute_eq!(converter().microsteps_to_degrees(9_216_000), 360., 1e-9);
    }

    #[test]
    fn test_degrees_to_microsteps() {
        let c = converter();
        assert_eq!(c.degrees_to_microsteps(45.), 1_152_000);
        assert_eq!(c.degrees_to_microsteps(30.), 768_000);
        assert_eq!(c.degrees_to_microsteps(-45.), -1_152_000);
        assert_eq!(c.degrees_to_microsteps(0.), 0);
    }

    #[test]
    fn test_round_trip_within_one_microstep() {
        let c = converter();
        for d in [-179.99, -45.0, -0.001, 0.0, 0.3333, 30.0, 89.9, 179.99] {
            let back = c.microsteps_to_degrees(c.degrees_to_microsteps(d));
            assert!((back - d).abs() <= c.degrees_per_microstep);
        }
    }
}
