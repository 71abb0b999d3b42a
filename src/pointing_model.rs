//! Alt-az pointing model: the transform between the celestial frame and the
//! mount frame that absorbs mechanical misalignment, non-orthogonality and
//! flexure.

use crate::units::Degrees;
use parking_lot::RwLock;
use thiserror::Error;

/// Number of model coefficients, in order: azimuth index error, elevation
/// index error, azimuth-axis tilt north, azimuth-axis tilt west, az/el
/// non-perpendicularity, collimation error, tube flexure (cos term),
/// tube flexure (sin term). All in degrees.
pub const NUM_TERMS: usize = 8;

/// Iterative inversion of `apply` converges to this tolerance (degrees) for
/// coefficient magnitudes below ~0.5 deg and elevations away from the zenith.
pub const REVERSE_TOLERANCE: Degrees = 1e-9;

const REVERSE_ITERATIONS: usize = 6;

/// Elevation used for the tan/sec terms is kept this far from +-90 deg.
const EL_GUARD: Degrees = 89.9;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("expected {NUM_TERMS} model coefficients, got {0}")]
    WrongLength(usize),
    #[error("model coefficient {0} is not finite")]
    NonFinite(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointingModel {
    coefficients: [f64; NUM_TERMS],
}

impl PointingModel {
    pub fn from_coefficients(coefficients: &[f64]) -> Result<Self, ModelError> {
        if coefficients.len() != NUM_TERMS {
            return Err(ModelError::WrongLength(coefficients.len()));
        }
        if let Some(index) = coefficients.iter().position(|c| !c.is_finite()) {
            return Err(ModelError::NonFinite(index));
        }
        let mut c = [0.; NUM_TERMS];
        c.copy_from_slice(coefficients);
        Ok(Self { coefficients: c })
    }

    pub fn coefficients(&self) -> &[f64; NUM_TERMS] {
        &self.coefficients
    }

    /// Pointing correction at the given celestial direction.
    fn correction(&self, az: Degrees, el: Degrees) -> (Degrees, Degrees) {
        let [ia, ie, an, aw, npae, ca, tf_cos, tf_sin] = self.coefficients;
        let az_r = az.to_radians();
        let el_r = el.clamp(-EL_GUARD, EL_GUARD).to_radians();
        let (sin_az, cos_az) = az_r.sin_cos();
        let tan_el = el_r.tan();

        let d_az = ia + an * sin_az * tan_el + aw * cos_az * tan_el + npae * tan_el
            + ca / el_r.cos();
        let d_el =
            ie + an * cos_az - aw * sin_az + tf_cos * el_r.cos() + tf_sin * el_r.sin();
        (d_az, d_el)
    }

    /// Celestial -> mount.
    pub fn apply(&self, az: Degrees, el: Degrees) -> (Degrees, Degrees) {
        let (d_az, d_el) = self.correction(az, el);
        (az + d_az, el + d_el)
    }

    /// Mount -> celestial. Fixed-point inversion of [`apply`]; see
    /// [`REVERSE_TOLERANCE`].
    ///
    /// [`apply`]: PointingModel::apply
    pub fn reverse(&self, az: Degrees, el: Degrees) -> (Degrees, Degrees) {
        let (mut cel_az, mut cel_el) = (az, el);
        for _ in 0..REVERSE_ITERATIONS {
            let (d_az, d_el) = self.correction(cel_az, cel_el);
            let (next_az, next_el) = (az - d_az, el - d_el);
            if (next_az - cel_az).abs() < REVERSE_TOLERANCE
                && (next_el - cel_el).abs() < REVERSE_TOLERANCE
            {
                return (next_az, next_el);
            }
            cel_az = next_az;
            cel_el = next_el;
        }
        (cel_az, cel_el)
    }
}

/// Shared holder for the active pointing model.
///
/// Inactive (no model loaded) means both transforms are the identity. The
/// model is only ever replaced wholesale, never mutated in place, so readers
/// see either the previous or the new coefficient set.
#[derive(Debug, Default)]
pub struct ModelStore {
    model: RwLock<Option<PointingModel>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and atomically activates a coefficient set. A rejected set
    /// leaves the previous model state unchanged.
    pub fn set_coefficients(&self, coefficients: &[f64]) -> Result<(), ModelError> {
        let model = PointingModel::from_coefficients(coefficients)?;
        *self.model.write() = Some(model);
        Ok(())
    }

    pub fn clear(&self) {
        *self.model.write() = None;
    }

    pub fn active(&self) -> bool {
        self.model.read().is_some()
    }

    /// Celestial -> mount; identity when no model is active.
    pub fn apply(&self, az: Degrees, el: Degrees) -> (Degrees, Degrees) {
        match &*self.model.read() {
            Some(model) => model.apply(az, el),
            None => (az, el),
        }
    }

    /// Mount -> celestial; identity when no model is active.
    pub fn reverse(&self, az: Degrees, el: Degrees) -> (Degrees, Degrees) {
        match &*self.model.read() {
            Some(model) => model.reverse(az, el),
            None => (az, el),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_float_eq::*;

    const COEFFS: [f64; NUM_TERMS] = [
        0.0318, 0.0086, -0.0169, 0.0042, -0.0121, 0.0063, -0.0075, 0.0021,
    ];

    #[test]
    fn test_identity_when_inactive() {
        let store = ModelStore::new();
        assert!(!store.active());
        assert_eq!(store.apply(123.4, 56.7), (123.4, 56.7));
        assert_eq!(store.reverse(123.4, 56.7), (123.4, 56.7));
    }

    #[test]
    fn test_apply_offsets_index_errors() {
        let model = PointingModel::from_coefficients(&COEFFS).unwrap();
        let (az, el) = model.apply(180., 45.);
        assert!((az - 180.).abs() > 1e-4);
        assert!((el - 45.).abs() > 1e-4);
    }

    #[test]
    fn test_reverse_round_trip() {
        let model = PointingModel::from_coefficients(&COEFFS).unwrap();
        for (az, el) in [(0., 10.), (45., 30.), (180., 60.), (270.5, 5.2), (359., 85.)] {
            let (m_az, m_el) = model.apply(az, el);
            let (c_az, c_el) = model.reverse(m_az, m_el);
            assert_float_absolute_eq!(c_az, az, 1e-8);
            assert_float_absolute_eq!(c_el, el, 1e-8);
        }
    }

    #[test]
    fn test_rejected_coefficients_preserve_state() {
        let store = ModelStore::new();
        store.set_coefficients(&COEFFS).unwrap();
        let before = store.apply(45., 30.);

        assert_eq!(
            store.set_coefficients(&[1., 2., 3.]),
            Err(ModelError::WrongLength(3))
        );
        let mut bad = COEFFS;
        bad[5] = f64::NAN;
        assert_eq!(store.set_coefficients(&bad), Err(ModelError::NonFinite(5)));

        assert!(store.active());
        assert_eq!(store.apply(45., 30.), before);
    }

    #[test]
    fn test_clear_deactivates() {
        let store = ModelStore::new();
        store.set_coefficients(&COEFFS).unwrap();
        store.clear();
        assert!(!store.active());
        assert_eq!(store.apply(45., 30.), (45., 30.));
    }
}
