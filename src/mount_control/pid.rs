use std::time::{Duration, Instant};

/// P/I/D contributions of the most recent effective update.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct PidTerms {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

/// Discrete PID controller with a fixed sample-time gate.
///
/// `update` is a no-op while less than the sample period has elapsed since
/// the last effective update, so the loop calling it can run faster than the
/// controller's cadence. The derivative acts on the measurement rather than
/// the error, and the integrator is clamped so that `|ki * integral|` never
/// exceeds the windup bound.
#[derive(Debug)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    sample_period: Duration,
    windup: f64,
    pub setpoint: f64,
    integral: f64,
    last_input: Option<f64>,
    last_tick: Option<Instant>,
    p_term: f64,
    d_term: f64,
    output: f64,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64, sample_period: Duration, windup: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            sample_period,
            windup: windup.abs(),
            setpoint: 0.,
            integral: 0.,
            last_input: None,
            last_tick: None,
            p_term: 0.,
            d_term: 0.,
            output: 0.,
        }
    }

    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn update(&mut self, input: f64) -> f64 {
        self.update_at(input, Instant::now())
    }

    pub(crate) fn update_at(&mut self, input: f64, now: Instant) -> f64 {
        let dt = match self.last_tick {
            // First effective update after construction or clear().
            None => self.sample_period,
            Some(last) => {
                let elapsed = now.duration_since(last);
                if elapsed < self.sample_period {
                    return self.output;
                }
                elapsed
            }
        };
        let dt = dt.as_secs_f64();

        let error = self.setpoint - input;
        // Derivative on measurement avoids the kick on setpoint changes.
        let d_input = input - self.last_input.unwrap_or(input);

        self.integral += error * dt;
        if self.ki != 0. {
            let bound = self.windup / self.ki.abs();
            self.integral = self.integral.clamp(-bound, bound);
        }

        self.p_term = self.kp * error;
        self.d_term = if dt > 0. { self.kd * d_input / dt } else { 0. };
        self.output = self.p_term + self.ki * self.integral - self.d_term;

        self.last_input = Some(input);
        self.last_tick = Some(now);
        self.output
    }

    /// Resets accumulators and held output; the next update is effective
    /// immediately.
    pub fn clear(&mut self) {
        self.integral = 0.;
        self.last_input = None;
        self.last_tick = None;
        self.p_term = 0.;
        self.d_term = 0.;
        self.output = 0.;
    }

    pub fn output(&self) -> f64 {
        self.output
    }

    pub fn terms(&self) -> PidTerms {
        PidTerms {
            p: self.p_term,
            i: self.ki * self.integral,
            d: self.d_term,
        }
    }

    #[cfg(test)]
    pub(crate) fn integral(&self) -> f64 {
        self.integral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_float_eq::*;

    const TS: Duration = Duration::from_millis(100);

    #[test]
    fn test_proportional_response() {
        let mut pid = Pid::new(2., 0., 0., TS, 1.);
        pid.setpoint = 1.;
        let out = pid.update_at(0., Instant::now());
        assert_float_absolute_eq!(out, 2., 1e-12);
    }

    #[test]
    fn test_sample_gate_holds_output() {
        let mut pid = Pid::new(1., 0.5, 0., TS, 10.);
        pid.setpoint = 1.;
        let t0 = Instant::now();
        let first = pid.update_at(0., t0);
        // Too early: output held, integrator untouched.
        let early = pid.update_at(0.5, t0 + Duration::from_millis(10));
        assert_eq!(early, first);
        assert_float_absolute_eq!(pid.integral(), 0.1, 1e-12);
        // On the next sample tick the new measurement takes effect.
        let later = pid.update_at(0.5, t0 + TS);
        assert!(later != first);
    }

    #[test]
    fn test_windup_clamp() {
        let mut pid = Pid::new(0., 2., 0., TS, 0.5);
        pid.setpoint = 100.;
        let t0 = Instant::now();
        for n in 0..200u32 {
            pid.update_at(0., t0 + TS * n);
            assert!((pid.ki * pid.integral()).abs() <= 0.5 + 1e-12);
        }
        assert_float_absolute_eq!(pid.terms().i, 0.5, 1e-12);
    }

    #[test]
    fn test_derivative_on_measurement() {
        let mut pid = Pid::new(0., 0., 1., TS, 1.);
        pid.setpoint = 0.;
        let t0 = Instant::now();
        pid.update_at(0., t0);
        // Setpoint step alone produces no derivative action.
        pid.setpoint = 10.;
        let out = pid.update_at(0., t0 + TS);
        assert_float_absolute_eq!(out, 0., 1e-12);
        // A rising measurement produces a negative correction.
        let out = pid.update_at(0.5, t0 + 2 * TS);
        assert!(out < 0.);
    }

    #[test]
    fn test_clear_resets_accumulators() {
        let mut pid = Pid::new(1., 1., 1., TS, 5.);
        pid.setpoint = 3.;
        let t0 = Instant::now();
        pid.update_at(0., t0);
        pid.update_at(1., t0 + TS);
        assert!(pid.integral() != 0.);
        pid.clear();
        assert_eq!(pid.integral(), 0.);
        assert_eq!(pid.output(), 0.);
        assert_eq!(pid.terms(), PidTerms::default());
    }

    #[test]
    fn test_positive_error_positive_correction() {
        let mut pid = Pid::new(1., 0.1, 0.01, TS, 1.);
        pid.setpoint = 5.;
        let t0 = Instant::now();
        let mut measurement = 0.;
        for n in 0..10u32 {
            let out = pid.update_at(measurement, t0 + TS * n);
            assert!(out > 0.);
            measurement += out * 0.01;
        }
    }
}
