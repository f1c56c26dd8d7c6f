//! one pole low pass used to smooth gains and meter readings
use num::{Float, FromPrimitive, Zero};
use std::fmt::{self, Display};

use crate::utils::get_coef;

pub struct SmoothingFilter<T> {
    coef: T,
    last_output: T,
}

impl<T: Float + FromPrimitive> SmoothingFilter<T> {
    /// `time_const` in seconds, `rate` is how many times per second `get` is called
    pub fn build(time_const: T, rate: T) -> SmoothingFilter<T> {
        SmoothingFilter {
            coef: get_coef(time_const, rate),
            last_output: Zero::zero(),
        }
    }

    pub fn get(&mut self, input: T) -> T {
        self.last_output = self.last_output + self.coef * (input - self.last_output);
        self.last_output
    }

    /// jump straight to a value, skipping the ramp
    pub fn reset(&mut self, value: T) {
        self.last_output = value;
    }

    pub fn get_last_output(&self) -> T {
        self.last_output
    }
}

impl<T: Float + FromPrimitive + Display> Display for SmoothingFilter<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ coef: {}, last_output: {} }}",
            self.coef, self.last_output
        )
    }
}

#[cfg(test)]
mod test_smoothing_filter {
    use super::*;

    #[test]
    fn ramps_toward_input() {
        let mut filter: SmoothingFilter<f64> = SmoothingFilter::build(0.01, 1000.0);
        assert_eq!(filter.get(0.0), 0.0);
        let mut last = 0.0;
        for _ in 0..20 {
            let v = filter.get(1.0);
            assert!(v > last && v < 1.0);
            last = v;
        }
        for _ in 0..1000 {
            filter.get(1.0);
        }
        assert!((filter.get_last_output() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn reset_jumps() {
        let mut filter: SmoothingFilter<f32> = SmoothingFilter::build(2.5, 100.0);
        filter.reset(0.5);
        assert_eq!(filter.get_last_output(), 0.5);
        println!("{}", filter);
    }
}
