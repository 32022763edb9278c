//! Data filtering and smoothing.

pub mod kalman;

pub use kalman::{EdgeVelocityFilter, FilterParams, PointVelocityFilter, RectFilter};

/// A filter for values of type `V`.
pub trait Filter<V> {
    /// Adds a new value to the filter, returning the filtered value.
    fn push(&mut self, value: V) -> V;

    /// Resets the accumulated history and state of the filter to be identical to the state just
    /// after construction.
    fn reset(&mut self);
}

impl<V> Filter<V> for Box<dyn Filter<V> + Send> {
    fn push(&mut self, value: V) -> V {
        (**self).push(value)
    }

    fn reset(&mut self) {
        (**self).reset();
    }
}

/// Exponential Moving Average – a weighted moving average whose weight decreases exponentially.
///
/// This is a tunable IIR filter.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f32,
    last: Option<f32>,
}

impl Ema {
    /// Creates a new Exponential Moving Average calculator.
    ///
    /// The `alpha` parameter must be between 0.0 and 1.0 and defines how strongly recent values
    /// are favored over older ones.
    pub fn new(alpha: f32) -> Self {
        assert!((0.0..=1.0).contains(&alpha));
        Self { alpha, last: None }
    }
}

impl Filter<f32> for Ema {
    fn push(&mut self, value: f32) -> f32 {
        let avg = match self.last {
            Some(last) => self.alpha * value + (1.0 - self.alpha) * last,
            None => value,
        };
        self.last = Some(avg);
        avg
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema() {
        let mut ema = Ema::new(0.5);
        assert_eq!(ema.push(4.0), 4.0);
        assert_eq!(ema.push(2.0), 3.0);
        ema.reset();
        assert_eq!(ema.push(1.0), 1.0);
    }

    #[test]
    fn boxed() {
        let mut filter: Box<dyn Filter<f32> + Send> = Box::new(Ema::new(1.0));
        assert_eq!(filter.push(3.0), 3.0);
        assert_eq!(filter.push(5.0), 5.0);
    }
}
