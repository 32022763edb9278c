//! Constant-velocity Kalman filters used to stabilize tracked points and box edges.
//!
//! Every call to `update` performs exactly one predict step followed by one correct step. The
//! first measurement after construction (or after [`Filter::reset`]) seeds the position with zero
//! velocity and zero uncertainty, so a filter starts out at the first value it sees.

use nalgebra::{Matrix2, Matrix2x4, Matrix4, Point2, RowVector2, Vector2, Vector4};
use serde::{Deserialize, Serialize};

use crate::geometry::Rect;

use super::Filter;

/// Diagonal noise covariances of a velocity filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub process_noise: f32,
    pub measurement_noise: f32,
}

impl FilterParams {
    /// Tight filtering for fine landmark points.
    pub const POINTS: Self = Self {
        process_noise: 1e-4,
        measurement_noise: 1e-4,
    };

    /// Looser filtering for bounding box edges.
    pub const EDGES: Self = Self {
        process_noise: 1e-3,
        measurement_noise: 1e-3,
    };
}

impl Default for FilterParams {
    fn default() -> Self {
        Self::POINTS
    }
}

/// Kalman filter over the state `[x, y, vx, vy]` with a constant-velocity transition.
#[derive(Debug, Clone)]
pub struct PointVelocityFilter {
    params: FilterParams,
    state: Vector4<f32>,
    covariance: Matrix4<f32>,
    seeded: bool,
}

impl PointVelocityFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            params,
            state: Vector4::zeros(),
            covariance: Matrix4::zeros(),
            seeded: false,
        }
    }

    /// Feeds a measurement into the filter and returns the corrected position estimate.
    pub fn update(&mut self, measurement: Point2<f32>) -> Point2<f32> {
        if !self.seeded {
            self.seeded = true;
            self.state = Vector4::new(measurement.x, measurement.y, 0.0, 0.0);
            self.covariance = Matrix4::zeros();
            return measurement;
        }

        #[rustfmt::skip]
        let transition = Matrix4::new(
            1.0, 0.0, 1.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let observation = Matrix2x4::<f32>::identity();

        // predict
        self.state = transition * self.state;
        self.covariance = transition * self.covariance * transition.transpose()
            + Matrix4::identity() * self.params.process_noise;

        // correct
        let innovation_cov = observation * self.covariance * observation.transpose()
            + Matrix2::identity() * self.params.measurement_noise;
        if let Some(inv) = innovation_cov.try_inverse() {
            let gain = self.covariance * observation.transpose() * inv;
            let residual = measurement.coords - observation * self.state;
            self.state += gain * residual;
            self.covariance = (Matrix4::identity() - gain * observation) * self.covariance;
        }

        self.position()
    }

    /// Current position estimate.
    pub fn position(&self) -> Point2<f32> {
        Point2::new(self.state.x, self.state.y)
    }

    /// Current velocity estimate, in units per update.
    pub fn velocity(&self) -> Vector2<f32> {
        Vector2::new(self.state.z, self.state.w)
    }

    /// Forgets all state. The next measurement seeds the filter again.
    pub fn reset(&mut self) {
        *self = Self::new(self.params);
    }
}

impl Default for PointVelocityFilter {
    fn default() -> Self {
        Self::new(FilterParams::POINTS)
    }
}

impl Filter<Point2<f32>> for PointVelocityFilter {
    fn push(&mut self, value: Point2<f32>) -> Point2<f32> {
        self.update(value)
    }

    fn reset(&mut self) {
        PointVelocityFilter::reset(self);
    }
}

/// 1-D Kalman filter over the state `[x, vx]`, used for bounding box edges.
#[derive(Debug, Clone)]
pub struct EdgeVelocityFilter {
    params: FilterParams,
    state: Vector2<f32>,
    covariance: Matrix2<f32>,
    seeded: bool,
}

impl EdgeVelocityFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            params,
            state: Vector2::zeros(),
            covariance: Matrix2::zeros(),
            seeded: false,
        }
    }

    pub fn update(&mut self, measurement: f32) -> f32 {
        if !self.seeded {
            self.seeded = true;
            self.state = Vector2::new(measurement, 0.0);
            self.covariance = Matrix2::zeros();
            return measurement;
        }

        let transition = Matrix2::new(1.0, 1.0, 0.0, 1.0);
        let observation = RowVector2::new(1.0, 0.0);

        self.state = transition * self.state;
        self.covariance = transition * self.covariance * transition.transpose()
            + Matrix2::identity() * self.params.process_noise;

        let innovation_cov = self.covariance[(0, 0)] + self.params.measurement_noise;
        if innovation_cov != 0.0 {
            let gain = self.covariance.column(0) / innovation_cov;
            self.state += gain * (measurement - self.state.x);
            self.covariance = (Matrix2::identity() - gain * observation) * self.covariance;
        }

        self.state.x
    }

    pub fn velocity(&self) -> f32 {
        self.state.y
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.params);
    }
}

impl Default for EdgeVelocityFilter {
    fn default() -> Self {
        Self::new(FilterParams::EDGES)
    }
}

impl Filter<f32> for EdgeVelocityFilter {
    fn push(&mut self, value: f32) -> f32 {
        self.update(value)
    }

    fn reset(&mut self) {
        EdgeVelocityFilter::reset(self);
    }
}

/// Stabilizes a rectangle by filtering each of its 4 edges independently.
#[derive(Debug, Clone)]
pub struct RectFilter {
    edges: [EdgeVelocityFilter; 4],
}

impl RectFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            edges: [(); 4].map(|_| EdgeVelocityFilter::new(params)),
        }
    }
}

impl Default for RectFilter {
    fn default() -> Self {
        Self::new(FilterParams::EDGES)
    }
}

impl Filter<Rect> for RectFilter {
    fn push(&mut self, rect: Rect) -> Rect {
        let [left, top, right, bottom] = &mut self.edges;
        let tl = rect.top_left();
        let br = rect.bottom_right();
        Rect::from_corners(
            Point2::new(left.update(tl.x), top.update(tl.y)),
            Point2::new(right.update(br.x), bottom.update(br.y)),
        )
    }

    fn reset(&mut self) {
        for edge in &mut self.edges {
            edge.reset();
        }
    }
}
