//! Landmark estimation on cropped regions of interest.
//!
//! A [`LandmarkStage`] runs a landmark network on a [`RoiImage`] and restores the resulting points
//! from model space to sensor space:
//!
//! ```text
//! sensor = roi.transform * scale(roi_w / model_w, roi_h / model_h) * model
//! ```
//!
//! Point order and count are a fixed contract with the paired network and are never changed.

use image::imageops;
use itertools::Itertools;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::filter::{FilterParams, PointVelocityFilter};
use crate::geometry::{Rect, Transform};
use crate::nn::{ColorMapper, ImageEncoder, Inferer, InputShape};
use crate::num::sigmoid;
use crate::roi::RoiImage;
use crate::timer::Timer;
use crate::{Error, Result};

/// Landmark indices into the 468-point face mesh.
pub mod mesh {
    pub const NUM_LANDMARKS: usize = 468;

    /// Contour and brow of the left eye (from the perspective of the camera).
    pub const LEFT_EYE_REGION: [usize; 28] = [
        33, 7, 163, 144, 145, 153, 154, 155, 133, 246, 161, 160, 159, 158, 157, 173, // contour
        46, 53, 52, 65, 55, 70, 63, 105, 66, 107, 33, 133, // brow
    ];

    /// Contour and brow of the right eye (from the perspective of the camera).
    pub const RIGHT_EYE_REGION: [usize; 28] = [
        263, 249, 390, 373, 374, 380, 381, 382, 362, 466, 388, 387, 386, 385, 384, 398, // contour
        276, 283, 282, 295, 285, 300, 293, 334, 296, 336, 263, 362, // brow
    ];

    /// Top, bottom, left and right of the inner lip contour.
    pub const MOUTH: [usize; 4] = [13, 14, 62, 292];

    /// Inner eye corners, nose tip, mouth corners and chin, used to solve the head pose.
    pub const POSE: [usize; 6] = [173, 398, 1, 43, 273, 199];
}

/// Landmark indices of the hand skeleton.
pub mod hand {
    pub const NUM_LANDMARKS: usize = 21;

    pub const THUMB_IP: usize = 3;
    pub const THUMB_TIP: usize = 4;

    /// First (PIP) joint of the index, middle, ring and little finger. The next two landmarks of
    /// each finger are its DIP joint and its tip.
    pub const FINGER_PIP: [usize; 4] = [6, 10, 14, 18];
}

/// Landmark indices into the eye contour output of the iris network.
pub mod eye {
    pub const NUM_EYE_LANDMARKS: usize = 71;
    pub const NUM_IRIS_LANDMARKS: usize = 5;

    /// Top, bottom, left and right of the eye opening.
    pub const OPENING: [usize; 4] = [12, 4, 1, 15];
}

/// Applies a homogeneous transform to a point, keeping any depth component unchanged.
pub trait Restore: Copy {
    fn restore(self, transform: &Transform) -> Self;
}

impl Restore for Point2<f32> {
    fn restore(self, transform: &Transform) -> Self {
        transform.apply(self)
    }
}

impl Restore for Point3<f32> {
    fn restore(self, transform: &Transform) -> Self {
        transform.apply3(self)
    }
}

/// Maps every point through `transform`, preserving count and order.
pub fn restore<P: Restore>(points: &[P], transform: &Transform) -> Vec<P> {
    points.iter().map(|p| p.restore(transform)).collect()
}

/// An ordered, fixed-length list of 3D landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct Landmarks {
    points: Vec<Point3<f32>>,
    presence: f32,
}

impl Landmarks {
    pub fn new(points: Vec<Point3<f32>>, presence: f32) -> Self {
        Self { points, presence }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Presence score reported by the network (`1.0` if the network has no presence output).
    pub fn presence(&self) -> f32 {
        self.presence
    }

    pub fn points(&self) -> &[Point3<f32>] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Point3<f32> {
        self.points[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = Point3<f32>> + '_ {
        self.points.iter().copied()
    }

    pub fn average_position(&self) -> Point3<f32> {
        let n = self.points.len().max(1) as f32;
        self.points
            .iter()
            .fold(Point3::origin(), |acc, p| acc + p.coords / n)
    }

    /// Bounding rectangle (X and Y only) of the landmarks at `indices`.
    pub fn bounding_rect(&self, indices: &[usize]) -> Option<Rect> {
        Rect::bounding(indices.iter().filter_map(|&i| self.points.get(i).map(|p| p.xy())))
    }

    /// Returns a copy with every point mapped through `transform`.
    pub fn restored(&self, transform: &Transform) -> Landmarks {
        Landmarks {
            points: restore(&self.points, transform),
            presence: self.presence,
        }
    }
}

/// One [`PointVelocityFilter`] per landmark index, applied to X and Y.
pub struct LandmarkFilterBank {
    filters: Vec<PointVelocityFilter>,
}

impl LandmarkFilterBank {
    pub fn new(params: FilterParams, num_landmarks: usize) -> Self {
        Self {
            filters: vec![PointVelocityFilter::new(params); num_landmarks],
        }
    }

    /// Filters `points` in place.
    ///
    /// # Panics
    ///
    /// Panics if `points` does not have exactly as many entries as there are filters.
    pub fn apply(&mut self, points: &mut [Point3<f32>]) {
        for (point, filter) in points.iter_mut().zip_eq(&mut self.filters) {
            let xy = filter.update(point.xy());
            point.x = xy.x;
            point.y = xy.y;
        }
    }

    pub fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }
}

/// How a network encodes subject presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceActivation {
    /// Raw logit, passed through a sigmoid.
    Logit,
    /// Already a probability in `0.0..=1.0`.
    Probability,
}

impl PresenceActivation {
    fn activate(self, raw: f32) -> f32 {
        match self {
            Self::Logit => sigmoid(raw),
            Self::Probability => raw,
        }
    }
}

/// Parameters of a landmark network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkConfig {
    pub encoder: ImageEncoder,
    pub num_landmarks: usize,
    /// Outputs that are concatenated to form the landmark list, each holding `x, y, z` triples.
    pub surface_outputs: Vec<usize>,
    /// Output holding the presence score, if the network has one.
    pub presence_output: Option<usize>,
    pub presence_activation: PresenceActivation,
    pub presence_threshold: f32,
    /// Mirror the crop before inference (and the landmarks after it).
    pub flip_horizontal: bool,
    /// Stabilize landmarks with per-point velocity filters.
    pub filter: Option<FilterParams>,
}

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self::face_mesh()
    }
}

impl LandmarkConfig {
    /// 468-point face mesh on a 192×192 crop.
    pub fn face_mesh() -> Self {
        Self {
            encoder: ImageEncoder::new(192, 192, InputShape::Nhwc, ColorMapper::linear(0.0..=1.0)),
            num_landmarks: mesh::NUM_LANDMARKS,
            surface_outputs: vec![0],
            presence_output: Some(1),
            presence_activation: PresenceActivation::Logit,
            presence_threshold: 0.5,
            flip_horizontal: false,
            filter: Some(FilterParams::POINTS),
        }
    }

    /// 21-point hand skeleton on a 224×224 crop.
    pub fn hand() -> Self {
        Self {
            encoder: ImageEncoder::new(224, 224, InputShape::Nhwc, ColorMapper::linear(0.0..=1.0)),
            num_landmarks: hand::NUM_LANDMARKS,
            presence_activation: PresenceActivation::Probability,
            ..Self::face_mesh()
        }
    }

    /// Eye contour (71 points) followed by the iris (5 points) on a 64×64 crop of a *left* eye.
    pub fn iris() -> Self {
        Self {
            encoder: ImageEncoder::new(64, 64, InputShape::Nhwc, ColorMapper::linear(0.0..=1.0)),
            num_landmarks: eye::NUM_EYE_LANDMARKS + eye::NUM_IRIS_LANDMARKS,
            surface_outputs: vec![0, 1],
            presence_output: None,
            ..Self::face_mesh()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_landmarks == 0 {
            return Err(Error::InvalidConfig("landmark count must be non-zero".into()));
        }
        if self.encoder.width == 0 || self.encoder.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "invalid landmark input size {}x{}",
                self.encoder.width, self.encoder.height
            )));
        }
        if self.surface_outputs.is_empty() {
            return Err(Error::InvalidConfig("no landmark output configured".into()));
        }
        if !(0.0..=1.0).contains(&self.presence_threshold) {
            return Err(Error::InvalidConfig(format!(
                "presence_threshold must be in range 0..=1, got {}",
                self.presence_threshold
            )));
        }
        Ok(())
    }
}

/// Runs a landmark network on ROI crops and restores its output to sensor space.
pub struct LandmarkStage {
    config: LandmarkConfig,
    inferer: Box<dyn Inferer>,
    filters: Option<LandmarkFilterBank>,
    t_infer: Timer,
}

impl LandmarkStage {
    pub fn new<I: Inferer + 'static>(config: LandmarkConfig, inferer: I) -> Self {
        let filters = config
            .filter
            .map(|params| LandmarkFilterBank::new(params, config.num_landmarks));
        Self {
            config,
            inferer: Box::new(inferer),
            filters,
            t_infer: Timer::new("landmarks"),
        }
    }

    pub fn config(&self) -> &LandmarkConfig {
        &self.config
    }

    /// Computes the transform from model pixels to sensor pixels for `roi`.
    pub fn model_to_sensor(&self, roi: &RoiImage) -> Transform {
        let encoder = &self.config.encoder;
        *roi.transform()
            * Transform::scale(
                roi.width() as f32 / encoder.width as f32,
                roi.height() as f32 / encoder.height as f32,
            )
    }

    /// Estimates landmarks on `roi`.
    ///
    /// Returns `Ok(None)` if the network reports that no subject is present. Velocity filters are
    /// only updated when landmarks are returned.
    pub fn estimate(&mut self, roi: &RoiImage) -> Result<Option<Landmarks>> {
        let tensor = if self.config.flip_horizontal {
            self.config
                .encoder
                .encode(&imageops::flip_horizontal(roi.image()))
        } else {
            self.config.encoder.encode(roi.image())
        };
        let outputs = self
            .t_infer
            .time(|| self.inferer.invoke(&tensor))
            .map_err(Error::InferenceFailure)?;

        let presence = match self.config.presence_output {
            Some(index) => {
                let raw = outputs
                    .flat(index)
                    .map_err(Error::InferenceFailure)?
                    .first()
                    .copied()
                    .ok_or(Error::mismatch("presence output", 1, 0))?;
                let presence = self.config.presence_activation.activate(raw);
                if presence < self.config.presence_threshold {
                    log::trace!("landmark presence {presence} below threshold");
                    return Ok(None);
                }
                presence
            }
            None => 1.0,
        };

        let mut surface = Vec::with_capacity(self.config.num_landmarks * 3);
        for &index in &self.config.surface_outputs {
            surface.extend(outputs.flat(index).map_err(Error::InferenceFailure)?);
        }
        if surface.len() != self.config.num_landmarks * 3 {
            return Err(Error::mismatch(
                "landmark surface",
                self.config.num_landmarks * 3,
                surface.len(),
            ));
        }

        let model_width = self.config.encoder.width as f32;
        let flip = self.config.flip_horizontal;
        let transform = self.model_to_sensor(roi);
        let mut points = surface
            .chunks_exact(3)
            .map(|c| {
                let x = if flip { model_width - c[0] } else { c[0] };
                transform.apply3(Point3::new(x, c[1], c[2]))
            })
            .collect::<Vec<_>>();

        if let Some(filters) = &mut self.filters {
            filters.apply(&mut points);
        }

        Ok(Some(Landmarks::new(points, presence)))
    }

    /// Clears the state of all velocity filters.
    pub fn reset_filters(&mut self) {
        if let Some(filters) = &mut self.filters {
            filters.reset();
        }
    }

    pub fn timers(&self) -> impl IntoIterator<Item = &Timer> + '_ {
        [&self.t_infer]
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use image::RgbImage;

    use super::*;
    use crate::detection::Detection;
    use crate::nn::{FnInferer, Outputs, Tensor};
    use crate::roi::{RoiConfig, RoiTransformer};

    #[test]
    fn restore_keeps_depth_and_order() {
        let t = Transform::translation(10.0, 20.0) * Transform::scale(2.0, 2.0);
        let points = [Point3::new(1.0, 1.0, -3.0), Point3::new(0.0, 5.0, 7.0)];
        let out = restore(&points, &t);
        assert_eq!(out, [Point3::new(12.0, 22.0, -3.0), Point3::new(10.0, 30.0, 7.0)]);

        let out = restore(&[Point2::new(0.0, 0.0)], &t);
        assert_eq!(out, [Point2::new(10.0, 20.0)]);
    }

    #[test]
    fn restore_inverts_random_affine() {
        let mut rng = fastrand::Rng::with_seed(1234);
        for _ in 0..200 {
            let t = Transform::translation(rng.f32() * 200.0 - 100.0, rng.f32() * 200.0 - 100.0)
                * Transform::rotation_about(
                    Point2::new(rng.f32() * 50.0, rng.f32() * 50.0),
                    rng.f32() * 360.0 - 180.0,
                )
                * Transform::scale(0.5 + rng.f32() * 2.0, 0.5 + rng.f32() * 2.0);
            let inv = t.inverse().unwrap();
            let p = Point2::new(rng.f32(), rng.f32());

            let out = restore(&[inv.apply(p)], &t);
            assert_abs_diff_eq!(out[0], p, epsilon = 1e-3);
        }
    }

    #[test]
    fn filter_bank() {
        let mut bank = LandmarkFilterBank::new(FilterParams::POINTS, 2);
        let mut points = [Point3::new(1.0, 2.0, 3.0), Point3::new(4.0, 5.0, 6.0)];
        bank.apply(&mut points);
        assert_eq!(points, [Point3::new(1.0, 2.0, 3.0), Point3::new(4.0, 5.0, 6.0)]);

        let mut moved = [Point3::new(2.0, 2.0, 9.0), Point3::new(4.0, 5.0, 6.0)];
        bank.apply(&mut moved);
        assert!(moved[0].x > 1.0 && moved[0].x < 2.0);
        assert_eq!(moved[0].z, 9.0);
        assert_eq!(moved[1], Point3::new(4.0, 5.0, 6.0));
    }

    fn stage(config: LandmarkConfig, surface: Vec<f32>, presence: f32) -> LandmarkStage {
        let inferer = FnInferer(move |_: &Tensor| -> anyhow::Result<Outputs> {
            let surface = Tensor::from_shape_vec(vec![1, surface.len()], surface.clone())?;
            let presence = Tensor::from_shape_vec(vec![1, 1], vec![presence])?;
            Ok(Outputs::from(vec![surface, presence]))
        });
        LandmarkStage::new(config, inferer)
    }

    fn roi(image: &RgbImage) -> RoiImage {
        let det = Detection::new(1.0, Rect::from_top_left(0.25, 0.25, 0.5, 0.5));
        RoiTransformer::new(RoiConfig {
            margin_x: 0.0,
            margin_y: 0.0,
            ..RoiConfig::face_box()
        })
        .crop(image, &det, None)
        .unwrap()
    }

    #[test]
    fn restores_model_points() {
        let config = LandmarkConfig {
            encoder: ImageEncoder::new(10, 10, InputShape::Nhwc, ColorMapper::default()),
            num_landmarks: 2,
            filter: None,
            ..LandmarkConfig::face_mesh()
        };
        let mut stage = stage(config, vec![0.0, 0.0, 1.0, 5.0, 10.0, -2.0], 10.0);
        let image = RgbImage::new(200, 100);

        // 100x50 crop at (50, 25)
        let lm = stage.estimate(&roi(&image)).unwrap().unwrap();
        assert_eq!(lm.len(), 2);
        assert_abs_diff_eq!(lm.get(0), Point3::new(50.0, 25.0, 1.0), epsilon = 1e-4);
        assert_abs_diff_eq!(lm.get(1), Point3::new(100.0, 75.0, -2.0), epsilon = 1e-4);
    }

    #[test]
    fn flips_model_points() {
        let config = LandmarkConfig {
            encoder: ImageEncoder::new(10, 10, InputShape::Nhwc, ColorMapper::default()),
            num_landmarks: 1,
            surface_outputs: vec![0],
            presence_output: None,
            flip_horizontal: true,
            filter: None,
            ..LandmarkConfig::iris()
        };
        let mut stage = stage(config, vec![2.0, 0.0, 0.0], 0.0);
        let image = RgbImage::new(200, 100);

        let lm = stage.estimate(&roi(&image)).unwrap().unwrap();
        // x = 10 - 2 = 8 model pixels, scaled by 10
        assert_abs_diff_eq!(lm.get(0), Point3::new(130.0, 25.0, 0.0), epsilon = 1e-4);
    }

    #[test]
    fn absent_subject() {
        let config = LandmarkConfig {
            num_landmarks: 1,
            ..LandmarkConfig::face_mesh()
        };
        let mut stage = stage(config, vec![1.0, 1.0, 1.0], -3.0);
        let image = RgbImage::new(64, 64);
        assert!(stage.estimate(&roi(&image)).unwrap().is_none());
    }

    #[test]
    fn hand_presence_is_a_probability() {
        let config = LandmarkConfig {
            num_landmarks: 1,
            ..LandmarkConfig::hand()
        };
        let image = RgbImage::new(64, 64);

        let mut absent = stage(config.clone(), vec![1.0, 1.0, 1.0], 0.05);
        assert!(absent.estimate(&roi(&image)).unwrap().is_none());

        let mut present = stage(config, vec![1.0, 1.0, 1.0], 0.9);
        let lm = present.estimate(&roi(&image)).unwrap().unwrap();
        assert_abs_diff_eq!(lm.presence(), 0.9);
    }

    #[test]
    fn surface_length_mismatch() {
        let mut stage = stage(LandmarkConfig::face_mesh(), vec![0.0; 30], 5.0);
        let image = RgbImage::new(64, 64);
        assert!(matches!(
            stage.estimate(&roi(&image)),
            Err(Error::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn inference_failure() {
        let mut stage = LandmarkStage::new(
            LandmarkConfig {
                num_landmarks: 1,
                presence_output: None,
                ..LandmarkConfig::face_mesh()
            },
            FnInferer(|_: &Tensor| -> anyhow::Result<Outputs> {
                anyhow::bail!("backend exploded")
            }),
        );
        let image = RgbImage::new(64, 64);
        assert!(matches!(
            stage.estimate(&roi(&image)),
            Err(Error::InferenceFailure(_))
        ));
    }

    #[test]
    fn bounding_rect() {
        let lm = Landmarks::new(
            vec![
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(5.0, 3.0, 0.0),
                Point3::new(-2.0, 8.0, 0.0),
            ],
            1.0,
        );
        assert_eq!(
            lm.bounding_rect(&[0, 1]),
            Some(Rect::from_top_left(1.0, 1.0, 4.0, 2.0))
        );
        assert_eq!(lm.bounding_rect(&[7]), None);
    }
}
