//! Head pose estimation from face mesh landmarks.
//!
//! The pose is recovered by solving the Perspective-N-Point problem between a small rigid face
//! model and the matching mesh landmarks, using a Direct Linear Transform on calibrated image
//! coordinates.

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Point2, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::landmark::{mesh, Landmarks};
use crate::{Error, Result};

/// Rigid face model matching [`mesh::POSE`].
///
/// Camera convention: `x` to the right, `y` down, `z` away from the camera, in roughly
/// pixel-sized units of a frontal face.
pub(crate) const MODEL_POINTS: [[f64; 3]; 6] = [
    // left eye, inner corner
    [392.0, 231.0, 25.0],
    // right eye, inner corner
    [443.0, 231.0, 25.0],
    // nose tip
    [421.0, 291.0, 0.0],
    // mouth, left corner
    [381.0, 350.0, 25.0],
    // mouth, right corner
    [449.0, 350.0, 25.0],
    // chin
    [417.0, 360.0, 24.0],
];

/// Model points are solved for at this scale to keep the linear system well conditioned.
const MODEL_SCALE: f64 = 100.0;

/// Intrinsic parameters of a pinhole camera, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub focal_length: [f32; 2],
    pub principal_point: [f32; 2],
}

impl CameraIntrinsics {
    /// Approximates an uncalibrated camera: focal length equal to the frame width, principal point
    /// in the frame center.
    pub fn for_frame(width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            focal_length: [w, w],
            principal_point: [w / 2.0, h / 2.0],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.focal_length.iter().all(|f| f.is_finite() && *f > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "focal length must be positive, got {:?}",
                self.focal_length
            )));
        }
        if !self.principal_point.iter().all(|c| c.is_finite()) {
            return Err(Error::InvalidConfig("principal point must be finite".into()));
        }
        Ok(())
    }

    fn normalize(&self, p: Point2<f32>) -> [f64; 2] {
        let [fx, fy] = self.focal_length.map(f64::from);
        let [cx, cy] = self.principal_point.map(f64::from);
        [(f64::from(p.x) - cx) / fx, (f64::from(p.y) - cy) / fy]
    }

    /// Projects a point in camera space to pixels.
    pub fn project(&self, p: Vector3<f32>) -> Point2<f32> {
        let [fx, fy] = self.focal_length;
        let [cx, cy] = self.principal_point;
        Point2::new(p.x / p.z * fx + cx, p.y / p.z * fy + cy)
    }
}

/// Orientation and position of the head relative to the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadPose {
    /// Rotation from face model space to camera space.
    pub rotation: Rotation3<f32>,
    /// Position of the face model's centroid in camera space, in model units.
    pub translation: Vector3<f32>,
}

impl HeadPose {
    /// Axis-angle form of [`HeadPose::rotation`], in radians.
    pub fn rotation_vector(&self) -> Vector3<f32> {
        self.rotation.scaled_axis()
    }
}

/// The face model's points relative to its centroid, scaled down by [`MODEL_SCALE`].
fn centered_model() -> ([[f64; 3]; 6], Vector3<f64>) {
    let centroid = MODEL_POINTS
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + Vector3::from(*p))
        / MODEL_POINTS.len() as f64;
    let points = MODEL_POINTS.map(|p| {
        let v = (Vector3::from(p) - centroid) / MODEL_SCALE;
        [v.x, v.y, v.z]
    });
    (points, centroid)
}

/// Solves the pose of the rigid face model from face mesh landmarks.
pub struct HeadPoseEstimator {
    camera: Option<CameraIntrinsics>,
    model: [[f64; 3]; 6],
    centroid: Vector3<f64>,
}

impl HeadPoseEstimator {
    /// Creates an estimator for a calibrated camera, or, if `camera` is `None`, for an uncalibrated
    /// one approximated by [`CameraIntrinsics::for_frame`].
    pub fn new(camera: Option<CameraIntrinsics>) -> Self {
        let (model, centroid) = centered_model();
        Self {
            camera,
            model,
            centroid,
        }
    }

    /// Position of the model centroid in model coordinates.
    pub fn model_centroid(&self) -> Vector3<f32> {
        self.centroid.cast()
    }

    /// Estimates the head pose from a 468-point face mesh in sensor pixels of a `width`×`height`
    /// frame.
    ///
    /// Returns `Ok(None)` if the landmarks do not determine a pose.
    pub fn estimate(&self, face: &Landmarks, width: u32, height: u32) -> Result<Option<HeadPose>> {
        if face.len() != mesh::NUM_LANDMARKS {
            return Err(Error::mismatch("face landmarks", mesh::NUM_LANDMARKS, face.len()));
        }
        let camera = self
            .camera
            .unwrap_or_else(|| CameraIntrinsics::for_frame(width, height));
        let image = mesh::POSE.map(|i| camera.normalize(face.get(i).xy()));
        Ok(self.solve(&image))
    }

    /// Solves for the pose given the model points' normalized image coordinates.
    fn solve(&self, image: &[[f64; 2]; 6]) -> Option<HeadPose> {
        let mut a = DMatrix::<f64>::zeros(self.model.len() * 2, 12);
        for (i, (&[x, y, z], &[u, v])) in self.model.iter().zip(image).enumerate() {
            let mut row = a.row_mut(i * 2);
            row.copy_from_slice(&[x, y, z, 1.0, 0.0, 0.0, 0.0, 0.0, -u * x, -u * y, -u * z, -u]);
            let mut row = a.row_mut(i * 2 + 1);
            row.copy_from_slice(&[0.0, 0.0, 0.0, 0.0, x, y, z, 1.0, -v * x, -v * y, -v * z, -v]);
        }

        // The projection matrix is the right singular vector of the smallest singular value.
        let svd = a.svd(false, true);
        let v_t = svd.v_t.as_ref()?;
        let null = v_t
            .row(svd.singular_values.imin())
            .iter()
            .copied()
            .collect::<Vec<_>>();
        let mut p = Matrix3x4::from_row_slice(&null);

        // The model centroid sits at the origin, so its depth is `p[(2, 3)]`; it must be in
        // front of the camera.
        if p[(2, 3)] < 0.0 {
            p = -p;
        }

        let m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
        let svd = m.svd(true, true);
        let rotation = svd.u? * svd.v_t?;
        if rotation.determinant() <= 0.0 {
            log::trace!("head pose solution is mirrored, discarding");
            return None;
        }
        let scale = svd.singular_values.sum() / 3.0;
        if scale <= f64::EPSILON {
            return None;
        }
        let translation = p.column(3) / scale * MODEL_SCALE;

        Some(HeadPose {
            rotation: Rotation3::from_matrix_unchecked(rotation.cast::<f32>()),
            translation: translation.cast::<f32>(),
        })
    }
}

impl Default for HeadPoseEstimator {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    use super::*;

    /// Builds a face mesh whose pose points are the projected face model.
    fn projected_mesh(
        camera: &CameraIntrinsics,
        rotation: Rotation3<f32>,
        translation: Vector3<f32>,
    ) -> Landmarks {
        let estimator = HeadPoseEstimator::new(Some(*camera));
        let mut points = vec![Point3::origin(); mesh::NUM_LANDMARKS];
        for (&index, model) in mesh::POSE.iter().zip(MODEL_POINTS) {
            let local = (Vector3::from(model).cast::<f32>()) - estimator.model_centroid();
            let p = camera.project(rotation * local + translation);
            points[index] = Point3::new(p.x, p.y, 0.0);
        }
        Landmarks::new(points, 1.0)
    }

    #[test]
    fn frontal_face() {
        let camera = CameraIntrinsics::for_frame(640, 480);
        let translation = Vector3::new(10.0, -20.0, 900.0);
        let face = projected_mesh(&camera, Rotation3::identity(), translation);

        let pose = HeadPoseEstimator::new(Some(camera))
            .estimate(&face, 640, 480)
            .unwrap()
            .unwrap();
        assert!(pose.rotation.angle() < 1e-3, "{}", pose.rotation.angle());
        assert_relative_eq!(pose.translation, translation, max_relative = 1e-3);
    }

    #[test]
    fn turned_face() {
        let camera = CameraIntrinsics::for_frame(1280, 720);
        let rotation = Rotation3::from_euler_angles(
            10.0f32.to_radians(),
            25.0f32.to_radians(),
            -5.0f32.to_radians(),
        );
        let translation = Vector3::new(-40.0, 15.0, 1200.0);
        let face = projected_mesh(&camera, rotation, translation);

        // Uncalibrated estimation derives the same intrinsics from the frame size.
        let pose = HeadPoseEstimator::default()
            .estimate(&face, 1280, 720)
            .unwrap()
            .unwrap();
        assert!(pose.rotation.angle_to(&rotation) < 1e-3);
        assert_relative_eq!(pose.translation, translation, max_relative = 1e-3);
        assert_relative_eq!(
            pose.rotation_vector(),
            rotation.scaled_axis(),
            epsilon = 1e-3
        );
    }

    #[test]
    fn collapsed_landmarks_have_no_pose() {
        let face = Landmarks::new(
            vec![Point3::new(5.0, 5.0, 0.0); mesh::NUM_LANDMARKS],
            1.0,
        );
        let pose = HeadPoseEstimator::default().estimate(&face, 64, 64).unwrap();
        assert!(pose.map_or(true, |pose| pose.translation.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn zero_focal_length_is_invalid() {
        let camera = CameraIntrinsics {
            focal_length: [0.0, 500.0],
            principal_point: [320.0, 240.0],
        };
        assert!(matches!(camera.validate(), Err(Error::InvalidConfig(_))));
        assert!(CameraIntrinsics::for_frame(640, 480).validate().is_ok());
    }

    #[test]
    fn rejects_wrong_landmarks() {
        let face = Landmarks::new(vec![Point3::origin(); 21], 1.0);
        assert!(matches!(
            HeadPoseEstimator::default().estimate(&face, 64, 64),
            Err(Error::ConfigMismatch { .. })
        ));
    }
}
