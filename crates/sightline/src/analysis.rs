//! Simple geometric measurements on restored landmarks.

use nalgebra::{distance, Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::filter::{FilterParams, PointVelocityFilter};
use crate::landmark::{eye, hand, mesh, Landmarks};
use crate::{Error, Result};

/// Ratio between the vertical and horizontal extent of an opening (eye, mouth).
pub fn aspect_ratio(
    top: Point2<f32>,
    bottom: Point2<f32>,
    left: Point2<f32>,
    right: Point2<f32>,
) -> f32 {
    distance(&top, &bottom) / (distance(&left, &right) + 1e-10)
}

/// Linearly maps `x` from range `from` to range `to`. Values outside of `from` are extrapolated.
pub fn remap(x: f32, from: [f32; 2], to: [f32; 2]) -> f32 {
    (x - from[0]) / (from[1] - from[0] + 1e-6) * (to[1] - to[0]) + to[0]
}

fn ratio_of(landmarks: &Landmarks, [top, bottom, left, right]: [usize; 4]) -> Result<f32> {
    let get = |i: usize| {
        landmarks
            .points()
            .get(i)
            .map(|p| p.xy())
            .ok_or_else(|| Error::mismatch("landmark index", i + 1, landmarks.len()))
    };
    Ok(aspect_ratio(get(top)?, get(bottom)?, get(left)?, get(right)?))
}

/// Mouth openness from a 468-point face mesh.
pub fn mouth_aspect_ratio(face: &Landmarks) -> Result<f32> {
    ratio_of(face, mesh::MOUTH)
}

/// Eye openness from the output of the iris network.
pub fn eye_aspect_ratio(contour: &Landmarks) -> Result<f32> {
    ratio_of(contour, eye::OPENING)
}

/// Gaze direction in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gaze {
    pub x_deg: f32,
    pub y_deg: f32,
}

/// Estimates horizontal gaze from the iris offset inside both eyes.
pub struct GazeEstimator {
    delta_range: [f32; 2],
    degree_range: [f32; 2],
    filter: PointVelocityFilter,
}

impl GazeEstimator {
    pub const FILTER_PARAMS: FilterParams = FilterParams {
        process_noise: 1e-4,
        measurement_noise: 0.05,
    };

    pub fn new() -> Self {
        Self {
            delta_range: [-5.0, 5.0],
            degree_range: [-60.0, 60.0],
            filter: PointVelocityFilter::new(Self::FILTER_PARAMS),
        }
    }

    /// Estimates the gaze from the iris network output (eye contour followed by iris) of both
    /// eyes, in sensor pixels.
    ///
    /// Vertical gaze is not estimated and is always 0.
    pub fn estimate(&mut self, left: &Landmarks, right: &Landmarks) -> Result<Gaze> {
        let dl = iris_offset(left)?;
        let dr = iris_offset(right)?;
        let dx = (dl.x + dr.x) / 2.0;

        let x_deg = remap(dx, self.delta_range, self.degree_range);
        let filtered = self.filter.update(Point2::new(x_deg, 0.0));
        Ok(Gaze {
            x_deg: filtered.x,
            y_deg: 0.0,
        })
    }

    pub fn reset(&mut self) {
        self.filter.reset();
    }
}

impl Default for GazeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Hand pose recognized from which fingers are extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandGesture {
    Five,
    Four,
    Three,
    Two,
    One,
    Thumb,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finger {
    Extended,
    Folded,
    Unclear,
}

/// Classifies an upright hand from its 21 landmarks in sensor pixels.
///
/// A finger is extended if its joints rise strictly toward the tip and folded if they strictly
/// descend. The thumb is extended if its tip lies left of its last joint.
pub fn classify_hand_gesture(landmarks: &Landmarks) -> Result<HandGesture> {
    use Finger::*;

    if landmarks.len() != hand::NUM_LANDMARKS {
        return Err(Error::mismatch("hand landmarks", hand::NUM_LANDMARKS, landmarks.len()));
    }
    let (ip, tip) = (landmarks.get(hand::THUMB_IP), landmarks.get(hand::THUMB_TIP));
    let thumb = if ip.x > tip.x {
        Extended
    } else if ip.x < tip.x {
        Folded
    } else {
        Unclear
    };
    let fingers = hand::FINGER_PIP.map(|pip| {
        let [a, b, c] = [pip, pip + 1, pip + 2].map(|i| landmarks.get(i).y);
        if a > b && b > c {
            Extended
        } else if a < b && b < c {
            Folded
        } else {
            Unclear
        }
    });

    Ok(match (thumb, fingers) {
        (Extended, [Extended, Extended, Extended, Extended]) => HandGesture::Five,
        (Folded, [Extended, Extended, Extended, Extended]) => HandGesture::Four,
        (Folded, [Extended, Extended, Extended, Folded]) => HandGesture::Three,
        (Folded, [Extended, Extended, Folded, Folded]) => HandGesture::Two,
        (Folded, [Extended, Folded, Folded, Folded]) => HandGesture::One,
        (Extended, [Folded, Folded, Folded, Folded]) => HandGesture::Thumb,
        _ => HandGesture::Unknown,
    })
}

/// Offset of the iris center from the eye center.
fn iris_offset(landmarks: &Landmarks) -> Result<Point2<f32>> {
    let expected = eye::NUM_EYE_LANDMARKS + eye::NUM_IRIS_LANDMARKS;
    if landmarks.len() != expected {
        return Err(Error::mismatch("eye landmarks", expected, landmarks.len()));
    }
    let points = landmarks.points();
    let eye_center = mean(eye::OPENING.iter().map(|&i| points[i]));
    let iris_center = mean(points[eye::NUM_EYE_LANDMARKS..].iter().copied());
    Ok(Point2::from(iris_center.xy() - eye_center.xy()))
}

fn mean(points: impl ExactSizeIterator<Item = Point3<f32>>) -> Point3<f32> {
    let n = points.len().max(1) as f32;
    points.fold(Point3::origin(), |acc, p| acc + p.coords / n)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn aspect_ratio_of_opening() {
        let ratio = aspect_ratio(
            Point2::new(5.0, 0.0),
            Point2::new(5.0, 4.0),
            Point2::new(0.0, 2.0),
            Point2::new(10.0, 2.0),
        );
        assert_abs_diff_eq!(ratio, 0.4, epsilon = 1e-6);

        let closed = aspect_ratio(
            Point2::new(1.0, 1.0),
            Point2::new(1.0, 1.0),
            Point2::new(1.0, 1.0),
            Point2::new(1.0, 1.0),
        );
        assert_eq!(closed, 0.0);
    }

    #[test]
    fn remap_extrapolates() {
        assert_abs_diff_eq!(remap(0.0, [-5.0, 5.0], [-60.0, 60.0]), 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(remap(5.0, [-5.0, 5.0], [-60.0, 60.0]), 60.0, epsilon = 1e-3);
        assert_abs_diff_eq!(remap(10.0, [-5.0, 5.0], [-60.0, 60.0]), 120.0, epsilon = 1e-3);
    }

    /// An eye centered on `center` with the iris shifted by `iris_dx`.
    fn eye_landmarks(center: Point2<f32>, iris_dx: f32) -> Landmarks {
        let mut points = vec![Point3::new(center.x, center.y, 0.0); 76];
        points[12].y -= 3.0;
        points[4].y += 3.0;
        points[1].x -= 10.0;
        points[15].x += 10.0;
        for p in &mut points[71..] {
            p.x += iris_dx;
        }
        Landmarks::new(points, 1.0)
    }

    #[test]
    fn gaze_centered() {
        let mut gaze = GazeEstimator::new();
        let g = gaze
            .estimate(
                &eye_landmarks(Point2::new(100.0, 50.0), 0.0),
                &eye_landmarks(Point2::new(160.0, 50.0), 0.0),
            )
            .unwrap();
        assert_abs_diff_eq!(g.x_deg, 0.0, epsilon = 1e-3);
        assert_eq!(g.y_deg, 0.0);
    }

    #[test]
    fn gaze_averages_both_eyes() {
        let mut gaze = GazeEstimator::new();
        let g = gaze
            .estimate(
                &eye_landmarks(Point2::new(100.0, 50.0), 2.0),
                &eye_landmarks(Point2::new(160.0, 50.0), 3.0),
            )
            .unwrap();
        assert_abs_diff_eq!(g.x_deg, 30.0, epsilon = 1e-3);
    }

    #[test]
    fn gaze_is_filtered() {
        let mut gaze = GazeEstimator::new();
        let left = eye_landmarks(Point2::new(100.0, 50.0), 0.0);
        let right = eye_landmarks(Point2::new(160.0, 50.0), 0.0);
        gaze.estimate(&left, &right).unwrap();

        let left = eye_landmarks(Point2::new(100.0, 50.0), 5.0);
        let right = eye_landmarks(Point2::new(160.0, 50.0), 5.0);
        let g = gaze.estimate(&left, &right).unwrap();
        assert!(g.x_deg > 0.0 && g.x_deg < 60.0, "{g:?}");

        gaze.reset();
        let g = gaze.estimate(&left, &right).unwrap();
        assert_abs_diff_eq!(g.x_deg, 60.0, epsilon = 1e-3);
    }

    #[test]
    fn gaze_rejects_wrong_landmarks() {
        let mut gaze = GazeEstimator::new();
        let face = Landmarks::new(vec![Point3::origin(); 468], 1.0);
        assert!(matches!(
            gaze.estimate(&face, &face),
            Err(Error::ConfigMismatch { .. })
        ));
    }

    /// A hand with the thumb and each finger extended (`true`) or folded (`false`).
    fn hand_landmarks(thumb: bool, fingers: [bool; 4]) -> Landmarks {
        let mut points = vec![Point3::new(50.0, 100.0, 0.0); 21];
        points[3].x = 30.0;
        points[4].x = if thumb { 20.0 } else { 40.0 };
        for (&pip, extended) in hand::FINGER_PIP.iter().zip(fingers) {
            let step = if extended { -10.0 } else { 10.0 };
            for k in 0..3 {
                points[pip + k].y = 80.0 + step * k as f32;
            }
        }
        Landmarks::new(points, 1.0)
    }

    #[test]
    fn counts_extended_fingers() {
        let cases = [
            (true, [true, true, true, true], HandGesture::Five),
            (false, [true, true, true, true], HandGesture::Four),
            (false, [true, true, true, false], HandGesture::Three),
            (false, [true, true, false, false], HandGesture::Two),
            (false, [true, false, false, false], HandGesture::One),
            (true, [false, false, false, false], HandGesture::Thumb),
            (false, [false, false, false, false], HandGesture::Unknown),
            (true, [true, false, true, false], HandGesture::Unknown),
        ];
        for (thumb, fingers, expected) in cases {
            let gesture = classify_hand_gesture(&hand_landmarks(thumb, fingers)).unwrap();
            assert_eq!(gesture, expected, "thumb={thumb} fingers={fingers:?}");
        }
    }

    #[test]
    fn bent_finger_is_unknown() {
        let mut points = hand_landmarks(true, [true; 4]).points().to_vec();
        // Middle finger DIP below its PIP, tip above it.
        points[11].y = 90.0;
        let bent = Landmarks::new(points, 1.0);
        assert_eq!(classify_hand_gesture(&bent).unwrap(), HandGesture::Unknown);

        let face = Landmarks::new(vec![Point3::origin(); 468], 1.0);
        assert!(classify_hand_gesture(&face).is_err());
    }

    #[test]
    fn gesture_serializes_as_snake_case() {
        assert_eq!(serde_json::to_string(&HandGesture::Thumb).unwrap(), "\"thumb\"");
    }

    #[test]
    fn eye_and_mouth_ratios() {
        let eye = eye_landmarks(Point2::new(20.0, 20.0), 0.0);
        assert_abs_diff_eq!(eye_aspect_ratio(&eye).unwrap(), 0.3, epsilon = 1e-6);

        let mut points = vec![Point3::origin(); 468];
        points[13] = Point3::new(0.0, -1.0, 0.0);
        points[14] = Point3::new(0.0, 1.0, 0.0);
        points[62] = Point3::new(-2.0, 0.0, 0.0);
        points[292] = Point3::new(2.0, 0.0, 0.0);
        let face = Landmarks::new(points, 1.0);
        assert_abs_diff_eq!(mouth_aspect_ratio(&face).unwrap(), 0.5, epsilon = 1e-6);

        let short = Landmarks::new(vec![Point3::origin(); 10], 1.0);
        assert!(mouth_aspect_ratio(&short).is_err());
    }
}
