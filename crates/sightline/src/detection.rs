//! Common functionality for object detection.
//!
//! The functionality defined in this module (and submodules) is shared by every SSD-style
//! detector: anchors are generated once per configuration ([`ssd`]), raw network outputs are
//! decoded into [`Detection`]s ([`BoxDecoder`]), and duplicates are removed with
//! [`nms::NonMaxSuppression`].

pub mod nms;
pub mod ssd;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::geometry::{Rect, Transform};
use crate::num::sigmoid;
use crate::{Error, Result};

use self::ssd::{Anchor, AnchorParams, Anchors};

/// A detected object.
///
/// A [`Detection`] consists of a bounding [`Rect`] enclosing the detected object, a confidence
/// score in range `0.0..=1.0`, and a (possibly empty) list of keypoints.
///
/// Detections produced by [`BoxDecoder`] use normalized coordinates relative to the network input.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    score: f32,
    rect: Rect,
    keypoints: Vec<Point2<f32>>,
}

impl Detection {
    pub fn new(score: f32, rect: Rect) -> Self {
        Self {
            score,
            rect,
            keypoints: Vec::new(),
        }
    }

    pub fn with_keypoints(score: f32, rect: Rect, keypoints: Vec<Point2<f32>>) -> Self {
        Self {
            score,
            rect,
            keypoints,
        }
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn set_rect(&mut self, rect: Rect) {
        self.rect = rect;
    }

    /// The meaning of each keypoint depends on the detector and on its index in this list.
    pub fn keypoints(&self) -> &[Point2<f32>] {
        &self.keypoints
    }

    /// Maps the rectangle and all keypoints through `transform`.
    ///
    /// The rectangle is replaced by the bounding rectangle of its transformed corners, so this is
    /// only lossless for transforms without rotation.
    pub fn map(&self, transform: &Transform) -> Detection {
        Detection {
            score: self.score,
            rect: self.rect.map_corners(transform),
            keypoints: self.keypoints.iter().map(|&p| transform.apply(p)).collect(),
        }
    }
}

/// Parameters of an SSD detection network and of its post-processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub input_width: u32,
    pub input_height: u32,
    /// Number of floats per anchor in the regressor output.
    pub num_coords: usize,
    /// Number of anchors the network produces outputs for.
    pub num_boxes: usize,
    pub num_keypoints: usize,
    pub min_score_threshold: f32,
    pub nms_iou_threshold: f32,
    pub anchor_strides: Vec<u32>,
    pub anchor_counts_per_stride: Vec<u32>,
    /// Whether box offsets and sizes are scaled by the anchor size.
    pub scale_aware: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::face()
    }
}

impl DetectorConfig {
    /// Configuration of the short-range BlazeFace network.
    pub fn face() -> Self {
        Self {
            input_width: 128,
            input_height: 128,
            num_coords: 16,
            num_boxes: 896,
            num_keypoints: 6,
            min_score_threshold: 0.75,
            nms_iou_threshold: 0.5,
            anchor_strides: vec![8, 16],
            anchor_counts_per_stride: vec![1, 3],
            scale_aware: false,
        }
    }

    /// Configuration of the 128×128 palm detection network.
    pub fn palm() -> Self {
        Self {
            num_coords: 18,
            num_keypoints: 7,
            min_score_threshold: 0.8,
            ..Self::face()
        }
    }

    pub fn anchor_params(&self) -> AnchorParams {
        AnchorParams {
            input_width: self.input_width,
            input_height: self.input_height,
            strides: self.anchor_strides.clone(),
            counts_per_stride: self.anchor_counts_per_stride.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let min_coords = 4 + 2 * self.num_keypoints;
        if self.num_coords < min_coords {
            return Err(Error::InvalidConfig(format!(
                "{} coordinates per box cannot hold a box and {} keypoints (need {})",
                self.num_coords, self.num_keypoints, min_coords,
            )));
        }
        for (name, value) in [
            ("min_score_threshold", self.min_score_threshold),
            ("nms_iou_threshold", self.nms_iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be in range 0..=1, got {value}"
                )));
            }
        }
        let anchor_count = self.anchor_params().anchor_count();
        if anchor_count != self.num_boxes {
            return Err(Error::InvalidConfig(format!(
                "anchor layout produces {anchor_count} anchors, but `num_boxes` is {}",
                self.num_boxes,
            )));
        }
        Ok(())
    }
}

/// Decodes raw regressor and classifier outputs into scored [`Detection`]s.
///
/// `raw_boxes` holds `config.num_coords` floats per anchor, `raw_scores` one logit per anchor.
/// Anchors whose sigmoid-activated score is below `config.min_score_threshold` are skipped.
///
/// Returns [`Error::ConfigMismatch`] if either slice disagrees with the number of anchors.
pub fn decode(
    raw_boxes: &[f32],
    raw_scores: &[f32],
    anchors: &Anchors,
    config: &DetectorConfig,
) -> Result<Vec<Detection>> {
    let mut detections = Vec::new();
    decode_into(raw_boxes, raw_scores, anchors, config, &mut detections)?;
    Ok(detections)
}

fn decode_into(
    raw_boxes: &[f32],
    raw_scores: &[f32],
    anchors: &Anchors,
    config: &DetectorConfig,
    detections: &mut Vec<Detection>,
) -> Result<()> {
    let num_anchors = anchors.anchor_count();
    if raw_scores.len() != num_anchors {
        return Err(Error::mismatch("raw scores", num_anchors, raw_scores.len()));
    }
    let expected = num_anchors * config.num_coords;
    if raw_boxes.len() != expected {
        return Err(Error::mismatch("raw boxes", expected, raw_boxes.len()));
    }
    if config.num_coords < 4 + 2 * config.num_keypoints {
        return Err(Error::mismatch(
            "box coordinates",
            4 + 2 * config.num_keypoints,
            config.num_coords,
        ));
    }

    for (index, (&logit, params)) in raw_scores
        .iter()
        .zip(raw_boxes.chunks_exact(config.num_coords))
        .enumerate()
    {
        let score = sigmoid(logit);
        if score < config.min_score_threshold {
            continue;
        }

        detections.push(decode_box(&anchors[index], params, score, config));
    }

    Ok(())
}

fn decode_box(anchor: &Anchor, params: &[f32], score: f32, config: &DetectorConfig) -> Detection {
    let input_w = config.input_width as f32;
    let input_h = config.input_height as f32;
    let (scale_w, scale_h) = if config.scale_aware {
        (anchor.width(), anchor.height())
    } else {
        (1.0, 1.0)
    };

    let xc = params[0] / input_w * scale_w + anchor.x_center();
    let yc = params[1] / input_h * scale_h + anchor.y_center();
    let w = params[2] / input_w * scale_w;
    let h = params[3] / input_h * scale_h;

    // Keypoints are offset from the anchor center, but never scaled by the anchor size.
    let keypoints = params[4..4 + 2 * config.num_keypoints]
        .chunks_exact(2)
        .map(|kp| {
            Point2::new(
                kp[0] / input_w + anchor.x_center(),
                kp[1] / input_h + anchor.y_center(),
            )
        })
        .collect();

    Detection::with_keypoints(score, Rect::from_center(xc, yc, w, h), keypoints)
}

/// A [`decode`] wrapper that owns its configuration and the matching anchor set.
pub struct BoxDecoder {
    config: DetectorConfig,
    anchors: Anchors,
}

impl BoxDecoder {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        let anchors = Anchors::generate(&config.anchor_params())?;
        Ok(Self { config, anchors })
    }

    /// Creates a decoder using a custom anchor set instead of the generated one.
    pub fn with_anchors(config: DetectorConfig, anchors: Anchors) -> Result<Self> {
        if anchors.anchor_count() != config.num_boxes {
            return Err(Error::mismatch(
                "anchors",
                config.num_boxes,
                anchors.anchor_count(),
            ));
        }
        Ok(Self { config, anchors })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn anchors(&self) -> &Anchors {
        &self.anchors
    }

    pub fn decode(&self, raw_boxes: &[f32], raw_scores: &[f32]) -> Result<Vec<Detection>> {
        decode(raw_boxes, raw_scores, &self.anchors, &self.config)
    }

    /// Like [`BoxDecoder::decode`], but writes into a reusable buffer.
    ///
    /// `detections` is cleared first.
    pub fn decode_into(
        &self,
        raw_boxes: &[f32],
        raw_scores: &[f32],
        detections: &mut Vec<Detection>,
    ) -> Result<()> {
        detections.clear();
        decode_into(raw_boxes, raw_scores, &self.anchors, &self.config, detections)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::ssd::Anchor;
    use super::*;

    const LOW: f32 = -100.0;
    const HIGH: f32 = 100.0;

    fn raw(config: &DetectorConfig, hot: &[(usize, &[f32])]) -> (Vec<f32>, Vec<f32>) {
        let mut boxes = vec![0.0; config.num_boxes * config.num_coords];
        let mut scores = vec![LOW; config.num_boxes];
        for &(index, params) in hot {
            scores[index] = HIGH;
            boxes[index * config.num_coords..][..params.len()].copy_from_slice(params);
        }
        (boxes, scores)
    }

    #[test]
    fn decodes_single_anchor() {
        let decoder = BoxDecoder::new(DetectorConfig::face()).unwrap();
        let config = decoder.config();

        // anchor 0 is centered at (1/32, 1/32)
        #[rustfmt::skip]
        let params = [
            16.0, 32.0, 32.0, 64.0,
            0.0, 0.0,
            8.0, -4.0,
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ];
        let (boxes, scores) = raw(config, &[(0, &params)]);

        let detections = decoder.decode(&boxes, &scores).unwrap();
        assert_eq!(detections.len(), 1);
        let det = &detections[0];
        assert_eq!(det.score(), 1.0);

        // center = 16/128 + 1/32, extent = 32/128 x 64/128
        let rect = det.rect();
        assert_eq!(rect.x_center(), 0.15625);
        assert_eq!(rect.y_center(), 0.28125);
        assert_eq!(rect.width(), 0.25);
        assert_eq!(rect.height(), 0.5);
        assert_eq!(rect.x(), 0.15625 - 0.125);
        assert_eq!(rect.y(), 0.28125 - 0.25);

        assert_eq!(det.keypoints().len(), 6);
        assert_eq!(det.keypoints()[0], Point2::new(0.03125, 0.03125));
        assert_eq!(det.keypoints()[1], Point2::new(0.09375, 0.0));
    }

    #[test]
    fn drops_low_scores() {
        let decoder = BoxDecoder::new(DetectorConfig::face()).unwrap();
        let config = decoder.config();
        let (boxes, mut scores) = raw(config, &[(10, &[]), (700, &[])]);
        // sigmoid(1.0) ≈ 0.73 < 0.75
        scores[10] = 1.0;

        let detections = decoder.decode(&boxes, &scores).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(
            detections[0].rect().center(),
            decoder.anchors()[700].center()
        );
    }

    #[test]
    fn rejects_length_mismatch() {
        let decoder = BoxDecoder::new(DetectorConfig::face()).unwrap();
        let (boxes, scores) = raw(decoder.config(), &[]);

        let err = decoder.decode(&boxes[1..], &scores).unwrap_err();
        assert!(matches!(
            err,
            Error::ConfigMismatch {
                expected: 14336,
                actual: 14335,
                ..
            }
        ));
        assert!(decoder.decode(&boxes, &scores[..895]).is_err());
        assert!(decoder.decode(&[], &[]).is_err());
    }

    #[test]
    fn scale_aware_keypoints_are_not_scaled() {
        let config = DetectorConfig {
            num_boxes: 1,
            num_coords: 6,
            num_keypoints: 1,
            scale_aware: true,
            ..DetectorConfig::face()
        };
        let anchors = Anchors::from_vec(vec![Anchor::new(0.5, 0.5, 2.0, 0.5)]);
        let decoder = BoxDecoder::with_anchors(config, anchors).unwrap();

        let detections = decoder
            .decode(&[12.8, 12.8, 12.8, 12.8, 12.8, 12.8], &[HIGH])
            .unwrap();
        let det = &detections[0];
        assert_abs_diff_eq!(det.rect().x_center(), 0.7, epsilon = 1e-6);
        assert_abs_diff_eq!(det.rect().y_center(), 0.55, epsilon = 1e-6);
        assert_abs_diff_eq!(det.rect().width(), 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(det.rect().height(), 0.05, epsilon = 1e-6);
        assert_abs_diff_eq!(det.keypoints()[0], Point2::new(0.6, 0.6), epsilon = 1e-6);
    }

    #[test]
    fn validates_config() {
        assert!(DetectorConfig::face().validate().is_ok());
        assert!(DetectorConfig::palm().validate().is_ok());

        let config = DetectorConfig {
            num_keypoints: 7,
            ..DetectorConfig::face()
        };
        assert!(config.validate().is_err());

        let config = DetectorConfig {
            num_boxes: 895,
            ..DetectorConfig::face()
        };
        assert!(config.validate().is_err());

        let config = DetectorConfig {
            min_score_threshold: 1.5,
            ..DetectorConfig::face()
        };
        assert!(config.validate().is_err());
    }
}
