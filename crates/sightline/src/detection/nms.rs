//! Non-Maximum Suppression.
//!
//! Typical Single-Shot MultiBox Detectors (SSD) produce duplicate detections for individual
//! objects. Non-Maximum Suppression (NMS) is an algorithm that filters these duplicates out,
//! leaving only a single detection with high confidence for each object.
//!
//! Only hard, greedy suppression is implemented. Overlapping detections are never merged, so the
//! output is always a subset of the input.

use crate::num::TotalF32;

use super::Detection;

/// A non-maximum suppression algorithm.
pub struct NonMaxSuppression {
    iou_thresh: f32,
    out_buf: Vec<Detection>,
}

impl NonMaxSuppression {
    /// The default intersection-over-union threshold used to determine if two detections overlap.
    pub const DEFAULT_IOU_THRESH: f32 = 0.5;

    /// Creates a new non-maximum suppressor using [`Self::DEFAULT_IOU_THRESH`].
    pub fn new() -> Self {
        Self {
            iou_thresh: Self::DEFAULT_IOU_THRESH,
            out_buf: Vec::new(),
        }
    }

    /// Sets the intersection-over-union threshold to consider two detections as overlapping.
    ///
    /// Detections whose IOU with a higher-scoring detection *exceeds* the threshold are removed.
    pub fn set_iou_thresh(&mut self, iou_thresh: f32) {
        self.iou_thresh = iou_thresh;
    }

    pub fn iou_thresh(&self) -> f32 {
        self.iou_thresh
    }

    /// Performs non-maximum suppression on `detections`.
    ///
    /// `detections` will be drained in the process. The surviving detections are returned as an
    /// iterator, highest score first.
    ///
    /// Detections with equal scores keep their relative input order during sorting, and the one
    /// that came *last* in the input is considered first.
    pub fn process(
        &mut self,
        detections: &mut Vec<Detection>,
    ) -> impl Iterator<Item = Detection> + '_ {
        self.out_buf.clear();

        // Sort by ascending score, process highest score first by starting at the back.
        detections.sort_by_key(|det| TotalF32(det.score()));

        while let Some(seed) = detections.pop() {
            let seed_rect = seed.rect();
            detections.retain(|other| seed_rect.iou(&other.rect()) <= self.iou_thresh);
            self.out_buf.push(seed);
        }

        self.out_buf.drain(..)
    }
}

impl Default for NonMaxSuppression {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs greedy suppression with the given threshold and collects the survivors.
pub fn suppress(mut detections: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    let mut nms = NonMaxSuppression::new();
    nms.set_iou_thresh(iou_thresh);
    nms.process(&mut detections).collect()
}

#[cfg(test)]
mod tests {
    use crate::geometry::Rect;

    use super::*;

    #[test]
    fn nms_suppresses_non_maximum() {
        let rect = Rect::from_center(0.0, 0.0, 1.0, 1.0);
        let a = Detection::new(0.6, rect);
        let b = Detection::new(0.55, rect);
        let detections = suppress(vec![b, a], 0.5);
        assert_eq!(detections.len(), 1);

        let d = &detections[0];
        assert_eq!(d.score(), 0.6);
        assert_eq!(d.rect(), rect);
    }

    #[test]
    fn nms_ignores_nonoverlapping() {
        let a = Detection::new(1.0, Rect::from_center(0.0, 0.0, 1.0, 1.0));
        let b = Detection::new(1.0, Rect::from_center(5.0, 0.0, 1.0, 1.0));

        let detections = suppress(vec![a, b], 0.5);
        assert_eq!(detections.len(), 2);
    }

    #[test]
    fn nms_keeps_overlap_at_threshold() {
        // IOU of 1/3
        let a = Detection::new(0.9, Rect::from_top_left(0.0, 0.0, 1.0, 1.0));
        let b = Detection::new(0.8, Rect::from_top_left(0.5, 0.0, 1.0, 1.0));

        assert_eq!(suppress(vec![a.clone(), b.clone()], 0.5).len(), 2);
        assert_eq!(suppress(vec![a, b], 0.3).len(), 1);
    }

    #[test]
    fn nms_empty() {
        assert!(suppress(Vec::new(), 0.5).is_empty());
    }

    #[test]
    fn nms_output_is_subset() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        for _ in 0..50 {
            let input = (0..rng.usize(0..30))
                .map(|_| {
                    Detection::new(
                        rng.f32(),
                        Rect::from_center(rng.f32(), rng.f32(), rng.f32() * 0.5, rng.f32() * 0.5),
                    )
                })
                .collect::<Vec<_>>();

            let output = suppress(input.clone(), 0.4);
            assert!(output.len() <= input.len());
            for det in &output {
                assert!(input.contains(det), "{det:?} not in input");
            }
            for pair in output.windows(2) {
                assert!(pair[0].score() >= pair[1].score());
            }
        }
    }
}
