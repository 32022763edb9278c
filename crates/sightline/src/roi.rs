//! Region of interest extraction.
//!
//! A [`RoiTransformer`] turns a normalized detection into a cropped, margin-padded and
//! rotation-aligned [`RoiImage`] that can be fed to a landmark network. The [`RoiImage`] carries
//! the [`Transform`] mapping its pixel coordinates back to the source frame, so landmarks computed
//! on the crop can be restored to sensor space.

use image::{Rgb, RgbImage};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::detection::Detection;
use crate::geometry::{horizontal_alignment, vertical_alignment, PixelRect, Rect, Transform};
use crate::{Error, Result};

/// Direction the alignment axis is rotated onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentAxis {
    /// `first → second` points to the right after alignment (eg. left eye to right eye).
    Horizontal,
    /// `first → second` points up after alignment (eg. wrist to middle finger).
    Vertical,
}

/// Which detection keypoints define the rotation of the crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alignment {
    pub first: usize,
    pub second: usize,
    pub axis: AlignmentAxis,
}

/// How a detection is turned into a crop rectangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    /// Extend the shorter side of the box to match the longer one.
    pub square: bool,
    /// Fraction of the box width added on the left and on the right.
    pub margin_x: f32,
    /// Fraction of the box height added on the top and on the bottom.
    pub margin_y: f32,
    /// Fraction of the box height the crop is moved *up* by.
    pub shift_y: f32,
    pub alignment: Option<Alignment>,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self::face_landmark()
    }
}

impl RoiConfig {
    /// Plain face box crop with a 1/4 margin and no rotation.
    pub fn face_box() -> Self {
        Self {
            square: false,
            margin_x: 0.25,
            margin_y: 0.25,
            shift_y: 0.0,
            alignment: None,
        }
    }

    /// Square face crop, rotated so that the eyes (keypoints 0 and 1) are level.
    pub fn face_landmark() -> Self {
        Self {
            square: true,
            alignment: Some(Alignment {
                first: 0,
                second: 1,
                axis: AlignmentAxis::Horizontal,
            }),
            ..Self::face_box()
        }
    }

    /// Palm crop: shifted toward the fingers, with a generous margin, rotated so that the
    /// wrist → middle finger axis (keypoints 0 and 2) points up.
    pub fn palm() -> Self {
        Self {
            square: true,
            margin_x: 0.8,
            margin_y: 0.8,
            shift_y: 0.5,
            alignment: Some(Alignment {
                first: 0,
                second: 2,
                axis: AlignmentAxis::Vertical,
            }),
        }
    }

    /// Eye crop around the bounds of the eye contour landmarks.
    pub fn eye() -> Self {
        Self {
            square: false,
            margin_x: 0.5,
            margin_y: 0.5,
            shift_y: 0.0,
            alignment: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("margin_x", self.margin_x),
            ("margin_y", self.margin_y),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if !self.shift_y.is_finite() {
            return Err(Error::InvalidConfig("shift_y must be finite".into()));
        }
        if let Some(Alignment { first, second, .. }) = self.alignment {
            if first == second {
                return Err(Error::InvalidConfig(format!(
                    "alignment keypoints must differ, both are {first}"
                )));
            }
        }
        Ok(())
    }
}

/// A cropped and aligned image region.
pub struct RoiImage {
    image: RgbImage,
    transform: Transform,
    crop: PixelRect,
    angle: f32,
}

impl RoiImage {
    /// The cropped pixels. Areas rotated in from outside of the crop rectangle are black.
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Maps ROI pixel coordinates to source frame pixel coordinates.
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// The (clamped) crop rectangle in the source frame.
    pub fn crop(&self) -> PixelRect {
        self.crop
    }

    /// Rotation applied to the crop, in degrees.
    pub fn angle(&self) -> f32 {
        self.angle
    }

    pub fn width(&self) -> u32 {
        self.crop.width
    }

    pub fn height(&self) -> u32 {
        self.crop.height
    }
}

/// Crop geometry computed by [`RoiTransformer::plan`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiPlan {
    pub crop: PixelRect,
    pub angle: f32,
    pub transform: Transform,
}

pub struct RoiTransformer {
    config: RoiConfig,
}

impl RoiTransformer {
    pub fn new(config: RoiConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RoiConfig {
        &self.config
    }

    /// Picks the configured alignment keypoints out of `detection`.
    ///
    /// Returns `None` if no alignment is configured or the detection lacks the keypoints.
    pub fn alignment_keypoints(&self, detection: &Detection) -> Option<(Point2<f32>, Point2<f32>)> {
        let alignment = self.config.alignment?;
        let kps = detection.keypoints();
        Some((*kps.get(alignment.first)?, *kps.get(alignment.second)?))
    }

    /// Computes the crop rectangle, rotation and ROI-to-frame transform without touching pixels.
    ///
    /// `rect` and `alignment` are normalized to the `width`×`height` frame. A crop that would
    /// reach outside the frame is clamped to it and silently loses part of its margin.
    ///
    /// Returns [`Error::DegenerateGeometry`] if the clamped crop has zero area.
    pub fn plan(
        &self,
        width: u32,
        height: u32,
        rect: Rect,
        alignment: Option<(Point2<f32>, Point2<f32>)>,
    ) -> Result<RoiPlan> {
        let (w, h) = (width as f32, height as f32);
        let mut rect = rect.scale_axes(w, h);
        if self.config.square {
            rect = rect.square();
        }
        let (mx, my) = (self.config.margin_x, self.config.margin_y);
        let rect = rect
            .move_by(0.0, -self.config.shift_y * rect.height())
            .grow_rel(mx, mx, my, my);

        let crop = PixelRect::clamped(&rect, width, height);
        if crop.is_empty() {
            return Err(Error::DegenerateGeometry("crop rectangle has zero area"));
        }

        let angle = match (alignment, self.config.alignment) {
            (Some((a, b)), Some(cfg)) => {
                let to_px = |p: Point2<f32>| Point2::new(p.x * w, p.y * h);
                match cfg.axis {
                    AlignmentAxis::Horizontal => horizontal_alignment(to_px(a), to_px(b)),
                    AlignmentAxis::Vertical => vertical_alignment(to_px(a), to_px(b)),
                }
            }
            (Some((a, b)), None) => horizontal_alignment(
                Point2::new(a.x * w, a.y * h),
                Point2::new(b.x * w, b.y * h),
            ),
            (None, _) => 0.0,
        };

        let center = Point2::new(crop.width as f32 / 2.0, crop.height as f32 / 2.0);
        let transform = Transform::translation(crop.x as f32, crop.y as f32)
            * Transform::rotation_about(center, -angle);

        Ok(RoiPlan {
            crop,
            angle,
            transform,
        })
    }

    /// Crops `detection` out of `image`.
    ///
    /// If `alignment` is given, the crop is rotated about its center so that the axis between the
    /// two (normalized) keypoints is aligned as configured. Coincident keypoints result in no
    /// rotation.
    pub fn crop(
        &self,
        image: &RgbImage,
        detection: &Detection,
        alignment: Option<(Point2<f32>, Point2<f32>)>,
    ) -> Result<RoiImage> {
        self.crop_rect(image, detection.rect(), alignment)
    }

    /// Like [`RoiTransformer::crop`], but takes a bare normalized rectangle.
    pub fn crop_rect(
        &self,
        image: &RgbImage,
        rect: Rect,
        alignment: Option<(Point2<f32>, Point2<f32>)>,
    ) -> Result<RoiImage> {
        let plan = self.plan(image.width(), image.height(), rect, alignment)?;
        Ok(render(image, plan))
    }
}

/// Samples the ROI pixels from `image` (nearest neighbor).
fn render(image: &RgbImage, plan: RoiPlan) -> RoiImage {
    let crop = plan.crop;
    let bounds = Rect::from_top_left(
        crop.x as f32,
        crop.y as f32,
        crop.width as f32,
        crop.height as f32,
    );
    let rotated = plan.angle != 0.0;
    let out = RgbImage::from_fn(crop.width, crop.height, |x, y| {
        if !rotated {
            return *image.get_pixel(crop.x + x, crop.y + y);
        }
        let src = plan.transform.apply(Point2::new(x as f32, y as f32));
        let src = Point2::new(src.x.round(), src.y.round());
        if bounds.contains(src) {
            *image.get_pixel(src.x as u32, src.y as u32)
        } else {
            Rgb([0, 0, 0])
        }
    });
    RoiImage {
        image: out,
        transform: plan.transform,
        crop,
        angle: plan.angle,
    }
}
