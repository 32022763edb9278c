//! Anchor/Prior generation for Single Shot MultiBox Detectors (SSDs).
//!
//! The anchor layout matches the MediaPipe-style networks used by the face and palm detectors:
//! every stride contributes a square feature map, and every feature map cell holds `2 * count`
//! unit-sized anchors centered on the cell.

use std::ops::Index;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// An anchor of an SSD network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    // values range from 0 to 1
    x_center: f32,
    y_center: f32,
    w: f32,
    h: f32,
}

impl Anchor {
    pub fn new(x_center: f32, y_center: f32, w: f32, h: f32) -> Self {
        Self {
            x_center,
            y_center,
            w,
            h,
        }
    }

    pub fn x_center(&self) -> f32 {
        self.x_center
    }

    pub fn y_center(&self) -> f32 {
        self.y_center
    }

    pub fn center(&self) -> Point2<f32> {
        Point2::new(self.x_center, self.y_center)
    }

    pub fn width(&self) -> f32 {
        self.w
    }

    pub fn height(&self) -> f32 {
        self.h
    }
}

/// Describes the anchor layout of an SSD network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorParams {
    /// Input width of the network, in pixels.
    pub input_width: u32,
    /// Input height of the network, in pixels.
    pub input_height: u32,
    /// Feature map strides, one per output layer.
    pub strides: Vec<u32>,
    /// Per stride: how many times the 2-anchor base set is repeated in every cell.
    pub counts_per_stride: Vec<u32>,
}

impl Default for AnchorParams {
    /// The layout of the 128×128 BlazeFace and palm detection networks (896 anchors).
    fn default() -> Self {
        Self {
            input_width: 128,
            input_height: 128,
            strides: vec![8, 16],
            counts_per_stride: vec![1, 3],
        }
    }
}

impl AnchorParams {
    /// Returns the number of anchors [`Anchors::generate`] will produce for `self`.
    pub fn anchor_count(&self) -> usize {
        self.layers()
            .map(|(w, h, per_cell)| (w * h * per_cell) as usize)
            .sum()
    }

    fn validate(&self) -> Result<()> {
        if self.strides.len() != self.counts_per_stride.len() {
            return Err(Error::InvalidConfig(format!(
                "{} anchor strides but {} per-stride counts",
                self.strides.len(),
                self.counts_per_stride.len(),
            )));
        }
        if self.strides.contains(&0) || self.input_width == 0 || self.input_height == 0 {
            return Err(Error::InvalidConfig(
                "anchor strides and input size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Yields `(feature_map_width, feature_map_height, anchors_per_cell)` for every layer.
    fn layers(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        self.strides
            .iter()
            .zip(&self.counts_per_stride)
            .map(|(&stride, &count)| {
                (
                    self.input_width.div_ceil(stride),
                    self.input_height.div_ceil(stride),
                    2 * count,
                )
            })
    }
}

/// An ordered list of SSD anchors.
///
/// The order (layers in the configured order, row-major cells within a layer) matches the
/// flattening order of the network's output tensors, so anchors are addressed by index.
#[derive(Debug, Clone)]
pub struct Anchors {
    anchors: Vec<Anchor>,
}

impl Anchors {
    pub fn generate(params: &AnchorParams) -> Result<Self> {
        params.validate()?;

        let mut anchors = Vec::with_capacity(params.anchor_count());
        for (width, height, per_cell) in params.layers() {
            for y in 0..height {
                for x in 0..width {
                    let x_center = (x as f32 + 0.5) / width as f32;
                    let y_center = (y as f32 + 0.5) / height as f32;
                    for _ in 0..per_cell {
                        anchors.push(Anchor::new(x_center, y_center, 1.0, 1.0));
                    }
                }
            }
        }

        log::trace!("generated {} anchors for {:?}", anchors.len(), params);
        Ok(Self { anchors })
    }

    /// Wraps a custom, precomputed anchor list.
    pub fn from_vec(anchors: Vec<Anchor>) -> Self {
        Self { anchors }
    }

    /// Returns the total number of SSD anchors/priors.
    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Anchor> {
        self.anchors.iter()
    }
}

impl Index<usize> for Anchors {
    type Output = Anchor;

    fn index(&self, index: usize) -> &Anchor {
        &self.anchors[index]
    }
}
