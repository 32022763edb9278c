//! Neural network inference boundary.
//!
//! The pipeline treats inference as a black box: an [`Inferer`] takes one normalized image
//! [`Tensor`] and returns the raw output tensors of the network, in a fixed, model-specific order.
//! [`TractInferer`] runs ONNX models on the CPU via `tract`, [`FnInferer`] wraps a closure.

use std::{
    ops::{Index, RangeInclusive},
    path::Path,
    sync::Arc,
};

use image::{imageops, Rgb, RgbImage};
use ndarray::{Array, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::{
    tvec, Framework, Graph, InferenceModelExt, SimplePlan, TValue, TypedFact, TypedOp,
};

use crate::geometry::Transform;

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// An n-dimensional `f32` tensor.
pub type Tensor = ArrayD<f32>;

/// The output tensors of a network invocation.
#[derive(Debug, Clone, Default)]
pub struct Outputs {
    inner: Vec<Tensor>,
}

impl Outputs {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.inner.iter()
    }

    /// Returns the output at `index` as a flat, row-major slice.
    ///
    /// Returns an error if the network produced fewer outputs.
    pub fn flat(&self, index: usize) -> anyhow::Result<Vec<f32>> {
        match self.inner.get(index) {
            Some(tensor) => Ok(tensor.iter().copied().collect()),
            None => anyhow::bail!(
                "network output #{index} requested, but only {} outputs exist",
                self.inner.len()
            ),
        }
    }
}

impl From<Vec<Tensor>> for Outputs {
    fn from(inner: Vec<Tensor>) -> Self {
        Self { inner }
    }
}

impl Index<usize> for Outputs {
    type Output = Tensor;

    fn index(&self, index: usize) -> &Tensor {
        &self.inner[index]
    }
}

/// An inference backend.
///
/// Backends are selected once, at construction time. Failures are opaque to the pipeline, which
/// drops the affected frame.
pub trait Inferer: Send + Sync {
    #[doc(alias = "infer")]
    fn invoke(&self, input: &Tensor) -> anyhow::Result<Outputs>;
}

impl<I: Inferer + ?Sized> Inferer for Arc<I> {
    fn invoke(&self, input: &Tensor) -> anyhow::Result<Outputs> {
        (**self).invoke(input)
    }
}

impl<I: Inferer + ?Sized> Inferer for Box<I> {
    fn invoke(&self, input: &Tensor) -> anyhow::Result<Outputs> {
        (**self).invoke(input)
    }
}

/// An [`Inferer`] backed by a closure.
pub struct FnInferer<F>(pub F);

impl<F> Inferer for FnInferer<F>
where
    F: Fn(&Tensor) -> anyhow::Result<Outputs> + Send + Sync,
{
    fn invoke(&self, input: &Tensor) -> anyhow::Result<Outputs> {
        (self.0)(input)
    }
}

/// Runs an ONNX model with the `tract` CPU backend.
pub struct TractInferer {
    model: Model,
    input_shape: Vec<usize>,
}

impl TractInferer {
    /// Loads a pre-trained model from an ONNX file path.
    ///
    /// The path must have a `.onnx` extension.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::load_impl(path.as_ref())
    }

    fn load_impl(path: &Path) -> anyhow::Result<Self> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => anyhow::bail!("neural network file must have `.onnx` extension"),
        }

        let model_data = std::fs::read(path)?;
        let this = Self::from_onnx(&model_data)?;
        log::debug!(
            "loaded {} with input shape {:?}",
            path.display(),
            this.input_shape
        );
        Ok(this)
    }

    /// Loads a pre-trained model from an in-memory ONNX file.
    pub fn from_onnx(raw: &[u8]) -> anyhow::Result<Self> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*raw)?
            .into_optimized()?;
        if graph.inputs.len() != 1 {
            anyhow::bail!(
                "network has to take exactly 1 input, this one takes {}",
                graph.inputs.len(),
            );
        }
        let input_shape = match graph.input_fact(0)?.shape.as_concrete() {
            Some(shape) => shape.to_vec(),
            None => anyhow::bail!("network input shape is symbolic"),
        };
        let outputs = graph.output_outlets()?.to_vec();
        let model = SimplePlan::new_for_outputs(graph, &outputs)?;

        Ok(Self { model, input_shape })
    }

    /// Returns the concrete shape of the network's only input.
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }
}

impl Inferer for TractInferer {
    fn invoke(&self, input: &Tensor) -> anyhow::Result<Outputs> {
        if input.shape() != self.input_shape.as_slice() {
            anyhow::bail!(
                "input tensor has shape {:?}, network expects {:?}",
                input.shape(),
                self.input_shape,
            );
        }

        let data = input.iter().copied().collect::<Vec<_>>();
        let tensor = tract_onnx::prelude::Tensor::from_shape(input.shape(), &data)?;
        let outputs = self.model.run(tvec![TValue::from_const(Arc::new(tensor))])?;

        let mut tensors = Vec::with_capacity(outputs.len());
        for tract in outputs {
            let data = tract.as_slice::<f32>()?.to_vec();
            tensors.push(ArrayD::from_shape_vec(IxDyn(tract.shape()), data)?);
        }
        Ok(Outputs::from(tensors))
    }
}

/// Describes in what order a network expects its input image data.
///
/// - `N` is the number of images, fixed at 1.
/// - `C` is the number of color channels, 3 for RGB inputs.
/// - `H` and `W` are the height and width of the input, respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputShape {
    /// Shape is `[N, C, H, W]`.
    Nchw,
    /// Shape is `[N, H, W, C]`.
    Nhwc,
}

/// Maps 8-bit RGB colors to network input values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorMapper {
    target_range: RangeInclusive<f32>,
}

impl ColorMapper {
    /// Creates a simple color mapper that uniformly maps sRGB values to `target_range`.
    ///
    /// Note that this operates on *non-linear* sRGB colors, but maps them linearly to the target
    /// range.
    pub fn linear(target_range: RangeInclusive<f32>) -> Self {
        assert!(target_range.end() > target_range.start());
        Self { target_range }
    }

    pub fn map(&self, color: Rgb<u8>) -> [f32; 3] {
        let start = *self.target_range.start();
        let end = *self.target_range.end();

        let adjust_range = (end - start) / 255.0;
        color.0.map(|col| col as f32 * adjust_range + start)
    }
}

impl Default for ColorMapper {
    fn default() -> Self {
        Self::linear(-1.0..=1.0)
    }
}

/// Turns images into network input tensors.
///
/// The input image is sampled (nearest neighbor) to create the tensor. If its aspect ratio does
/// not match the network's, it will be stretched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageEncoder {
    pub width: u32,
    pub height: u32,
    pub shape: InputShape,
    pub color: ColorMapper,
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self::new(128, 128, InputShape::Nhwc, ColorMapper::default())
    }
}

impl ImageEncoder {
    pub fn new(width: u32, height: u32, shape: InputShape, color: ColorMapper) -> Self {
        Self {
            width,
            height,
            shape,
            color,
        }
    }

    pub fn tensor_shape(&self) -> [usize; 4] {
        let (h, w) = (self.height as usize, self.width as usize);
        match self.shape {
            InputShape::Nchw => [1, 3, h, w],
            InputShape::Nhwc => [1, h, w, 3],
        }
    }

    pub fn encode(&self, image: &RgbImage) -> Tensor {
        let (h, w) = (self.height as usize, self.width as usize);
        let (img_w, img_h) = image.dimensions();

        // Map every sampled pixel once, then lay the channels out.
        let pixels = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| {
                if img_w == 0 || img_h == 0 {
                    return self.color.map(Rgb([0, 0, 0]));
                }
                let u = ((x as f32 / w as f32) * img_w as f32).round() as u32;
                let v = ((y as f32 / h as f32) * img_h as f32).round() as u32;
                self.color
                    .map(*image.get_pixel(u.min(img_w - 1), v.min(img_h - 1)))
            })
            .collect::<Vec<_>>();

        let tensor = match self.shape {
            InputShape::Nchw => {
                Array::from_shape_fn((1, 3, h, w), |(_, c, y, x)| pixels[y * w + x][c])
            }
            InputShape::Nhwc => {
                Array::from_shape_fn((1, h, w, 3), |(_, y, x, c)| pixels[y * w + x][c])
            }
        };
        tensor.into_dyn()
    }
}

/// Aspect-preserving fit of a frame into a network input, padded with black bars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Left padding, as a fraction of the padded width.
    pad_x: f32,
    /// Top padding, as a fraction of the padded height.
    pad_y: f32,
    inner_width: u32,
    inner_height: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    /// Computes the letterbox that fits a `frame_width`×`frame_height` image into a
    /// `width`×`height` canvas.
    pub fn new(frame_width: u32, frame_height: u32, width: u32, height: u32) -> Self {
        let scale = (width as f32 / frame_width.max(1) as f32)
            .min(height as f32 / frame_height.max(1) as f32);
        let inner_width = ((frame_width as f32 * scale) as u32).clamp(1, width.max(1));
        let inner_height = ((frame_height as f32 * scale) as u32).clamp(1, height.max(1));
        let pad_w = (width - inner_width) / 2;
        let pad_h = (height - inner_height) / 2;
        Self {
            pad_x: pad_w as f32 / width as f32,
            pad_y: pad_h as f32 / height as f32,
            inner_width,
            inner_height,
            width,
            height,
        }
    }

    pub fn padding(&self) -> (f32, f32) {
        (self.pad_x, self.pad_y)
    }

    /// Resizes `frame` and places it in the center of a black canvas.
    pub fn apply(&self, frame: &RgbImage) -> RgbImage {
        let resized = imageops::resize(
            frame,
            self.inner_width,
            self.inner_height,
            imageops::FilterType::Nearest,
        );
        let mut canvas = RgbImage::new(self.width, self.height);
        let x = (self.pad_x * self.width as f32).round() as i64;
        let y = (self.pad_y * self.height as f32).round() as i64;
        imageops::overlay(&mut canvas, &resized, x, y);
        canvas
    }

    /// Maps normalized canvas coordinates back to normalized frame coordinates.
    ///
    /// `x' = (x - pad_x) * width / inner_width`, and likewise for `y`. The padding on both sides
    /// differs by a pixel when the leftover space is odd.
    pub fn restore_transform(&self) -> Transform {
        Transform::scale(
            self.width as f32 / self.inner_width as f32,
            self.height as f32 / self.inner_height as f32,
        ) * Transform::translation(-self.pad_x, -self.pad_y)
    }
}
