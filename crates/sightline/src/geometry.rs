//! 2D homogeneous transforms and rectangles.
//!
//! [`Transform`]s compose like the matrices they wrap: in `a * b`, `b` is applied to a point
//! first. Every transform that can be built through this module is affine and invertible, except
//! for scales with a zero factor.

use std::ops::Mul;

use nalgebra::{Matrix3, Point2, Point3, Vector2};

/// An affine 2D transform stored as a 3×3 homogeneous matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    matrix: Matrix3<f32>,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    /// Wraps a raw matrix. The last row must be `[0, 0, 1]`.
    pub fn from_matrix(matrix: Matrix3<f32>) -> Self {
        debug_assert_eq!(matrix[(2, 0)], 0.0);
        debug_assert_eq!(matrix[(2, 1)], 0.0);
        debug_assert_eq!(matrix[(2, 2)], 1.0);
        Self { matrix }
    }

    pub fn translation(x: f32, y: f32) -> Self {
        Self {
            matrix: Matrix3::new(
                1.0, 0.0, x, //
                0.0, 1.0, y, //
                0.0, 0.0, 1.0,
            ),
        }
    }

    pub fn scale(x: f32, y: f32) -> Self {
        Self {
            matrix: Matrix3::new(
                x, 0.0, 0.0, //
                0.0, y, 0.0, //
                0.0, 0.0, 1.0,
            ),
        }
    }

    /// Rotation by `degrees` about `center`.
    ///
    /// Positive angles rotate image content *counter-clockwise* as displayed (with Y pointing
    /// down), matching the rotation matrices used by common image warping routines:
    ///
    /// ```text
    /// [  cos  sin  (1-cos)*cx - sin*cy ]
    /// [ -sin  cos  sin*cx + (1-cos)*cy ]
    /// ```
    pub fn rotation_about(center: Point2<f32>, degrees: f32) -> Self {
        let (sin, cos) = degrees.to_radians().sin_cos();
        let (cx, cy) = (center.x, center.y);
        Self {
            matrix: Matrix3::new(
                cos,
                sin,
                (1.0 - cos) * cx - sin * cy,
                -sin,
                cos,
                sin * cx + (1.0 - cos) * cy,
                0.0,
                0.0,
                1.0,
            ),
        }
    }

    #[inline]
    pub fn matrix(&self) -> &Matrix3<f32> {
        &self.matrix
    }

    /// Returns a transform that applies `self` first, then `next`.
    #[inline]
    pub fn then(&self, next: &Transform) -> Transform {
        *next * *self
    }

    /// Returns the inverse transform, or `None` if `self` is singular.
    pub fn inverse(&self) -> Option<Transform> {
        self.matrix.try_inverse().map(|matrix| Self { matrix })
    }

    /// Applies the transform to a point.
    #[inline]
    pub fn apply(&self, p: Point2<f32>) -> Point2<f32> {
        let h = self.matrix * p.to_homogeneous();
        Point2::new(h.x, h.y)
    }

    /// Applies the transform to the X and Y coordinates of a 3D point, leaving Z unchanged.
    #[inline]
    pub fn apply3(&self, p: Point3<f32>) -> Point3<f32> {
        let xy = self.apply(p.xy());
        Point3::new(xy.x, xy.y, p.z)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Transform {
        Transform {
            matrix: self.matrix * rhs.matrix,
        }
    }
}

/// Returns the angle in degrees that rotates the `first → second` axis onto the X axis.
///
/// A zero-length axis yields `0.0`.
pub fn horizontal_alignment(first: Point2<f32>, second: Point2<f32>) -> f32 {
    let d = second - first;
    angle_of(d.y, d.x)
}

/// Returns the angle in degrees that rotates the `first → second` axis onto the "up" direction
/// (negative Y).
///
/// A zero-length axis yields `0.0`.
pub fn vertical_alignment(first: Point2<f32>, second: Point2<f32>) -> f32 {
    let d = second - first;
    angle_of(d.x, -d.y)
}

fn angle_of(y: f32, x: f32) -> f32 {
    if x == 0.0 && y == 0.0 {
        return 0.0;
    }
    y.atan2(x).to_degrees()
}

/// An axis-aligned rectangle with `f32` coordinates, stored as top-left corner plus extent.
///
/// Used both in normalized `[0, 1]` coordinates (detections) and in pixel coordinates (crops).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

impl Rect {
    pub fn from_top_left(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn from_center(xc: f32, yc: f32, w: f32, h: f32) -> Self {
        Self {
            x: xc - w / 2.0,
            y: yc - h / 2.0,
            w,
            h,
        }
    }

    /// Creates the smallest rectangle containing both corners.
    pub fn from_corners(a: Point2<f32>, b: Point2<f32>) -> Self {
        let (x0, x1) = (a.x.min(b.x), a.x.max(b.x));
        let (y0, y1) = (a.y.min(b.y), a.y.max(b.y));
        Self::from_top_left(x0, y0, x1 - x0, y1 - y0)
    }

    /// Computes the axis-aligned bounding rectangle of a set of points.
    ///
    /// Returns `None` if `points` is empty.
    pub fn bounding<I: IntoIterator<Item = Point2<f32>>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), p| {
            (
                Point2::new(min.x.min(p.x), min.y.min(p.y)),
                Point2::new(max.x.max(p.x), max.y.max(p.y)),
            )
        });
        Some(Self::from_corners(min, max))
    }

    #[inline]
    pub fn x(&self) -> f32 {
        self.x
    }

    #[inline]
    pub fn y(&self) -> f32 {
        self.y
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.w
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.h
    }

    #[inline]
    pub fn x_center(&self) -> f32 {
        self.x + self.w / 2.0
    }

    #[inline]
    pub fn y_center(&self) -> f32 {
        self.y + self.h / 2.0
    }

    pub fn center(&self) -> Point2<f32> {
        Point2::new(self.x_center(), self.y_center())
    }

    pub fn top_left(&self) -> Point2<f32> {
        Point2::new(self.x, self.y)
    }

    pub fn bottom_right(&self) -> Point2<f32> {
        Point2::new(self.x + self.w, self.y + self.h)
    }

    /// Area of the rectangle. Degenerate or inverted rectangles have an area of 0.
    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Returns the overlapping region of `self` and `other`, or `None` if they don't overlap.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.w).min(other.x + other.w);
        let y1 = (self.y + self.h).min(other.y + other.h);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::from_top_left(x0, y0, x1 - x0, y1 - y0))
    }

    /// Computes the intersection over union of two rectangles.
    ///
    /// Uses plain (exclusive) areas, not the `+1` inclusive-pixel convention.
    /// Returns `0.0` when both rectangles are degenerate.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = match self.intersection(other) {
            Some(rect) => rect.area(),
            None => return 0.0,
        };
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Extends the shorter side to match the longer one, keeping the center.
    pub fn square(&self) -> Rect {
        let side = self.w.max(self.h);
        Rect::from_center(self.x_center(), self.y_center(), side, side)
    }

    /// Grows each side by a fraction of the rectangle's width or height.
    pub fn grow_rel(&self, left: f32, right: f32, top: f32, bottom: f32) -> Rect {
        let left = left * self.w;
        let right = right * self.w;
        let top = top * self.h;
        let bottom = bottom * self.h;
        Rect::from_top_left(
            self.x - left,
            self.y - top,
            self.w + left + right,
            self.h + top + bottom,
        )
    }

    pub fn move_by(&self, dx: f32, dy: f32) -> Rect {
        Rect::from_top_left(self.x + dx, self.y + dy, self.w, self.h)
    }

    /// Scales the coordinate system of the rectangle (eg. from normalized to pixel coordinates).
    pub fn scale_axes(&self, sx: f32, sy: f32) -> Rect {
        Rect::from_top_left(self.x * sx, self.y * sy, self.w * sx, self.h * sy)
    }

    /// Maps both corners through `transform` and returns their bounding rectangle.
    pub fn map_corners(&self, transform: &Transform) -> Rect {
        Rect::from_corners(
            transform.apply(self.top_left()),
            transform.apply(self.bottom_right()),
        )
    }

    pub fn contains(&self, p: Point2<f32>) -> bool {
        p.x >= self.x && p.y >= self.y && p.x < self.x + self.w && p.y < self.y + self.h
    }

    pub fn size(&self) -> Vector2<f32> {
        Vector2::new(self.w, self.h)
    }
}

/// Integer pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    /// Rounds `rect` outwards to whole pixels and clamps it to a `width`×`height` image.
    ///
    /// The result may have zero area if `rect` lies outside of the image.
    pub fn clamped(rect: &Rect, width: u32, height: u32) -> Self {
        let clamp = |v: f32, max: u32| (v.max(0.0) as u32).min(max);
        let x0 = clamp(rect.x().floor(), width);
        let y0 = clamp(rect.y().floor(), height);
        let x1 = clamp((rect.x() + rect.width()).ceil(), width).max(x0);
        let y1 = clamp((rect.y() + rect.height()).ceil(), height).max(y0);
        Self {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn origin(&self) -> Point2<f32> {
        Point2::new(self.x as f32, self.y as f32)
    }
}
