//! Basic 2D geometry used by the selection and capture state machines.
//!
//! All coordinates in this crate are either buffer-local pixels (`i32`) or
//! pointer positions (`f64`); the types are generic over the scalar.

use std::ops::{Add, Sub};

/// Trait for scalars usable as coordinates
pub trait Coordinate:
    Copy + PartialEq + PartialOrd + Add<Output = Self> + Sub<Output = Self> + std::fmt::Debug
{
    /// The zero value
    fn zero() -> Self;
    /// Minimum of two values
    fn min(self, other: Self) -> Self;
    /// Maximum of two values
    fn max(self, other: Self) -> Self;
}

impl Coordinate for i32 {
    fn zero() -> Self {
        0
    }
    fn min(self, other: Self) -> Self {
        Ord::min(self, other)
    }
    fn max(self, other: Self) -> Self {
        Ord::max(self, other)
    }
}

impl Coordinate for f64 {
    fn zero() -> Self {
        0.0
    }
    fn min(self, other: Self) -> Self {
        f64::min(self, other)
    }
    fn max(self, other: Self) -> Self {
        f64::max(self, other)
    }
}

/// A point in 2D space
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Point<N> {
    /// Horizontal coordinate
    pub x: N,
    /// Vertical coordinate
    pub y: N,
}

impl<N> From<(N, N)> for Point<N> {
    fn from((x, y): (N, N)) -> Self {
        Point { x, y }
    }
}

impl<N: Coordinate> Add for Point<N> {
    type Output = Point<N>;
    fn add(self, other: Point<N>) -> Point<N> {
        Point {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }
}

impl<N: Coordinate> Sub for Point<N> {
    type Output = Point<N>;
    fn sub(self, other: Point<N>) -> Point<N> {
        Point {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }
}

impl Point<i32> {
    /// Convert to floating point coordinates
    pub fn to_f64(self) -> Point<f64> {
        Point {
            x: self.x as f64,
            y: self.y as f64,
        }
    }
}

/// A size in 2D space
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Size<N> {
    /// Width
    pub w: N,
    /// Height
    pub h: N,
}

impl<N> From<(N, N)> for Size<N> {
    fn from((w, h): (N, N)) -> Self {
        Size { w, h }
    }
}

impl Size<i32> {
    /// Whether this size has no content
    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }
}

/// An axis-aligned rectangle, defined by its top-left corner and its size
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Rectangle<N> {
    /// Location of the top-left corner
    pub loc: Point<N>,
    /// Size of the rectangle
    pub size: Size<N>,
}

impl<N: Coordinate> Rectangle<N> {
    /// Create a rectangle from location and size
    pub fn new(loc: impl Into<Point<N>>, size: impl Into<Size<N>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Checks whether a point is inside this rectangle
    pub fn contains(&self, point: impl Into<Point<N>>) -> bool {
        let p = point.into();
        p.x >= self.loc.x
            && p.y >= self.loc.y
            && p.x < self.loc.x + self.size.w
            && p.y < self.loc.y + self.size.h
    }

    /// Checks whether two rectangles overlap
    pub fn overlaps(&self, other: &Rectangle<N>) -> bool {
        self.loc.x < other.loc.x + other.size.w
            && other.loc.x < self.loc.x + self.size.w
            && self.loc.y < other.loc.y + other.size.h
            && other.loc.y < self.loc.y + self.size.h
    }

    /// Compute the intersection of two rectangles, if any
    pub fn intersection(&self, other: &Rectangle<N>) -> Option<Rectangle<N>> {
        if !self.overlaps(other) {
            return None;
        }
        let x = self.loc.x.max(other.loc.x);
        let y = self.loc.y.max(other.loc.y);
        let x2 = (self.loc.x + self.size.w).min(other.loc.x + other.size.w);
        let y2 = (self.loc.y + self.size.h).min(other.loc.y + other.size.h);
        Some(Rectangle {
            loc: Point { x, y },
            size: Size { w: x2 - x, h: y2 - y },
        })
    }
}

impl Rectangle<i32> {
    /// Create a rectangle covering `size` at the origin
    pub fn from_size(size: impl Into<Size<i32>>) -> Self {
        Rectangle {
            loc: Point { x: 0, y: 0 },
            size: size.into(),
        }
    }
}
