//! Integer geometry for texture sizes, sub-rectangles and damage regions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width and height of a texture or image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    /// Create a new size.
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True if either dimension is zero.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels.
    #[inline]
    pub fn area(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// True if both dimensions are multiples of two.
    #[inline]
    pub fn is_even(self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }

    /// Rectangle anchored at the origin covering this size.
    #[inline]
    pub fn to_rect(self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Check that a rectangle lies fully inside `[0,0]–self`.
    pub fn contains_rect(self, rect: Rect) -> bool {
        rect.right() <= self.width as u64 && rect.bottom() <= self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned integer rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Create a new rectangle.
    #[inline]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge. Widened so that huge rects never overflow.
    #[inline]
    pub fn right(self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    #[inline]
    pub fn bottom(self) -> u64 {
        self.y as u64 + self.height as u64
    }

    #[inline]
    pub fn size(self) -> Size {
        Size::new(self.width, self.height)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn area(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// True if both the origin and the size are multiples of two.
    pub fn is_even(self) -> bool {
        self.x % 2 == 0 && self.y % 2 == 0 && self.size().is_even()
    }

    /// Check if two rectangles overlap.
    pub fn overlaps(self, other: Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && (self.x as u64) < other.right()
            && self.right() > other.x as u64
            && (self.y as u64) < other.bottom()
            && self.bottom() > other.y as u64
    }

    /// Compute intersection with another rectangle.
    pub fn intersection(self, other: Self) -> Option<Self> {
        let x1 = self.x.max(other.x) as u64;
        let y1 = self.y.max(other.y) as u64;
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x1 < x2 && y1 < y2 {
            Some(Self::new(
                x1 as u32,
                y1 as u32,
                (x2 - x1) as u32,
                (y2 - y1) as u32,
            ))
        } else {
            None
        }
    }

    /// Clamp the rectangle to `[0,0]–bounds`. May return an empty rect.
    pub fn clamp_to(self, bounds: Size) -> Self {
        self.intersection(bounds.to_rect())
            .unwrap_or_else(|| Self::new(self.x.min(bounds.width), self.y.min(bounds.height), 0, 0))
    }

    /// Split `self` into the pieces not covered by `other` (at most four).
    pub fn subtract(self, other: Self) -> Vec<Self> {
        let Some(cut) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![self] };
        };

        let mut pieces = Vec::with_capacity(4);
        // Full-width band above the cut.
        if cut.y > self.y {
            pieces.push(Self::new(self.x, self.y, self.width, cut.y - self.y));
        }
        // Full-width band below the cut.
        if cut.bottom() < self.bottom() {
            let y = cut.bottom() as u32;
            pieces.push(Self::new(self.x, y, self.width, (self.bottom() - cut.bottom()) as u32));
        }
        // Left and right of the cut, limited to the cut's rows.
        if cut.x > self.x {
            pieces.push(Self::new(self.x, cut.y, cut.x - self.x, cut.height));
        }
        if cut.right() < self.right() {
            let x = cut.right() as u32;
            pieces.push(Self::new(x, cut.y, (self.right() - cut.right()) as u32, cut.height));
        }
        pieces
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{} {}x{}", self.x, self.y, self.width, self.height)
    }
}

/// A set of pixels stored as disjoint rectangles.
///
/// Used for damage tracking, where only union and difference are needed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    /// Add a rectangle. Pixels already in the region are not duplicated.
    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut fresh = vec![rect];
        for existing in &self.rects {
            fresh = fresh.into_iter().flat_map(|r| r.subtract(*existing)).collect();
        }
        self.rects.extend(fresh);
    }

    /// Remove every pixel covered by `rect`.
    pub fn subtract_rect(&mut self, rect: Rect) {
        self.rects = self.rects.iter().flat_map(|r| r.subtract(rect)).collect();
    }

    /// Remove every pixel covered by `other`.
    pub fn subtract(&mut self, other: &Region) {
        for rect in &other.rects {
            self.subtract_rect(*rect);
        }
    }

    /// The disjoint rectangles making up the region.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Number of pixels in the region.
    pub fn area(&self) -> usize {
        self.rects.iter().map(|r| r.area()).sum()
    }
}

impl FromIterator<Rect> for Region {
    fn from_iter<I: IntoIterator<Item = Rect>>(iter: I) -> Self {
        let mut region = Self::new();
        for rect in iter {
            region.add_rect(rect);
        }
        region
    }
}
