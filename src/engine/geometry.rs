// Index-space geometry
use std::fmt;
use std::ops::{Add, AddAssign, Index, IndexMut, Sub};

/// Coordinate type of every index space.
pub type Coord = i64;

/// Largest dimensionality carried through a kernel argument block.
pub const MAX_DIM: usize = 2;

/// A point in an N-dimensional index space.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point<const N: usize> {
    pub values: [Coord; N],
}

impl<const N: usize> Point<N> {
    pub const fn new(values: [Coord; N]) -> Self {
        Self { values }
    }

    pub const fn zeroes() -> Self {
        Self { values: [0; N] }
    }
}

impl<const N: usize> Default for Point<N> {
    fn default() -> Self {
        Self::zeroes()
    }
}

impl<const N: usize> From<[Coord; N]> for Point<N> {
    fn from(values: [Coord; N]) -> Self {
        Self { values }
    }
}

impl From<Coord> for Point<1> {
    fn from(value: Coord) -> Self {
        Self { values: [value] }
    }
}

impl<const N: usize> Index<usize> for Point<N> {
    type Output = Coord;

    fn index(&self, dim: usize) -> &Coord {
        &self.values[dim]
    }
}

impl<const N: usize> IndexMut<usize> for Point<N> {
    fn index_mut(&mut self, dim: usize) -> &mut Coord {
        &mut self.values[dim]
    }
}

impl<const N: usize> Add for Point<N> {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        for d in 0..N {
            self.values[d] += rhs.values[d];
        }
        self
    }
}

impl<const N: usize> Sub for Point<N> {
    type Output = Self;

    fn sub(mut self, rhs: Self) -> Self {
        for d in 0..N {
            self.values[d] -= rhs.values[d];
        }
        self
    }
}

/// Scalar increment: adds `rhs` to every coordinate.
impl<const N: usize> Add<Coord> for Point<N> {
    type Output = Self;

    fn add(mut self, rhs: Coord) -> Self {
        self += rhs;
        self
    }
}

impl<const N: usize> AddAssign<Coord> for Point<N> {
    fn add_assign(&mut self, rhs: Coord) {
        for v in self.values.iter_mut() {
            *v += rhs;
        }
    }
}

impl<const N: usize> fmt::Display for Point<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (d, v) in self.values.iter().enumerate() {
            if d > 0 {
                write!(f, ",")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// An inclusive, axis-aligned range of points `lo..=hi`.
///
/// Any `hi[i] < lo[i]` makes the rectangle empty; empty rectangles are legal
/// values and simply contain no points.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect<const N: usize> {
    pub lo: Point<N>,
    pub hi: Point<N>,
}

impl<const N: usize> Rect<N> {
    pub const fn new(lo: Point<N>, hi: Point<N>) -> Self {
        Self { lo, hi }
    }

    /// The canonical empty rectangle (`lo = 0`, `hi = -1` on every axis).
    pub const fn empty() -> Self {
        Self {
            lo: Point { values: [0; N] },
            hi: Point { values: [-1; N] },
        }
    }

    pub fn is_empty(&self) -> bool {
        (0..N).any(|d| self.hi[d] < self.lo[d])
    }

    /// Number of points along `dim`, zero when the axis is empty.
    pub fn extent(&self, dim: usize) -> u64 {
        if self.hi[dim] < self.lo[dim] {
            0
        } else {
            (self.hi[dim] - self.lo[dim] + 1) as u64
        }
    }

    pub fn volume(&self) -> u64 {
        (0..N).map(|d| self.extent(d)).product()
    }

    pub fn contains(&self, p: Point<N>) -> bool {
        (0..N).all(|d| self.lo[d] <= p[d] && p[d] <= self.hi[d])
    }

    pub fn contains_rect(&self, other: &Rect<N>) -> bool {
        other.is_empty() || (self.contains(other.lo) && self.contains(other.hi))
    }

    pub fn intersection(&self, other: &Rect<N>) -> Rect<N> {
        let mut out = *self;
        for d in 0..N {
            out.lo[d] = self.lo[d].max(other.lo[d]);
            out.hi[d] = self.hi[d].min(other.hi[d]);
        }
        out
    }

    pub fn overlaps(&self, other: &Rect<N>) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Row-major rank of `p` inside the rectangle. `p` must be contained.
    pub fn linearize(&self, p: Point<N>) -> u64 {
        debug_assert!(self.contains(p), "{p} outside {self}");
        let mut index = 0u64;
        for d in 0..N {
            index = index * self.extent(d) + (p[d] - self.lo[d]) as u64;
        }
        index
    }

    /// Inverse of [`Rect::linearize`]. `index` must be below the volume.
    pub fn delinearize(&self, mut index: u64) -> Point<N> {
        debug_assert!(index < self.volume());
        let mut p = self.lo;
        for d in (0..N).rev() {
            let ext = self.extent(d);
            p[d] = self.lo[d] + (index % ext) as Coord;
            index /= ext;
        }
        p
    }

    pub fn points(&self) -> PointInRectIterator<N> {
        PointInRectIterator::new(*self)
    }
}

impl Rect<1> {
    /// `lo..=hi` on a line.
    pub const fn span(lo: Coord, hi: Coord) -> Self {
        Self {
            lo: Point { values: [lo] },
            hi: Point { values: [hi] },
        }
    }
}

impl<const N: usize> fmt::Display for Rect<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..={}]", self.lo, self.hi)
    }
}

/// Row-major cursor over the points of a rectangle.
///
/// Works both as a plain `Iterator` and as a cursor with `current`, `step`
/// and `advance(k)`; the latter is what lane striding uses.
#[derive(Debug, Clone)]
pub struct PointInRectIterator<const N: usize> {
    rect: Rect<N>,
    p: Point<N>,
    index: u64,
    volume: u64,
}

impl<const N: usize> PointInRectIterator<N> {
    pub fn new(rect: Rect<N>) -> Self {
        Self {
            rect,
            p: rect.lo,
            index: 0,
            volume: rect.volume(),
        }
    }

    pub fn valid(&self) -> bool {
        self.index < self.volume
    }

    pub fn current(&self) -> Option<Point<N>> {
        self.valid().then_some(self.p)
    }

    /// Logical position of the cursor in row-major order.
    pub fn position(&self) -> u64 {
        self.index
    }

    pub fn step(&mut self) {
        if !self.valid() {
            return;
        }
        self.index += 1;
        if !self.valid() {
            return;
        }
        // last dimension fastest, carry into the slower ones
        for d in (0..N).rev() {
            if self.p[d] < self.rect.hi[d] {
                self.p[d] += 1;
                for inner in d + 1..N {
                    self.p[inner] = self.rect.lo[inner];
                }
                break;
            }
        }
    }

    /// Skip `k` logical positions.
    pub fn advance(&mut self, k: u64) {
        match k {
            0 => {}
            1 => self.step(),
            _ => {
                self.index = self.index.saturating_add(k).min(self.volume);
                if self.valid() {
                    self.p = self.rect.delinearize(self.index);
                }
            }
        }
    }

    pub fn restart(&mut self) {
        self.p = self.rect.lo;
        self.index = 0;
    }
}

impl<const N: usize> Iterator for PointInRectIterator<N> {
    type Item = Point<N>;

    fn next(&mut self) -> Option<Point<N>> {
        let p = self.current()?;
        self.step();
        Some(p)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.volume - self.index) as usize;
        (left, Some(left))
    }
}

impl<const N: usize> ExactSizeIterator for PointInRectIterator<N> {}
