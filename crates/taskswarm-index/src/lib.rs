//! Spatial primitives for the taskswarm simulation: a bounded 2D continuous
//! space with configurable boundary handling and a uniform-grid neighbor index.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial primitives at construction time.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Space extents that cannot describe a usable world.
    #[error("invalid space: {0}")]
    InvalidSpace(&'static str),
    /// Grid parameters that cannot be used (e.g. non-positive cell size).
    #[error("invalid grid: {0}")]
    InvalidGrid(&'static str),
    /// A boundary-mode string that names no known mode.
    #[error("unknown boundary mode `{0}` (expected `clamp` or `wrap`)")]
    UnknownBoundaryMode(String),
}

/// How positions that leave the space are brought back inside.
///
/// The boundary mode changes only movement and the distance metric; radius
/// query semantics are identical under both modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryMode {
    /// Positions are clamped into `[0, extent)` on each axis.
    Clamp,
    /// The space is toroidal; coordinates wrap around each axis.
    #[default]
    Wrap,
}

impl BoundaryMode {
    /// Canonical configuration string for this mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Clamp => "clamp",
            Self::Wrap => "wrap",
        }
    }
}

impl std::str::FromStr for BoundaryMode {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clamp" => Ok(Self::Clamp),
            "wrap" => Ok(Self::Wrap),
            other => Err(IndexError::UnknownBoundaryMode(other.to_string())),
        }
    }
}

/// Bounded 2D continuous space covering `[0, width) x [0, height)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Space {
    width: f32,
    height: f32,
    mode: BoundaryMode,
}

impl Space {
    /// Construct a space, rejecting non-positive or non-finite extents.
    pub fn new(width: f32, height: f32, mode: BoundaryMode) -> Result<Self, IndexError> {
        if !width.is_finite() || !height.is_finite() {
            return Err(IndexError::InvalidSpace("extents must be finite"));
        }
        if width <= 0.0 || height <= 0.0 {
            return Err(IndexError::InvalidSpace("extents must be positive"));
        }
        Ok(Self {
            width,
            height,
            mode,
        })
    }

    #[must_use]
    pub const fn width(&self) -> f32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> f32 {
        self.height
    }

    #[must_use]
    pub const fn mode(&self) -> BoundaryMode {
        self.mode
    }

    fn clamp_axis(value: f32, extent: f32) -> f32 {
        if value.is_nan() {
            return 0.0;
        }
        // Upper bound stays strictly below `extent` so clamped positions
        // remain inside the half-open interval.
        value.clamp(0.0, extent * (1.0 - f32::EPSILON))
    }

    fn wrap_axis(value: f32, extent: f32) -> f32 {
        if !value.is_finite() || extent <= 0.0 {
            return 0.0;
        }
        let mut v = value % extent;
        if v < 0.0 {
            v += extent;
        }
        v
    }

    /// Bring a position back inside the space according to the boundary mode.
    #[must_use]
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        match self.mode {
            BoundaryMode::Clamp => (
                Self::clamp_axis(x, self.width),
                Self::clamp_axis(y, self.height),
            ),
            BoundaryMode::Wrap => (
                Self::wrap_axis(x, self.width),
                Self::wrap_axis(y, self.height),
            ),
        }
    }

    /// Whether a position lies inside `[0, width) x [0, height)`.
    #[must_use]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= 0.0 && x < self.width && y >= 0.0 && y < self.height
    }

    /// Shortest displacement vector from `from` to `to`.
    ///
    /// Under `Wrap` this is the minimum-image displacement across the torus.
    #[must_use]
    pub fn displacement(&self, from: (f32, f32), to: (f32, f32)) -> (f32, f32) {
        let mut dx = to.0 - from.0;
        let mut dy = to.1 - from.1;
        if self.mode == BoundaryMode::Wrap {
            if dx > self.width * 0.5 {
                dx -= self.width;
            } else if dx < -self.width * 0.5 {
                dx += self.width;
            }
            if dy > self.height * 0.5 {
                dy -= self.height;
            } else if dy < -self.height * 0.5 {
                dy += self.height;
            }
        }
        (dx, dy)
    }

    /// Distance between two positions under the configured boundary mode.
    #[must_use]
    pub fn distance(&self, a: (f32, f32), b: (f32, f32)) -> f32 {
        let (dx, dy) = self.displacement(a, b);
        dx.hypot(dy)
    }
}

/// Uniform-grid neighbor index over a slice of positions.
///
/// Rebuilt once per tick; entry indices handed to the visitor refer to the
/// slice passed to the latest [`UniformGrid::rebuild`].
#[derive(Debug, Clone)]
pub struct UniformGrid {
    space: Space,
    cell_size: f32,
    cols: usize,
    rows: usize,
    buckets: Vec<Vec<u32>>,
    positions: Vec<(f32, f32)>,
}

impl UniformGrid {
    /// Create an empty grid covering `space` with square cells of `cell_size`.
    pub fn new(space: Space, cell_size: f32) -> Result<Self, IndexError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(IndexError::InvalidGrid("cell_size must be positive"));
        }
        let cols = ((space.width() / cell_size).ceil() as usize).max(1);
        let rows = ((space.height() / cell_size).ceil() as usize).max(1);
        Ok(Self {
            space,
            cell_size,
            cols,
            rows,
            buckets: vec![Vec::new(); cols * rows],
            positions: Vec::new(),
        })
    }

    /// Number of indexed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn cell_coords(&self, x: f32, y: f32) -> (usize, usize) {
        let cx = ((x / self.cell_size).floor().max(0.0) as usize).min(self.cols - 1);
        let cy = ((y / self.cell_size).floor().max(0.0) as usize).min(self.rows - 1);
        (cx, cy)
    }

    /// Rebuild internal buckets from the provided positions.
    pub fn rebuild(&mut self, positions: &[(f32, f32)]) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let (cx, cy) = self.cell_coords(x, y);
            self.buckets[cy * self.cols + cx].push(idx as u32);
        }
    }

    fn axis_cells(center: usize, span: usize, count: usize, mode: BoundaryMode) -> Vec<usize> {
        if 2 * span + 1 >= count {
            return (0..count).collect();
        }
        let mut cells = Vec::with_capacity(2 * span + 1);
        let center = center as isize;
        let count = count as isize;
        for offset in -(span as isize)..=(span as isize) {
            let cell = center + offset;
            match mode {
                BoundaryMode::Wrap => cells.push(cell.rem_euclid(count) as usize),
                BoundaryMode::Clamp => {
                    if (0..count).contains(&cell) {
                        cells.push(cell as usize);
                    }
                }
            }
        }
        cells
    }

    /// Visit every indexed entry within `radius` of `origin` as
    /// `(entry index, distance)`. The origin entry itself is visited too when
    /// indexed; callers exclude it by index.
    pub fn neighbors_within(
        &self,
        origin: (f32, f32),
        radius: f32,
        visitor: &mut dyn FnMut(usize, f32),
    ) {
        if radius < 0.0 || self.positions.is_empty() {
            return;
        }
        let mode = self.space.mode();
        let mut span = (radius / self.cell_size).ceil() as usize;
        if mode == BoundaryMode::Wrap {
            // The last row/column may be narrower than cell_size when the
            // extent is not an exact multiple; one extra cell keeps seam
            // crossings covered.
            span += 1;
        }
        let (cx, cy) = self.cell_coords(origin.0, origin.1);
        let col_cells = Self::axis_cells(cx, span, self.cols, mode);
        let row_cells = Self::axis_cells(cy, span, self.rows, mode);
        for &row in &row_cells {
            for &col in &col_cells {
                for &entry in &self.buckets[row * self.cols + col] {
                    let idx = entry as usize;
                    let distance = self.space.distance(origin, self.positions[idx]);
                    if distance <= radius {
                        visitor(idx, distance);
                    }
                }
            }
        }
    }
}
