//! Regions of the position sequence
//!
//! The sequence fed to a DiT is a concatenation of blocks (image patches,
//! reference images, caption tokens, padding). Each block is a [`Region`]
//! with one [`Coordinate`] rule per axis.

/// Local position inside a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalPosition {
    pub frame: usize,
    pub row: usize,
    pub column: usize,
    /// Linear index within the region
    pub index: usize,
}

/// Which local quantity a coordinate reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Source {
    /// Always zero, so the coordinate equals its offset
    Zero,
    Frame,
    Row,
    Column,
    Index,
    /// Causal midpoint of a compressed frame: with stride `s`, frame `i`
    /// covers source frames `max(0, s*i - (s - 1))..=s*i`, and the value is
    /// the sum of the two ends plus one
    CausalFrame { stride: usize },
}

/// `scale * source + offset`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub source: Source,
    pub scale: f64,
    pub offset: f64,
}

impl Coordinate {
    fn of(source: Source) -> Self {
        Self {
            source,
            scale: 1.0,
            offset: 0.0,
        }
    }

    /// Identity rotation
    pub fn zero() -> Self {
        Self::of(Source::Zero)
    }

    pub fn constant(value: f64) -> Self {
        Self::zero().shifted(value)
    }

    pub fn frame() -> Self {
        Self::of(Source::Frame)
    }

    pub fn row() -> Self {
        Self::of(Source::Row)
    }

    pub fn column() -> Self {
        Self::of(Source::Column)
    }

    pub fn index() -> Self {
        Self::of(Source::Index)
    }

    pub fn causal_frame(stride: usize) -> Self {
        Self::of(Source::CausalFrame { stride })
    }

    /// Adds `offset` to the coordinate
    pub fn shifted(mut self, offset: f64) -> Self {
        self.offset += offset;
        self
    }

    /// Multiplies the coordinate, including any offset already applied
    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale *= scale;
        self.offset *= scale;
        self
    }

    /// Evaluates the coordinate at a local position
    pub fn value(&self, at: LocalPosition) -> f64 {
        let raw = match self.source {
            Source::Zero => 0.0,
            Source::Frame => at.frame as f64,
            Source::Row => at.row as f64,
            Source::Column => at.column as f64,
            Source::Index => at.index as f64,
            Source::CausalFrame { stride } => {
                let end = at.frame * stride;
                let start = end.saturating_sub(stride.saturating_sub(1));
                (start + end + 1) as f64
            }
        };
        raw * self.scale + self.offset
    }
}

/// Extent of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionShape {
    /// Raster-ordered grid, frame-major then row-major
    Grid {
        time: usize,
        height: usize,
        width: usize,
    },
    Sequence { len: usize },
}

/// Contiguous block of sequence positions sharing one coordinate rule
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub name: String,
    pub shape: RegionShape,
    pub coordinates: Vec<Coordinate>,
}

impl Region {
    /// A `time x height x width` grid
    pub fn grid(
        name: impl Into<String>,
        time: usize,
        height: usize,
        width: usize,
        coordinates: Vec<Coordinate>,
    ) -> Self {
        Self {
            name: name.into(),
            shape: RegionShape::Grid {
                time,
                height,
                width,
            },
            coordinates,
        }
    }

    /// A single-frame `height x width` grid
    pub fn image(
        name: impl Into<String>,
        height: usize,
        width: usize,
        coordinates: Vec<Coordinate>,
    ) -> Self {
        Self::grid(name, 1, height, width, coordinates)
    }

    pub fn sequence(name: impl Into<String>, len: usize, coordinates: Vec<Coordinate>) -> Self {
        Self {
            name: name.into(),
            shape: RegionShape::Sequence { len },
            coordinates,
        }
    }

    /// Identity rotation on every axis
    pub fn padding(len: usize, axes: usize) -> Self {
        Self::sequence("padding", len, vec![Coordinate::zero(); axes])
    }

    /// Number of positions
    pub fn len(&self) -> usize {
        match self.shape {
            RegionShape::Grid {
                time,
                height,
                width,
            } => time * height * width,
            RegionShape::Sequence { len } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decomposes a linear index into frame, row and column
    pub fn locate(&self, index: usize) -> LocalPosition {
        match self.shape {
            RegionShape::Grid { height, width, .. } => LocalPosition {
                frame: index / (height * width),
                row: index / width % height,
                column: index % width,
                index,
            },
            RegionShape::Sequence { .. } => LocalPosition {
                index,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_locate_is_raster_order() {
        let r = Region::grid("video", 2, 3, 4, vec![]);
        assert_eq!(r.len(), 24);
        let p = r.locate(12 + 4 + 3);
        assert_eq!((p.frame, p.row, p.column), (1, 1, 3));
    }

    #[test]
    fn test_non_square_grid_uses_width_stride() {
        let r = Region::image("img", 2, 5, vec![]);
        let p = r.locate(7);
        assert_eq!((p.row, p.column), (1, 2));
    }

    #[test]
    fn test_coordinate_affine() {
        let at = LocalPosition {
            row: 3,
            ..Default::default()
        };
        assert_eq!(Coordinate::row().shifted(2.0).value(at), 5.0);
        // scaling applies to offsets already present
        assert_eq!(Coordinate::row().shifted(1.0).scaled(0.5).value(at), 2.0);
        assert_eq!(Coordinate::constant(10.0).value(at), 10.0);
        assert_eq!(Coordinate::zero().value(at), 0.0);
    }

    #[test]
    fn test_causal_frame() {
        let c = Coordinate::causal_frame(8);
        let frame = |frame| LocalPosition {
            frame,
            ..Default::default()
        };
        // frame 0 only covers source frame 0
        assert_eq!(c.value(frame(0)), 1.0);
        // frame 1 covers source frames 1..=8
        assert_eq!(c.value(frame(1)), 10.0);
        assert_eq!(c.value(frame(2)), 26.0);
    }
}
