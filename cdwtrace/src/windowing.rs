// Sliding window grid over a raster
// Windows overlap by tile_size - stride and never leave the raster bounds

use cdwtrace_common::Window;

use crate::error::{CdwError, Result};

/// Deterministic row-major grid of overlapping windows
///
/// The grid is a plain value: iterating it twice yields the same sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGrid {
    width: u32,
    height: u32,
    tile_size: u32,
    stride: u32,
    extend_to_edges: bool,
    n_cols: u32,
    n_rows: u32,
}

impl WindowGrid {
    /// Grid with `max(1, (dim - tile_size) / stride + 1)` windows per axis
    pub fn new(width: u32, height: u32, tile_size: u32, stride: u32) -> Result<Self> {
        Self::build(width, height, tile_size, stride, false)
    }

    /// Like [`WindowGrid::new`], plus one extra window per axis when the last
    /// regular window stops short of the far edge. With `stride <= tile_size`
    /// the union of windows covers the whole raster.
    pub fn covering(width: u32, height: u32, tile_size: u32, stride: u32) -> Result<Self> {
        Self::build(width, height, tile_size, stride, true)
    }

    pub fn with_edges(
        width: u32,
        height: u32,
        tile_size: u32,
        stride: u32,
        extend_to_edges: bool,
    ) -> Result<Self> {
        Self::build(width, height, tile_size, stride, extend_to_edges)
    }

    fn build(
        width: u32,
        height: u32,
        tile_size: u32,
        stride: u32,
        extend_to_edges: bool,
    ) -> Result<Self> {
        if tile_size == 0 {
            return Err(CdwError::invalid("tile size must be at least 1 pixel"));
        }
        if stride == 0 {
            return Err(CdwError::invalid("stride must be at least 1 pixel"));
        }
        if width == 0 || height == 0 {
            return Err(CdwError::invalid(format!(
                "cannot tile an empty {}x{} raster",
                width, height
            )));
        }

        Ok(Self {
            width,
            height,
            tile_size,
            stride,
            extend_to_edges,
            n_cols: axis_count(width, tile_size, stride, extend_to_edges),
            n_rows: axis_count(height, tile_size, stride, extend_to_edges),
        })
    }

    pub fn n_cols(&self) -> u32 {
        self.n_cols
    }

    pub fn n_rows(&self) -> u32 {
        self.n_rows
    }

    pub fn len(&self) -> usize {
        self.n_cols as usize * self.n_rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Window at grid position (row, col)
    pub fn window(&self, row: u32, col: u32) -> Window {
        Window {
            col_off: axis_offset(col, self.width, self.tile_size, self.stride),
            row_off: axis_offset(row, self.height, self.tile_size, self.stride),
            width: self.tile_size.min(self.width),
            height: self.tile_size.min(self.height),
        }
    }

    /// All windows, all columns of row 0 first
    pub fn iter(&self) -> impl Iterator<Item = Window> + '_ {
        (0..self.n_rows).flat_map(move |row| (0..self.n_cols).map(move |col| self.window(row, col)))
    }
}

impl<'a> IntoIterator for &'a WindowGrid {
    type Item = Window;
    type IntoIter = Box<dyn Iterator<Item = Window> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

fn axis_count(dim: u32, tile_size: u32, stride: u32, extend_to_edges: bool) -> u32 {
    if tile_size >= dim {
        return 1;
    }
    let regular = ((dim - tile_size) / stride + 1).max(1);
    let last_end = (regular - 1) * stride + tile_size;
    if extend_to_edges && last_end < dim {
        regular + 1
    } else {
        regular
    }
}

fn axis_offset(index: u32, dim: u32, tile_size: u32, stride: u32) -> u32 {
    if tile_size >= dim {
        return 0;
    }
    index.saturating_mul(stride).min(dim - tile_size)
}
