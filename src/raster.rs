//! Canopy height grid and crown label grid.

use std::ops::{Index, IndexMut};

use crate::error::{Result, TreesegError};

/// Label value of a cell (or point) that belongs to no tree.
pub const UNASSIGNED: u32 = 0;

/// A 2D height raster (row-major). Origin is top-left.
///
/// Geo-referencing: pixel (r, c) maps to world coordinates:
///   x = xmin + (c + 0.5) * res_x
///   y = ymax - (r + 0.5) * res_y
///
/// A cell is "no data" when it holds NaN or equals `nodata`.
#[derive(Debug, Clone)]
pub struct Raster {
    pub nrow: usize,
    pub ncol: usize,
    pub data: Vec<f64>,
    /// Resolution in X direction (cell width)
    pub res_x: f64,
    /// Resolution in Y direction (cell height)
    pub res_y: f64,
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    /// Explicit no-data sentinel, in addition to NaN.
    pub nodata: Option<f64>,
}

impl Raster {
    /// Create a new raster filled with a constant value.
    pub fn new(nrow: usize, ncol: usize, fill: f64) -> Self {
        Self {
            nrow,
            ncol,
            data: vec![fill; nrow * ncol],
            res_x: 1.0,
            res_y: 1.0,
            xmin: 0.0,
            xmax: ncol as f64,
            ymin: 0.0,
            ymax: nrow as f64,
            nodata: None,
        }
    }

    /// Create a raster from an existing Vec (row-major).
    pub fn from_vec(nrow: usize, ncol: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != nrow * ncol {
            return Err(TreesegError::invalid(
                "data",
                format!(
                    "expected {} cells for a {}x{} raster, got {}",
                    nrow * ncol,
                    nrow,
                    ncol,
                    data.len()
                ),
            ));
        }
        Ok(Self {
            nrow,
            ncol,
            data,
            res_x: 1.0,
            res_y: 1.0,
            xmin: 0.0,
            xmax: ncol as f64,
            ymin: 0.0,
            ymax: nrow as f64,
            nodata: None,
        })
    }

    /// Set the geographic extent; resolution is derived from it.
    pub fn with_extent(mut self, xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Self {
        self.xmin = xmin;
        self.xmax = xmax;
        self.ymin = ymin;
        self.ymax = ymax;
        self.res_x = (xmax - xmin) / self.ncol as f64;
        self.res_y = (ymax - ymin) / self.nrow as f64;
        self
    }

    /// Set a cell size, keeping the top-left corner in place.
    pub fn with_resolution(mut self, res_x: f64, res_y: f64) -> Self {
        self.res_x = res_x;
        self.res_y = res_y;
        self.xmax = self.xmin + self.ncol as f64 * res_x;
        self.ymin = self.ymax - self.nrow as f64 * res_y;
        self
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    #[inline]
    pub fn is_nodata(&self, v: f64) -> bool {
        v.is_nan() || self.nodata == Some(v)
    }

    /// Height at (row, col); `None` when out of bounds or no data.
    #[inline]
    pub fn height(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.nrow && col < self.ncol {
            let v = self.data[row * self.ncol + col];
            if self.is_nodata(v) { None } else { Some(v) }
        } else {
            None
        }
    }

    /// Signed-index variant of [`Raster::height`] for neighbourhood walks.
    #[inline]
    pub fn get_opt(&self, row: isize, col: isize) -> Option<f64> {
        if row >= 0 && col >= 0 {
            self.height(row as usize, col as usize)
        } else {
            None
        }
    }

    /// Highest defined cell, `None` for an all no-data raster.
    pub fn max_height(&self) -> Option<f64> {
        self.data
            .iter()
            .copied()
            .filter(|v| !self.is_nodata(*v))
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
    }

    /// Convert row,col to world X,Y (cell centre).
    pub fn rc_to_xy(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.xmin + (col as f64 + 0.5) * self.res_x;
        let y = self.ymax - (row as f64 + 0.5) * self.res_y;
        (x, y)
    }

    /// Planar distance in map units between two cells.
    #[inline]
    pub fn cell_distance(&self, a: (usize, usize), b: (usize, usize)) -> f64 {
        let dy = (a.0 as f64 - b.0 as f64) * self.res_y;
        let dx = (a.1 as f64 - b.1 as f64) * self.res_x;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn len(&self) -> usize {
        self.nrow * self.ncol
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Index<(usize, usize)> for Raster {
    type Output = f64;
    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        &self.data[r * self.ncol + c]
    }
}

impl IndexMut<(usize, usize)> for Raster {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        &mut self.data[r * self.ncol + c]
    }
}

/// Crown label grid. Same shape and geo-referencing as the height raster it
/// was grown on; cells hold a tree id or [`UNASSIGNED`].
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRaster {
    pub nrow: usize,
    pub ncol: usize,
    pub data: Vec<u32>,
    pub res_x: f64,
    pub res_y: f64,
    pub xmin: f64,
    pub ymax: f64,
}

impl LabelRaster {
    /// All-unassigned label grid matching `chm`.
    pub fn like(chm: &Raster) -> Self {
        Self {
            nrow: chm.nrow,
            ncol: chm.ncol,
            data: vec![UNASSIGNED; chm.len()],
            res_x: chm.res_x,
            res_y: chm.res_y,
            xmin: chm.xmin,
            ymax: chm.ymax,
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u32 {
        self.data[row * self.ncol + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, id: u32) {
        self.data[row * self.ncol + col] = id;
    }

    /// Cells carrying `id`, in row-major order.
    pub fn cells_of(&self, id: u32) -> Vec<(usize, usize)> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == id)
            .map(|(i, _)| (i / self.ncol, i % self.ncol))
            .collect()
    }

    pub fn assigned_count(&self) -> usize {
        self.data.iter().filter(|&&v| v != UNASSIGNED).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(Raster::from_vec(2, 2, vec![1.0; 3]).is_err());
        assert!(Raster::from_vec(2, 2, vec![1.0; 4]).is_ok());
    }

    #[test]
    fn test_nodata_sentinel() {
        let r = Raster::from_vec(1, 3, vec![-9999.0, f64::NAN, 4.0])
            .unwrap()
            .with_nodata(-9999.0);
        assert_eq!(r.height(0, 0), None);
        assert_eq!(r.height(0, 1), None);
        assert_eq!(r.height(0, 2), Some(4.0));
        assert_eq!(r.height(0, 3), None);
        assert_eq!(r.max_height(), Some(4.0));
    }

    #[test]
    fn test_max_height_all_nodata() {
        let r = Raster::new(3, 3, f64::NAN);
        assert_eq!(r.max_height(), None);
    }

    #[test]
    fn test_resolution_and_coordinates() {
        let r = Raster::new(4, 5, 0.0).with_resolution(2.0, 0.5);
        assert_eq!(r.xmax, 10.0);
        assert_eq!(r.ymin, 2.0);
        assert_eq!(r.rc_to_xy(0, 0), (1.0, 3.75));
        assert!((r.cell_distance((0, 0), (1, 1)) - (4.0f64 + 0.25).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_label_raster_cells_of() {
        let chm = Raster::new(2, 3, 1.0);
        let mut labels = LabelRaster::like(&chm);
        labels.set(0, 2, 7);
        labels.set(1, 0, 7);
        assert_eq!(labels.cells_of(7), vec![(0, 2), (1, 0)]);
        assert_eq!(labels.assigned_count(), 2);
    }
}
