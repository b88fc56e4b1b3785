//! Tree top detection on a canopy height raster.
//!
//! A cell is a tree top when no cell of the search window centred on it is
//! higher. Flat tops are resolved to one seed: equal-height cells that are
//! window-adjacent form a tie group, and the group yields its lowest
//! (row, col) member only if none of its members sees a higher cell.

use std::collections::VecDeque;

use log::debug;
use rayon::prelude::*;

use crate::error::{require_positive, Result, TreesegError};
use crate::raster::Raster;

/// A candidate tree apex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeedPoint {
    pub row: usize,
    pub col: usize,
    pub height: f64,
    /// 1-based, issued in row-major discovery order.
    pub id: u32,
}

/// Parameters for [`detect_treetops`].
#[derive(Debug, Clone)]
pub struct TreetopParams {
    /// Search window width in map units. Must convert to an odd number of
    /// cells along both axes.
    pub window_size: f64,
    /// Cells lower than this are never tree tops.
    pub min_height: Option<f64>,
}

impl Default for TreetopParams {
    fn default() -> Self {
        Self {
            window_size: 3.0,
            min_height: None,
        }
    }
}

/// Half-widths `(rows, cols)` of the search window, in cells.
pub fn window_half_widths(chm: &Raster, window_size: f64) -> Result<(usize, usize)> {
    require_positive("window_size", window_size)?;
    require_positive("res_x", chm.res_x)?;
    require_positive("res_y", chm.res_y)?;

    let half = |res: f64| -> Result<usize> {
        let cells = (window_size / res).round();
        if cells < 1.0 || cells % 2.0 == 0.0 {
            return Err(TreesegError::invalid(
                "window_size",
                format!(
                    "{} map units gives {} cells at resolution {}; need a positive odd count",
                    window_size, cells, res
                ),
            ));
        }
        Ok((cells as usize - 1) / 2)
    };
    Ok((half(chm.res_y)?, half(chm.res_x)?))
}

/// Detect tree tops. Seeds are returned in row-major order with ids `1..=n`.
pub fn detect_treetops(chm: &Raster, params: &TreetopParams) -> Result<Vec<SeedPoint>> {
    let (hr, hc) = window_half_widths(chm, params.window_size)?;
    if let Some(h) = params.min_height {
        if !h.is_finite() {
            return Err(TreesegError::invalid("min_height", "must be finite"));
        }
    }
    if chm.is_empty() {
        return Ok(Vec::new());
    }

    let ncol = chm.ncol;
    let mut candidate = vec![false; chm.len()];
    candidate
        .par_chunks_mut(ncol)
        .enumerate()
        .for_each(|(r, row)| {
            for (c, flag) in row.iter_mut().enumerate() {
                *flag = is_candidate(chm, r, c, hr, hc, params.min_height);
            }
        });

    let mut visited = vec![false; chm.len()];
    let mut seeds: Vec<SeedPoint> = Vec::new();
    let mut queue = VecDeque::new();

    for idx in 0..chm.len() {
        if !candidate[idx] || visited[idx] {
            continue;
        }
        let (r0, c0) = (idx / ncol, idx % ncol);
        let h = chm.data[idx];

        // Flood the tie group. Every earlier member would already have
        // started this group, so (r0, c0) is its lowest (row, col) cell.
        let mut all_candidates = true;
        visited[idx] = true;
        queue.push_back((r0, c0));
        while let Some((r, c)) = queue.pop_front() {
            if !candidate[r * ncol + c] {
                all_candidates = false;
            }
            for rr in r.saturating_sub(hr)..=r.saturating_add(hr).min(chm.nrow - 1) {
                for cc in c.saturating_sub(hc)..=c.saturating_add(hc).min(ncol - 1) {
                    let nidx = rr * ncol + cc;
                    if visited[nidx] || chm.height(rr, cc) != Some(h) {
                        continue;
                    }
                    visited[nidx] = true;
                    queue.push_back((rr, cc));
                }
            }
        }

        if all_candidates {
            seeds.push(SeedPoint {
                row: r0,
                col: c0,
                height: h,
                id: seeds.len() as u32 + 1,
            });
        }
    }

    debug!(
        "detect_treetops: {} seeds on {}x{} raster (window {}x{} cells)",
        seeds.len(),
        chm.nrow,
        chm.ncol,
        2 * hr + 1,
        2 * hc + 1
    );
    Ok(seeds)
}

/// No defined cell in the (clipped) window is strictly higher.
fn is_candidate(
    chm: &Raster,
    r: usize,
    c: usize,
    hr: usize,
    hc: usize,
    min_height: Option<f64>,
) -> bool {
    let h = match chm.height(r, c) {
        Some(h) => h,
        None => return false,
    };
    if min_height.is_some_and(|m| h < m) {
        return false;
    }
    for rr in r.saturating_sub(hr)..=r.saturating_add(hr).min(chm.nrow - 1) {
        for cc in c.saturating_sub(hc)..=c.saturating_add(hc).min(chm.ncol - 1) {
            if let Some(v) = chm.height(rr, cc) {
                if v > h {
                    return false;
                }
            }
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn raster(nrow: usize, ncol: usize, data: &[f64]) -> Raster {
        Raster::from_vec(nrow, ncol, data.to_vec()).unwrap()
    }

    fn single_peak() -> Raster {
        let mut chm = Raster::new(5, 5, 1.0);
        chm[(2, 2)] = 10.0;
        chm
    }

    /// Deterministic pseudo-random heights.
    fn noisy(nrow: usize, ncol: usize, seed: u64) -> Raster {
        let mut state = seed;
        let data = (0..nrow * ncol)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) % 8) as f64
            })
            .collect();
        Raster::from_vec(nrow, ncol, data).unwrap()
    }

    #[test]
    fn test_single_peak_gives_one_seed() {
        let seeds = detect_treetops(&single_peak(), &TreetopParams::default()).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!((seeds[0].row, seeds[0].col), (2, 2));
        assert_eq!(seeds[0].height, 10.0);
        assert_eq!(seeds[0].id, 1);
    }

    #[test]
    fn test_flat_plateau_gives_lowest_cell() {
        let chm = Raster::new(4, 6, 3.0);
        let seeds = detect_treetops(&chm, &TreetopParams::default()).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!((seeds[0].row, seeds[0].col), (0, 0));
    }

    #[test]
    fn test_tied_top_is_reported_once() {
        let chm = raster(1, 5, &[1.0, 5.0, 5.0, 1.0, 0.0]);
        let seeds = detect_treetops(&chm, &TreetopParams::default()).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!((seeds[0].row, seeds[0].col), (0, 1));
    }

    #[test]
    fn test_plateau_shoulder_gives_no_seed() {
        // (0, 0) ties only with (0, 1) in its own window, but the flat run
        // leads up to the taller cell, like the background of a single peak.
        let chm = raster(1, 4, &[5.0, 5.0, 5.0, 6.0]);
        let seeds = detect_treetops(&chm, &TreetopParams::default()).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!((seeds[0].row, seeds[0].col), (0, 3));

        let corner_only = detect_treetops(&single_peak(), &TreetopParams::default()).unwrap();
        assert!(corner_only.iter().all(|s| (s.row, s.col) != (0, 0)));
    }

    #[test]
    fn test_two_peaks_in_discovery_order() {
        let mut chm = Raster::new(5, 9, 1.0);
        chm[(3, 1)] = 12.0;
        chm[(1, 7)] = 9.0;
        let seeds = detect_treetops(&chm, &TreetopParams::default()).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!((seeds[0].row, seeds[0].col, seeds[0].id), (1, 7, 1));
        assert_eq!((seeds[1].row, seeds[1].col, seeds[1].id), (3, 1, 2));
    }

    #[test]
    fn test_border_cell_uses_clipped_window() {
        let chm = raster(3, 3, &[9.0, 2.0, 1.0, 2.0, 2.0, 1.0, 1.0, 1.0, 1.0]);
        let seeds = detect_treetops(&chm, &TreetopParams::default()).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!((seeds[0].row, seeds[0].col), (0, 0));
    }

    #[test]
    fn test_nodata_is_skipped() {
        let nan = f64::NAN;
        let chm = raster(3, 3, &[nan, nan, nan, nan, 4.0, nan, nan, nan, nan]);
        let seeds = detect_treetops(&chm, &TreetopParams::default()).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!((seeds[0].row, seeds[0].col), (1, 1));

        let empty = Raster::new(3, 3, nan);
        assert!(detect_treetops(&empty, &TreetopParams::default()).unwrap().is_empty());
    }

    #[test]
    fn test_min_height_filters_seeds() {
        let mut chm = Raster::new(5, 9, 0.0);
        chm[(2, 1)] = 12.0;
        chm[(2, 7)] = 3.0;
        let params = TreetopParams {
            min_height: Some(5.0),
            ..Default::default()
        };
        let seeds = detect_treetops(&chm, &params).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].height, 12.0);
    }

    #[test]
    fn test_window_conversion() {
        let chm = Raster::new(5, 5, 0.0).with_resolution(0.5, 0.5);
        assert_eq!(window_half_widths(&chm, 1.5).unwrap(), (1, 1));
        assert_eq!(window_half_widths(&chm, 2.5).unwrap(), (2, 2));
        assert!(window_half_widths(&chm, 2.0).is_err());

        let anisotropic = Raster::new(5, 5, 0.0).with_resolution(1.0, 3.0);
        assert_eq!(window_half_widths(&anisotropic, 3.0).unwrap(), (0, 1));
    }

    #[test]
    fn test_invalid_window_fails() {
        let chm = single_peak();
        for ws in [0.0, -3.0, 2.0, 4.0, f64::NAN] {
            let params = TreetopParams {
                window_size: ws,
                ..Default::default()
            };
            let err = detect_treetops(&chm, &params).unwrap_err();
            assert!(err.is_invalid_parameter(), "window {} should fail", ws);
        }
    }

    #[test]
    fn test_seeds_dominate_their_window() {
        for seed in 1..6 {
            let chm = noisy(12, 15, seed);
            let params = TreetopParams {
                window_size: 5.0,
                ..Default::default()
            };
            let seeds = detect_treetops(&chm, &params).unwrap();
            assert!(!seeds.is_empty());
            let mut cells = std::collections::HashSet::new();
            for s in &seeds {
                assert!(cells.insert((s.row, s.col)), "duplicate seed cell");
                for dr in -2isize..=2 {
                    for dc in -2isize..=2 {
                        if let Some(v) = chm.get_opt(s.row as isize + dr, s.col as isize + dc) {
                            assert!(s.height >= v);
                        }
                    }
                }
            }
            for (i, s) in seeds.iter().enumerate() {
                assert_eq!(s.id as usize, i + 1);
            }
        }
    }

    #[test]
    fn test_detection_is_deterministic() {
        let chm = noisy(20, 20, 42);
        let a = detect_treetops(&chm, &TreetopParams::default()).unwrap();
        let b = detect_treetops(&chm, &TreetopParams::default()).unwrap();
        assert_eq!(a, b);
    }
}
