//! Seeded crown growth over a canopy height raster.
//!
//! All seeds grow through one shared min-heap ordered by planar distance to
//! their own seed, so a cell reachable from several crowns goes to the
//! nearest seed (lower id on exact ties). A 4-connected neighbour is
//! annexed when it is unassigned, at least `crown_threshold × seed height`
//! high, and within `max_distance` of the seed.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use log::debug;

use crate::error::{require_positive, Result, TreesegError};
use crate::raster::{LabelRaster, Raster, UNASSIGNED};
use crate::treetops::SeedPoint;

/// Which reference height a seed is compared against before growth starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedGating {
    /// Keep a seed only if `height ≥ seed_threshold × raster maximum`.
    GlobalMaximum,
    /// Keep a seed only if `height ≥ seed_threshold × highest cell within
    /// max_distance of it`.
    #[default]
    LocalNeighborhood,
    /// Keep every seed.
    Disabled,
}

/// Parameters for [`expand_crowns`].
///
/// Defaults follow Dalponte & Coomes (2016) as exposed by lidR:
/// `th_seed = 0.45`, `th_cr = 0.55`, `max_cr = 10`.
#[derive(Debug, Clone)]
pub struct CrownParams {
    pub seed_threshold: f64,
    pub crown_threshold: f64,
    /// Maximum planar distance (map units) between a crown cell and its seed.
    pub max_distance: f64,
    pub seed_gating: SeedGating,
}

impl Default for CrownParams {
    fn default() -> Self {
        Self {
            seed_threshold: 0.45,
            crown_threshold: 0.55,
            max_distance: 10.0,
            seed_gating: SeedGating::default(),
        }
    }
}

impl CrownParams {
    pub fn validate(&self) -> Result<()> {
        require_positive("seed_threshold", self.seed_threshold)?;
        require_positive("crown_threshold", self.crown_threshold)?;
        require_positive("max_distance", self.max_distance)?;
        Ok(())
    }
}

/// Frontier entry. Ordered so that the nearest cell pops first, then the
/// lower seed id, then row-major position.
#[derive(Debug)]
struct FrontierItem {
    distance: f64,
    seed: usize,
    row: usize,
    col: usize,
}

impl PartialEq for FrontierItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for FrontierItem {}

impl PartialOrd for FrontierItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.seed.cmp(&other.seed))
            .then(self.row.cmp(&other.row))
            .then(self.col.cmp(&other.col))
    }
}

/// A seed that survived validation and gating.
#[derive(Debug, Clone, Copy)]
struct ActiveSeed {
    id: u32,
    row: usize,
    col: usize,
    min_height: f64,
}

/// Grow crowns from `seeds` and return the label raster.
///
/// Seeds keep their own ids as labels. Seeds dropped by gating, seeds on
/// no-data cells and the later of two seeds sharing a cell do not grow.
pub fn expand_crowns(
    chm: &Raster,
    seeds: &[SeedPoint],
    params: &CrownParams,
) -> Result<LabelRaster> {
    params.validate()?;
    require_positive("res_x", chm.res_x)?;
    require_positive("res_y", chm.res_y)?;
    validate_seeds(chm, seeds)?;

    let mut labels = LabelRaster::like(chm);
    let active = gate_seeds(chm, seeds, params);

    let mut heap: BinaryHeap<Reverse<FrontierItem>> = BinaryHeap::new();
    // Seeds sorted by id so equal-distance ties resolve to the lower id.
    for (i, s) in active.iter().enumerate() {
        heap.push(Reverse(FrontierItem {
            distance: 0.0,
            seed: i,
            row: s.row,
            col: s.col,
        }));
    }

    // 4-connected neighbours
    let neighbors: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

    while let Some(Reverse(item)) = heap.pop() {
        if labels.get(item.row, item.col) != UNASSIGNED {
            continue;
        }
        let seed = active[item.seed];
        labels.set(item.row, item.col, seed.id);

        for &(dr, dc) in &neighbors {
            let nr = item.row as isize + dr;
            let nc = item.col as isize + dc;
            let h = match chm.get_opt(nr, nc) {
                Some(h) => h,
                None => continue,
            };
            let (nr, nc) = (nr as usize, nc as usize);
            if labels.get(nr, nc) != UNASSIGNED || h < seed.min_height {
                continue;
            }
            let distance = chm.cell_distance((seed.row, seed.col), (nr, nc));
            if distance > params.max_distance {
                continue;
            }
            heap.push(Reverse(FrontierItem {
                distance,
                seed: item.seed,
                row: nr,
                col: nc,
            }));
        }
    }

    debug!(
        "expand_crowns: {}/{} seeds grown, {} cells labelled",
        active.len(),
        seeds.len(),
        labels.assigned_count()
    );
    Ok(labels)
}

fn validate_seeds(chm: &Raster, seeds: &[SeedPoint]) -> Result<()> {
    let mut ids: Vec<u32> = Vec::with_capacity(seeds.len());
    for s in seeds {
        if s.row >= chm.nrow || s.col >= chm.ncol {
            return Err(TreesegError::invalid(
                "seeds",
                format!(
                    "seed {} at ({}, {}) lies outside the {}x{} raster",
                    s.id, s.row, s.col, chm.nrow, chm.ncol
                ),
            ));
        }
        if s.id == UNASSIGNED {
            return Err(TreesegError::invalid("seeds", "seed id 0 is reserved"));
        }
        if !s.height.is_finite() {
            return Err(TreesegError::invalid(
                "seeds",
                format!("seed {} has a non-finite height", s.id),
            ));
        }
        ids.push(s.id);
    }
    ids.sort_unstable();
    if let Some(w) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(TreesegError::invalid(
            "seeds",
            format!("duplicate seed id {}", w[0]),
        ));
    }
    Ok(())
}

/// Apply seed gating and return surviving seeds sorted by id.
fn gate_seeds(chm: &Raster, seeds: &[SeedPoint], params: &CrownParams) -> Vec<ActiveSeed> {
    let mut sorted: Vec<&SeedPoint> = seeds.iter().collect();
    sorted.sort_by_key(|s| s.id);

    let global_max = chm.max_height();
    let mut occupied = vec![false; chm.len()];
    let mut active = Vec::with_capacity(sorted.len());

    for s in sorted {
        let idx = s.row * chm.ncol + s.col;
        if occupied[idx] || chm.height(s.row, s.col).is_none() {
            continue;
        }
        let reference = match params.seed_gating {
            SeedGating::GlobalMaximum => global_max,
            SeedGating::LocalNeighborhood => local_max(chm, s, params.max_distance),
            SeedGating::Disabled => None,
        };
        if let Some(reference) = reference {
            if s.height < params.seed_threshold * reference {
                continue;
            }
        }
        occupied[idx] = true;
        active.push(ActiveSeed {
            id: s.id,
            row: s.row,
            col: s.col,
            min_height: params.crown_threshold * s.height,
        });
    }
    active
}

/// Highest defined cell within `radius` (map units) of the seed.
fn local_max(chm: &Raster, s: &SeedPoint, radius: f64) -> Option<f64> {
    let hr = (radius / chm.res_y).floor() as usize;
    let hc = (radius / chm.res_x).floor() as usize;
    let mut best: Option<f64> = None;
    for r in s.row.saturating_sub(hr)..=s.row.saturating_add(hr).min(chm.nrow - 1) {
        for c in s.col.saturating_sub(hc)..=s.col.saturating_add(hc).min(chm.ncol - 1) {
            if chm.cell_distance((s.row, s.col), (r, c)) > radius {
                continue;
            }
            if let Some(v) = chm.height(r, c) {
                best = Some(best.map_or(v, |b| b.max(v)));
            }
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
