//! Incremental planar index of already-segmented points.

use kdtree::distance::squared_euclidean;
use kdtree::KdTree;

use crate::error::{Result, TreesegError};

/// A previously inserted point, as seen by a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Position of the point in processing order.
    pub rank: usize,
    /// Segment the point was assigned to.
    pub segment: u32,
}

/// Planar nearest-neighbour lookup that grows as points are processed.
pub trait SpatialIndex {
    fn insert(&mut self, x: f64, y: f64, neighbor: Neighbor) -> Result<()>;

    /// Nearest inserted point within `radius` of (x, y); on equal distance
    /// the lowest `rank` wins.
    fn nearest_within(&self, x: f64, y: f64, radius: f64) -> Result<Option<Neighbor>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`SpatialIndex`] backed by a `kdtree::KdTree` on (x, y).
pub struct KdTreeIndex {
    tree: KdTree<f64, Neighbor, [f64; 2]>,
}

impl KdTreeIndex {
    /// Points per leaf bucket.
    const BUCKET: usize = 64;

    pub fn new() -> Self {
        Self {
            tree: KdTree::with_capacity(2, Self::BUCKET),
        }
    }
}

impl Default for KdTreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn index_error(e: kdtree::ErrorKind) -> TreesegError {
    TreesegError::invalid("points", format!("spatial index rejected a point: {:?}", e))
}

impl SpatialIndex for KdTreeIndex {
    fn insert(&mut self, x: f64, y: f64, neighbor: Neighbor) -> Result<()> {
        self.tree.add([x, y], neighbor).map_err(index_error)
    }

    fn nearest_within(&self, x: f64, y: f64, radius: f64) -> Result<Option<Neighbor>> {
        if self.tree.size() == 0 {
            return Ok(None);
        }
        let query = [x, y];
        let limit = radius * radius;
        let mut best: Option<(f64, Neighbor)> = None;
        // Ascending distance: stop at the radius or past the first distance.
        for (d, n) in self
            .tree
            .iter_nearest(&query, &squared_euclidean)
            .map_err(index_error)?
        {
            if d > limit {
                break;
            }
            match best {
                Some((bd, _)) if d > bd => break,
                Some((_, b)) if b.rank <= n.rank => {}
                _ => best = Some((d, *n)),
            }
        }
        Ok(best.map(|(_, n)| n))
    }

    fn len(&self) -> usize {
        self.tree.size()
    }
}
