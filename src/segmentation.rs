//! Point-cloud tree segmentation by top-down greedy clustering
//! (Li et al. 2012 family).
//!
//! Points are visited from highest to lowest. Each point looks up its
//! nearest already-visited neighbour within `radius`; if there is one, the
//! point is compared with that neighbour's segment through an
//! [`AnchorPolicy`] and either joins it or opens a new segment.
//!
//! Reference: Li, W., Guo, Q., Jakubowski, M. K., & Kelly, M. (2012). A new
//! method for segmenting individual trees from the lidar point cloud.
//! *Photogrammetric Engineering & Remote Sensing*, 78(1), 75-84.

use std::collections::VecDeque;

use log::debug;

use crate::error::{require_positive, Result, TreesegError};
use crate::raster::UNASSIGNED;
use crate::spatial_index::{KdTreeIndex, Neighbor, SpatialIndex};

/// Parameters for [`segment_points`].
///
/// `dt1`, `dt2` and `radius` defaults match lidR's `li2012()`.
#[derive(Debug, Clone)]
pub struct SegmenterParams {
    /// Join distance for points continuous with a crown.
    pub dt1: f64,
    /// Looser join distance, only for points in the lower crown.
    pub dt2: f64,
    /// Neighbour search radius.
    pub radius: f64,
    /// A point is in the lower crown when `z < interior_ratio × apex z`.
    pub interior_ratio: f64,
    /// Points lower than this stay unassigned.
    pub min_height: Option<f64>,
}

impl Default for SegmenterParams {
    fn default() -> Self {
        Self {
            dt1: 1.5,
            dt2: 2.0,
            radius: 2.0,
            interior_ratio: 0.75,
            min_height: None,
        }
    }
}

impl SegmenterParams {
    pub fn validate(&self) -> Result<()> {
        require_positive("dt1", self.dt1)?;
        require_positive("dt2", self.dt2)?;
        require_positive("radius", self.radius)?;
        require_positive("interior_ratio", self.interior_ratio)?;
        if self.min_height.is_some_and(|h| !h.is_finite()) {
            return Err(TreesegError::invalid("min_height", "must be finite"));
        }
        Ok(())
    }
}

/// A growing tree segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// 1-based.
    pub id: u32,
    /// Highest member, i.e. the point that opened the segment.
    pub apex: [f64; 3],
    pub count: usize,
    recent: VecDeque<[f64; 3]>,
}

impl Segment {
    fn new(id: u32, apex: [f64; 3]) -> Self {
        Self {
            id,
            apex,
            count: 1,
            recent: VecDeque::new(),
        }
    }

    /// Most recently joined members, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &[f64; 3]> {
        self.recent.iter()
    }

    /// Remember `p` as a recent member, keeping at most `window` of them.
    pub fn remember(&mut self, p: [f64; 3], window: usize) {
        if window == 0 {
            return;
        }
        if self.recent.len() == window {
            self.recent.pop_front();
        }
        self.recent.push_back(p);
    }
}

/// How an open segment picks the point a candidate is measured against.
pub trait AnchorPolicy {
    /// Planar comparison point of `segment` for candidate `p`.
    fn anchor(&self, segment: &Segment, p: &[f64; 3]) -> [f64; 2];

    /// Called after `p` joined `segment`.
    fn record(&self, _segment: &mut Segment, _p: &[f64; 3]) {}
}

/// Always compare against the segment apex.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApexAnchor;

impl AnchorPolicy for ApexAnchor {
    fn anchor(&self, segment: &Segment, _p: &[f64; 3]) -> [f64; 2] {
        [segment.apex[0], segment.apex[1]]
    }
}

/// Compare against whichever of the apex and the last `window` joined
/// members is nearest to the candidate. Follows crowns that spread out
/// below a narrow top, at the cost of more merges on irregular crowns.
#[derive(Debug, Clone, Copy)]
pub struct RecentMemberAnchor {
    pub window: usize,
}

impl Default for RecentMemberAnchor {
    fn default() -> Self {
        Self { window: 8 }
    }
}

impl AnchorPolicy for RecentMemberAnchor {
    fn anchor(&self, segment: &Segment, p: &[f64; 3]) -> [f64; 2] {
        let mut best = &segment.apex;
        let mut best_d = planar_distance2(best, p);
        for m in segment.recent() {
            let d = planar_distance2(m, p);
            if d < best_d {
                best = m;
                best_d = d;
            }
        }
        [best[0], best[1]]
    }

    fn record(&self, segment: &mut Segment, p: &[f64; 3]) {
        segment.remember(*p, self.window);
    }
}

/// Output of [`segment_points`].
#[derive(Debug, Clone, PartialEq)]
pub struct PointSegmentation {
    /// One id per input point, in input order. [`UNASSIGNED`] only for
    /// points below `min_height`.
    pub ids: Vec<u32>,
    /// Segments indexed by `id - 1`.
    pub segments: Vec<Segment>,
}

#[inline]
fn planar_distance2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

/// Segment a point cloud using a k-d tree neighbour index.
pub fn segment_points<P: AnchorPolicy>(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    params: &SegmenterParams,
    policy: &P,
) -> Result<PointSegmentation> {
    segment_points_with(x, y, z, params, policy, &mut KdTreeIndex::new())
}

/// Segment a point cloud using the caller's (empty) neighbour index.
pub fn segment_points_with<P: AnchorPolicy, I: SpatialIndex>(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    params: &SegmenterParams,
    policy: &P,
    index: &mut I,
) -> Result<PointSegmentation> {
    params.validate()?;
    if x.len() != y.len() || x.len() != z.len() {
        return Err(TreesegError::LengthMismatch {
            x: x.len(),
            y: y.len(),
            z: z.len(),
        });
    }
    if let Some(index) = (0..x.len())
        .find(|&i| !(x[i].is_finite() && y[i].is_finite() && z[i].is_finite()))
    {
        return Err(TreesegError::NonFiniteCoordinate { index });
    }

    // Highest first; sort_by is stable so equal heights keep input order.
    let mut order: Vec<usize> = (0..x.len()).collect();
    order.sort_by(|&a, &b| z[b].total_cmp(&z[a]));

    let mut ids = vec![UNASSIGNED; x.len()];
    let mut segments: Vec<Segment> = Vec::new();

    for (rank, &i) in order.iter().enumerate() {
        let p = [x[i], y[i], z[i]];
        if params.min_height.is_some_and(|h| p[2] < h) {
            continue;
        }

        let joined = match index.nearest_within(p[0], p[1], params.radius)? {
            Some(Neighbor { segment, .. }) => {
                let seg = &segments[segment as usize - 1];
                let a = policy.anchor(seg, &p);
                let d = planar_distance2(&[a[0], a[1], 0.0], &p).sqrt();
                let lower_crown = p[2] < params.interior_ratio * seg.apex[2];
                (d <= params.dt1 || (d <= params.dt2 && lower_crown)).then_some(segment)
            }
            None => None,
        };

        let id = match joined {
            Some(id) => {
                let seg = &mut segments[id as usize - 1];
                seg.count += 1;
                policy.record(seg, &p);
                id
            }
            None => {
                let id = segments.len() as u32 + 1;
                segments.push(Segment::new(id, p));
                id
            }
        };
        ids[i] = id;
        index.insert(p[0], p[1], Neighbor { rank, segment: id })?;
    }

    debug!(
        "segment_points: {} points -> {} segments ({} indexed)",
        x.len(),
        segments.len(),
        index.len()
    );
    Ok(PointSegmentation { ids, segments })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
