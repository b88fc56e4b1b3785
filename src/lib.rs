//! # treeseg — individual tree detection from airborne lidar
//!
//! Two independent pipelines:
//! - **Raster**: [`detect_treetops`] finds apexes on a canopy height model,
//!   [`expand_crowns`] grows a crown label raster from them.
//! - **Point cloud**: [`segment_points`] clusters (x, y, z) points top-down
//!   into trees, with [`ApexAnchor`] or [`RecentMemberAnchor`] deciding what
//!   a candidate point is measured against.
//!
//! Ids are 1-based everywhere; [`UNASSIGNED`] (0) marks cells and points
//! that belong to no tree.
//!
//! References: Dalponte, M. & Coomes, D. A. 2016. *Tree-centric mapping of
//! forest carbon density from airborne laser scanning and hyperspectral
//! data*. Methods in Ecology and Evolution 7: 1236-1245. Li, W. et al. 2012
//! (see [`segmentation`]).

pub mod crowns;
pub mod error;
pub mod raster;
pub mod segmentation;
pub mod spatial_index;
pub mod treetops;

pub use crowns::{expand_crowns, CrownParams, SeedGating};
pub use error::{Result, TreesegError};
pub use raster::{LabelRaster, Raster, UNASSIGNED};
pub use segmentation::{
    segment_points, segment_points_with, AnchorPolicy, ApexAnchor, PointSegmentation,
    RecentMemberAnchor, Segment, SegmenterParams,
};
pub use spatial_index::{KdTreeIndex, Neighbor, SpatialIndex};
pub use treetops::{detect_treetops, window_half_widths, SeedPoint, TreetopParams};
