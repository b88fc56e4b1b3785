//! Tree detection driver.
//!
//! Usage:
//!   treeseg treetops CHM.tif --ws 3 -o treetops.csv
//!   treeseg crowns CHM.tif --th-crown 0.55 --max-cr 10 -o crowns.tif
//!   treeseg points cloud.csv --dt1 1.5 --dt2 2 -R 2 --variant b -o segmented.csv

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use treeseg::{
    detect_treetops, expand_crowns, segment_points, ApexAnchor, CrownParams, LabelRaster,
    PointSegmentation, Raster, RecentMemberAnchor, SeedGating, SeedPoint, SegmenterParams,
    TreetopParams,
};

/// GDAL_NODATA, stored as an ASCII string.
const GDAL_NODATA_TAG: u16 = 42113;

// ==========================================================================
// GeoTIFF tags (ModelPixelScale + ModelTiepoint + GDAL_NODATA)
// ==========================================================================

struct GeoTags {
    res_x: f64,
    res_y: f64,
    origin_x: f64,
    origin_y: f64,
    nodata: Option<f64>,
}

fn geotiff_tags<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> GeoTags {
    let mut tags = GeoTags {
        res_x: 1.0,
        res_y: 1.0,
        origin_x: 0.0,
        origin_y: 0.0,
        nodata: None,
    };

    match decoder
        .find_tag(Tag::ModelPixelScaleTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())
    {
        Some(scale) if scale.len() >= 2 => {
            tags.res_x = scale[0];
            tags.res_y = scale[1];
        }
        _ => warn!("ModelPixelScale tag (33550) missing, assuming 1.0 resolution"),
    }
    match decoder
        .find_tag(Tag::ModelTiepointTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())
    {
        Some(tie) if tie.len() >= 6 => {
            tags.origin_x = tie[3];
            tags.origin_y = tie[4];
        }
        _ => warn!("ModelTiepoint tag (33922) missing, assuming origin (0, 0)"),
    }
    tags.nodata = decoder
        .find_tag(Tag::Unknown(GDAL_NODATA_TAG))
        .ok()
        .flatten()
        .and_then(|v| v.into_string().ok())
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

    info!(
        "GeoTIFF tags: res=({}, {}), origin=({:.2}, {:.2}), nodata={:?}",
        tags.res_x, tags.res_y, tags.origin_x, tags.origin_y, tags.nodata
    );
    tags
}

// ==========================================================================
// Loading
// ==========================================================================

fn load_chm(path: &str, band: usize) -> Result<Raster> {
    let file = File::open(path).with_context(|| format!("cannot open '{}'", path))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .with_context(|| format!("'{}' is not a readable TIFF", path))?;

    let (width, height) = decoder.dimensions()?;
    let ncol = width as usize;
    let nrow = height as usize;
    let tags = geotiff_tags(&mut decoder);

    let raw: Vec<f64> = match decoder.read_image()? {
        DecodingResult::F64(v) => v,
        DecodingResult::F32(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::U32(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::U16(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::U8(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::I32(v) => v.iter().map(|x| *x as f64).collect(),
        DecodingResult::I16(v) => v.iter().map(|x| *x as f64).collect(),
        _ => bail!("unsupported pixel format in '{}'", path),
    };

    // Multi-band images are pixel-interleaved.
    let total = nrow * ncol;
    let n_bands = if total == 0 { 1 } else { raw.len() / total };
    if band >= n_bands {
        bail!("band {} requested but '{}' has {} band(s)", band, path, n_bands);
    }
    let data: Vec<f64> = if n_bands > 1 {
        (0..total).map(|px| raw[px * n_bands + band]).collect()
    } else {
        raw
    };

    let mut chm = Raster::from_vec(nrow, ncol, data)?;
    chm.xmin = tags.origin_x;
    chm.ymax = tags.origin_y;
    chm = chm.with_resolution(tags.res_x, tags.res_y);
    if let Some(nd) = tags.nodata {
        chm = chm.with_nodata(nd);
    }
    info!(
        "loaded '{}': {} x {} cells, band {}/{}",
        path, ncol, nrow, band, n_bands
    );
    Ok(chm)
}

#[derive(Debug, Deserialize)]
struct PointRow {
    x: f64,
    y: f64,
    z: f64,
}

fn load_points(path: &str) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("cannot open '{}'", path))?;
    let (mut x, mut y, mut z) = (Vec::new(), Vec::new(), Vec::new());
    for (line, row) in rdr.deserialize::<PointRow>().enumerate() {
        let p = row.with_context(|| format!("'{}': bad record {}", path, line + 1))?;
        x.push(p.x);
        y.push(p.y);
        z.push(p.z);
    }
    info!("loaded {} points from '{}'", x.len(), path);
    Ok((x, y, z))
}

// ==========================================================================
// Export
// ==========================================================================

#[derive(Debug, Serialize)]
struct TreetopRow {
    id: u32,
    row: usize,
    col: usize,
    x: f64,
    y: f64,
    h: f64,
}

fn export_treetops(seeds: &[SeedPoint], chm: &Raster, path: &str) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create '{}'", path))?;
    let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
    for s in seeds {
        let (x, y) = chm.rc_to_xy(s.row, s.col);
        wtr.serialize(TreetopRow {
            id: s.id,
            row: s.row,
            col: s.col,
            x,
            y,
            h: s.height,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

fn export_labels(labels: &LabelRaster, path: &str) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create '{}'", path))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
    let mut image =
        encoder.new_image::<colortype::Gray32>(labels.ncol as u32, labels.nrow as u32)?;

    // Same grid as the input CHM: tie raster (0, 0) to its upper-left corner.
    let scale = [labels.res_x, labels.res_y, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, labels.xmin, labels.ymax, 0.0];
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    image.write_data(&labels.data)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct SegmentedRow {
    x: f64,
    y: f64,
    z: f64,
    tree_id: u32,
}

fn export_points(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    seg: &PointSegmentation,
    path: &str,
) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create '{}'", path))?;
    let mut wtr = csv::Writer::from_writer(BufWriter::new(file));
    for i in 0..x.len() {
        wtr.serialize(SegmentedRow {
            x: x[i],
            y: y[i],
            z: z[i],
            tree_id: seg.ids[i],
        })?;
    }
    wtr.flush()?;
    Ok(())
}

// ==========================================================================
// CLI (clap)
// ==========================================================================

#[derive(Parser, Debug)]
#[command(
    name = "treeseg",
    about = "Individual tree detection from canopy height models and lidar point clouds"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct RasterArgs {
    /// Canopy height model GeoTIFF
    #[arg(value_name = "CHM.tif")]
    chm: String,

    /// Band to read from multi-band images
    #[arg(long, default_value_t = 0)]
    band: usize,

    /// Tree top search window width (map units)
    #[arg(long, default_value_t = 3.0)]
    ws: f64,

    /// Minimum tree top height
    #[arg(long)]
    hmin: Option<f64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Gating {
    Global,
    Local,
    None,
}

impl From<Gating> for SeedGating {
    fn from(g: Gating) -> Self {
        match g {
            Gating::Global => SeedGating::GlobalMaximum,
            Gating::Local => SeedGating::LocalNeighborhood,
            Gating::None => SeedGating::Disabled,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Variant {
    /// Compare against the segment apex
    A,
    /// Compare against the nearest recently joined member
    B,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect tree tops on a canopy height model
    Treetops {
        #[command(flatten)]
        raster: RasterArgs,

        /// Output CSV
        #[arg(long, short, default_value = "treetops.csv")]
        output: String,
    },
    /// Detect tree tops and grow crowns from them
    Crowns {
        #[command(flatten)]
        raster: RasterArgs,

        /// Seed threshold (fraction of the gating reference height)
        #[arg(long, default_value_t = 0.45)]
        th_seed: f64,

        /// Crown threshold (fraction of the seed height)
        #[arg(long, default_value_t = 0.55)]
        th_crown: f64,

        /// Maximum crown radius (map units)
        #[arg(long, default_value_t = 10.0)]
        max_cr: f64,

        /// Reference height for seed gating
        #[arg(long, value_enum, default_value_t = Gating::Local)]
        gating: Gating,

        /// Also write the tree tops to this CSV
        #[arg(long, value_name = "treetops.csv")]
        treetops: Option<String>,

        /// Output label raster (32-bit TIFF)
        #[arg(long, short, default_value = "crowns.tif")]
        output: String,
    },
    /// Segment a point cloud (CSV with x, y, z columns)
    Points {
        #[arg(value_name = "points.csv")]
        input: String,

        #[arg(long, default_value_t = 1.5)]
        dt1: f64,

        #[arg(long, default_value_t = 2.0)]
        dt2: f64,

        /// Neighbour search radius
        #[arg(short = 'R', long, default_value_t = 2.0)]
        radius: f64,

        /// Lower-crown cutoff as a fraction of the segment apex height
        #[arg(long, default_value_t = 0.75)]
        interior: f64,

        /// Points below this height are left unassigned
        #[arg(long)]
        hmin: Option<f64>,

        #[arg(long, value_enum, default_value_t = Variant::A)]
        variant: Variant,

        /// Recent-member window for variant B
        #[arg(long, default_value_t = 8)]
        window: usize,

        /// Output CSV
        #[arg(long, short, default_value = "segmented.csv")]
        output: String,
    },
}

// ==========================================================================
// Main
// ==========================================================================

fn treetops_from(raster: &RasterArgs) -> Result<(Raster, Vec<SeedPoint>)> {
    let chm = load_chm(&raster.chm, raster.band)?;
    let params = TreetopParams {
        window_size: raster.ws,
        min_height: raster.hmin,
    };
    let seeds = detect_treetops(&chm, &params)?;
    info!("{} tree tops detected", seeds.len());
    Ok((chm, seeds))
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Treetops { raster, output } => {
            let (chm, seeds) = treetops_from(&raster)?;
            export_treetops(&seeds, &chm, &output)?;
            println!("{} tree tops -> '{}'", seeds.len(), output);
        }
        Command::Crowns {
            raster,
            th_seed,
            th_crown,
            max_cr,
            gating,
            treetops,
            output,
        } => {
            let (chm, seeds) = treetops_from(&raster)?;
            let params = CrownParams {
                seed_threshold: th_seed,
                crown_threshold: th_crown,
                max_distance: max_cr,
                seed_gating: gating.into(),
            };
            let t0 = Instant::now();
            let labels = expand_crowns(&chm, &seeds, &params)?;
            info!("crowns grown in {:.2}s", t0.elapsed().as_secs_f64());
            if let Some(path) = treetops {
                export_treetops(&seeds, &chm, &path)?;
            }
            export_labels(&labels, &output)?;
            println!(
                "{} tree tops, {} crown cells -> '{}'",
                seeds.len(),
                labels.assigned_count(),
                output
            );
        }
        Command::Points {
            input,
            dt1,
            dt2,
            radius,
            interior,
            hmin,
            variant,
            window,
            output,
        } => {
            let (x, y, z) = load_points(&input)?;
            let params = SegmenterParams {
                dt1,
                dt2,
                radius,
                interior_ratio: interior,
                min_height: hmin,
            };
            let t0 = Instant::now();
            let seg = match variant {
                Variant::A => segment_points(&x, &y, &z, &params, &ApexAnchor)?,
                Variant::B => {
                    segment_points(&x, &y, &z, &params, &RecentMemberAnchor { window })?
                }
            };
            info!("segmented in {:.2}s", t0.elapsed().as_secs_f64());
            export_points(&x, &y, &z, &seg, &output)?;
            println!(
                "{} points, {} trees -> '{}'",
                x.len(),
                seg.segments.len(),
                output
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_export_keeps_georeferencing() {
        let chm = Raster::new(3, 4, 1.0).with_extent(500.0, 502.0, 1000.0, 1003.0);
        let mut labels = LabelRaster::like(&chm);
        labels.set(1, 2, 7);

        let path = std::env::temp_dir().join(format!("treeseg-labels-{}.tif", std::process::id()));
        let path = path.to_str().unwrap().to_string();
        export_labels(&labels, &path).unwrap();

        let mut decoder = Decoder::new(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (4, 3));
        let tags = geotiff_tags(&mut decoder);
        assert_eq!((tags.res_x, tags.res_y), (0.5, 1.0));
        assert_eq!((tags.origin_x, tags.origin_y), (500.0, 1003.0));
        match decoder.read_image().unwrap() {
            DecodingResult::U32(v) => assert_eq!(v, labels.data),
            _ => panic!("labels should decode as 32-bit integers"),
        }
        std::fs::remove_file(&path).unwrap();
    }
}
