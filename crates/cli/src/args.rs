//! Command-line arguments and their value parsers.

use clap::{Parser, Subcommand};
use sitetrack_core::request::{AnalysisRequest, Coordinate};
use sitetrack_tracker::config::UpdateMode;

#[derive(Debug, Parser)]
#[command(name = "sitetrack")]
#[command(version, about = "Submit site analyses and follow their progress", long_about = None)]
pub struct Cli {
    /// Update path: stream, poll, both, stream_with_poll_fallback
    #[arg(long, global = true, value_parser = parse_mode)]
    pub mode: Option<UpdateMode>,

    /// Print events as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit an analysis and follow it to the end
    Submit {
        /// Display name of the site
        #[arg(long)]
        site_name: String,

        /// Polygon as "lat,lon;lat,lon;..."
        #[arg(long, value_parser = parse_polygon, conflicts_with = "point", required_unless_present = "point")]
        polygon: Option<Polygon>,

        /// Centre point as "lat,lon"
        #[arg(long, value_parser = parse_coordinate, requires = "radius")]
        point: Option<Coordinate>,

        /// Radius around the centre point, in metres
        #[arg(long)]
        radius: Option<f64>,
    },

    /// Follow jobs that were submitted elsewhere
    Watch {
        /// Server job ids
        #[arg(required = true)]
        job_ids: Vec<String>,
    },

    /// Follow aggregate progress of a batch
    Batch {
        batch_id: String,
    },

    /// Print the result of a completed job
    Result {
        job_id: String,
    },
}

/// Polygon vertices as parsed from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon(pub Vec<Coordinate>);

impl Command {
    /// Build the submission request of a `submit` command.
    ///
    /// Returns `None` for every other command.
    pub fn to_request(&self) -> Option<AnalysisRequest> {
        match self {
            Self::Submit {
                site_name,
                polygon: Some(polygon),
                ..
            } => Some(AnalysisRequest::polygon(site_name.clone(), polygon.0.clone())),
            Self::Submit {
                site_name,
                point: Some(center),
                radius: Some(radius),
                ..
            } => Some(AnalysisRequest::point(site_name.clone(), *center, *radius)),
            _ => None,
        }
    }
}

pub fn parse_mode(raw: &str) -> Result<UpdateMode, String> {
    UpdateMode::parse(raw).ok_or_else(|| format!("unknown update mode '{raw}'"))
}

/// Parse `"lat,lon"`. Range checks are left to request validation.
pub fn parse_coordinate(raw: &str) -> Result<Coordinate, String> {
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected 'lat,lon', got '{raw}'"))?;
    let lat = lat
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("invalid latitude '{}'", lat.trim()))?;
    let lon = lon
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("invalid longitude '{}'", lon.trim()))?;
    Ok(Coordinate::new(lat, lon))
}

/// Parse `"lat,lon;lat,lon;..."`. A trailing `;` is allowed.
pub fn parse_polygon(raw: &str) -> Result<Polygon, String> {
    let points = raw
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(parse_coordinate)
        .collect::<Result<Vec<_>, _>>()?;
    if points.is_empty() {
        return Err("polygon has no points".to_string());
    }
    Ok(Polygon(points))
}
