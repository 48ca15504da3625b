//! Analysis submission request and its client-side validation.
//!
//! Validation runs before any job handle is created or any request is
//! sent, so a rejected request never reaches the network layer.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a site name, in characters.
pub const MAX_SITE_NAME_LEN: usize = 200;

/// Minimum number of distinct polygon vertices.
pub const MIN_POLYGON_POINTS: usize = 3;

/// Maximum number of polygon vertices accepted in one request.
pub const MAX_POLYGON_POINTS: usize = 1000;

/// Largest analysis radius around a point, in metres.
pub const MAX_RADIUS_M: f64 = 50_000.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Area to analyse: either a polygon or a point with a radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnalysisArea {
    Polygon { polygon: Vec<Coordinate> },
    Point { center: Coordinate, radius_m: f64 },
}

/// Body of `POST /analyze`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub site_name: String,
    #[serde(flatten)]
    pub area: AnalysisArea,
}

impl AnalysisRequest {
    pub fn polygon(site_name: impl Into<String>, points: Vec<Coordinate>) -> Self {
        Self {
            site_name: site_name.into(),
            area: AnalysisArea::Polygon { polygon: points },
        }
    }

    pub fn point(site_name: impl Into<String>, center: Coordinate, radius_m: f64) -> Self {
        Self {
            site_name: site_name.into(),
            area: AnalysisArea::Point { center, radius_m },
        }
    }

    /// Check every field, returning the first violation found.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_site_name(&self.site_name)?;
        match &self.area {
            AnalysisArea::Polygon { polygon } => validate_polygon(polygon),
            AnalysisArea::Point { center, radius_m } => {
                validate_coordinate(center, "center")?;
                validate_radius(*radius_m)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Site names must be non-blank and at most [`MAX_SITE_NAME_LEN`] characters.
pub fn validate_site_name(name: &str) -> Result<(), CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(
            "Site name must not be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_SITE_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Site name must not exceed {MAX_SITE_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Latitude must be in `-90..=90`, longitude in `-180..=180`, both finite.
pub fn validate_coordinate(coord: &Coordinate, label: &str) -> Result<(), CoreError> {
    if !coord.lat.is_finite() || !(-90.0..=90.0).contains(&coord.lat) {
        return Err(CoreError::Validation(format!(
            "{label}: latitude {} is outside -90..=90",
            coord.lat
        )));
    }
    if !coord.lon.is_finite() || !(-180.0..=180.0).contains(&coord.lon) {
        return Err(CoreError::Validation(format!(
            "{label}: longitude {} is outside -180..=180",
            coord.lon
        )));
    }
    Ok(())
}

/// A polygon needs at least three distinct vertices.
///
/// A closing vertex equal to the first one is accepted and not counted.
pub fn validate_polygon(points: &[Coordinate]) -> Result<(), CoreError> {
    if points.len() > MAX_POLYGON_POINTS {
        return Err(CoreError::Validation(format!(
            "Polygon must not exceed {MAX_POLYGON_POINTS} points"
        )));
    }
    for (i, point) in points.iter().enumerate() {
        validate_coordinate(point, &format!("Polygon point {i}"))?;
    }

    let open_ring = match (points.first(), points.last()) {
        (Some(first), Some(last)) if points.len() > 1 && first == last => {
            &points[..points.len() - 1]
        }
        _ => points,
    };
    let mut distinct: Vec<&Coordinate> = Vec::with_capacity(open_ring.len());
    for point in open_ring {
        if !distinct.contains(&point) {
            distinct.push(point);
        }
    }
    if distinct.len() < MIN_POLYGON_POINTS {
        return Err(CoreError::Validation(format!(
            "Polygon needs at least {MIN_POLYGON_POINTS} distinct points, got {}",
            distinct.len()
        )));
    }
    Ok(())
}

/// Radius must be finite, positive and at most [`MAX_RADIUS_M`].
pub fn validate_radius(radius_m: f64) -> Result<(), CoreError> {
    if !radius_m.is_finite() || radius_m <= 0.0 {
        return Err(CoreError::Validation(
            "Radius must be a positive number of metres".to_string(),
        ));
    }
    if radius_m > MAX_RADIUS_M {
        return Err(CoreError::Validation(format!(
            "Radius must not exceed {MAX_RADIUS_M} metres"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
