//! Waypoint generation between two coordinates.
//!
//! A [`GeoPath`] is a straight-line interpolation from a start point to a
//! destination with small random perturbation on the interior points so the
//! simulated trip does not look ruler-drawn. It is illustrative only, not a
//! routing engine.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal digits kept on interior waypoints.
pub const COORDINATE_DECIMALS: i32 = 6;

/// Default bound (degrees, per axis) of the interior jitter.
pub const DEFAULT_JITTER_DEGREES: f64 = 0.0002;

/// Largest accepted jitter or cold-start offset, in degrees per axis.
pub const MAX_SPREAD_DEGREES: f64 = 1.0;

#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    #[error("{field} {value} is outside the valid range")]
    InvalidCoordinate { field: &'static str, value: f64 },

    #[error("a path needs at least 2 points, got {0}")]
    TooFewPoints(usize),

    #[error("cannot parse coordinate pair '{0}', expected LAT,LNG")]
    Parse(String),

    #[error("{field} must be a finite value between 0 and 1 degree, got {value}")]
    InvalidSpread { field: &'static str, value: f64 },
}

/// Check a per-axis random spread (jitter or origin offset) before it
/// reaches the RNG.
pub fn check_spread(field: &'static str, value: f64) -> Result<f64, GeoError> {
    if value.is_finite() && (0.0..=MAX_SPREAD_DEGREES).contains(&value) {
        Ok(value)
    } else {
        Err(GeoError::InvalidSpread { field, value })
    }
}

/// A WGS84-ish coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns the point unchanged if both axes are finite and in range.
    pub fn validate(self) -> Result<Self, GeoError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(GeoError::InvalidCoordinate {
                field: "latitude",
                value: self.latitude,
            });
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(GeoError::InvalidCoordinate {
                field: "longitude",
                value: self.longitude,
            });
        }
        Ok(self)
    }

    /// Planar distance in degree space. Good enough for pacing heuristics.
    pub fn distance_degrees(self, other: GeoPoint) -> f64 {
        (self.latitude - other.latitude).hypot(self.longitude - other.longitude)
    }

    /// Point shifted by the given deltas, clamped into the valid range.
    pub fn offset(self, delta_lat: f64, delta_lon: f64) -> Self {
        Self {
            latitude: (self.latitude + delta_lat).clamp(-90.0, 90.0),
            longitude: (self.longitude + delta_lon).clamp(-180.0, 180.0),
        }
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

impl FromStr for GeoPoint {
    type Err = GeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_err = || GeoError::Parse(s.to_string());
        let (lat, lon) = s.split_once(',').ok_or_else(parse_err)?;
        let latitude = lat.trim().parse::<f64>().map_err(|_| parse_err())?;
        let longitude = lon.trim().parse::<f64>().map_err(|_| parse_err())?;
        GeoPoint::new(latitude, longitude).validate()
    }
}

/// Ordered, immutable sequence of at least two waypoints.
///
/// The first point is exactly the requested start and the last point is
/// exactly the requested destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct GeoPath {
    points: Vec<GeoPoint>,
}

impl GeoPath {
    pub fn points(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<GeoPoint> {
        self.points.get(index).copied()
    }

    pub fn start(&self) -> GeoPoint {
        self.points[0]
    }

    pub fn destination(&self) -> GeoPoint {
        self.points[self.points.len() - 1]
    }

    pub fn iter(&self) -> impl Iterator<Item = GeoPoint> + '_ {
        self.points.iter().copied()
    }
}

/// Generate a path using the thread-local RNG.
pub fn generate(
    start: GeoPoint,
    destination: GeoPoint,
    point_count: usize,
    jitter_degrees: f64,
) -> Result<GeoPath, GeoError> {
    generate_with_rng(
        start,
        destination,
        point_count,
        jitter_degrees,
        &mut rand::rng(),
    )
}

/// Linear interpolation from `start` to `destination` with uniform jitter of
/// at most `jitter_degrees` per axis on interior points.
///
/// Interior points are rounded to [`COORDINATE_DECIMALS`] after the jitter is
/// applied, so an interior point may sit up to half a unit of the last kept
/// decimal (5e-7 degrees) beyond the jitter bound.
pub fn generate_with_rng<R: Rng + ?Sized>(
    start: GeoPoint,
    destination: GeoPoint,
    point_count: usize,
    jitter_degrees: f64,
    rng: &mut R,
) -> Result<GeoPath, GeoError> {
    let start = start.validate()?;
    let destination = destination.validate()?;
    if point_count < 2 {
        return Err(GeoError::TooFewPoints(point_count));
    }

    let jitter = check_spread("jitter_degrees", jitter_degrees)?;
    let last = point_count - 1;
    let mut points = Vec::with_capacity(point_count);
    points.push(start);

    for i in 1..last {
        let t = i as f64 / last as f64;
        let mut latitude = start.latitude + (destination.latitude - start.latitude) * t;
        let mut longitude = start.longitude + (destination.longitude - start.longitude) * t;
        if jitter > 0.0 {
            latitude += rng.random_range(-jitter..=jitter);
            longitude += rng.random_range(-jitter..=jitter);
        }
        points.push(GeoPoint::new(
            round_coordinate(latitude.clamp(-90.0, 90.0)),
            round_coordinate(longitude.clamp(-180.0, 180.0)),
        ));
    }

    // Overwritten rather than interpolated so rounding can never move it.
    points.push(destination);
    Ok(GeoPath { points })
}

/// Synthesize a plausible origin within `max_offset` degrees (per axis) of
/// `destination`, for deliveries with no known courier location.
pub fn random_origin_near<R: Rng + ?Sized>(
    destination: GeoPoint,
    max_offset: f64,
    rng: &mut R,
) -> Result<GeoPoint, GeoError> {
    let bound = check_spread("cold_start_offset_degrees", max_offset)?;
    if bound == 0.0 {
        return Ok(destination);
    }
    Ok(destination.offset(
        rng.random_range(-bound..=bound),
        rng.random_range(-bound..=bound),
    ))
}

pub fn round_coordinate(value: f64) -> f64 {
    let scale = 10f64.powi(COORDINATE_DECIMALS);
    (value * scale).round() / scale
}
