//! Location extraction from GPS-tracker exports.

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use std::{fs, path::Path};
use tracing::{debug, warn};

use crate::model::LocationSummary;

/// Turns one export file into the location it describes.
pub trait LocationExtractor {
    /// `None` when the file is not a usable export.
    fn extract(&self, path: &Path) -> Option<LocationSummary>;

    /// Extract every regular file in `dir`, in file-name order.
    fn scan_dir(&self, dir: &Path) -> Result<Scan> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to list input directory: {}", dir.display()))?
        {
            let entry = entry.with_context(|| format!("Failed to list input directory: {}", dir.display()))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                files.push(entry.path());
            }
        }
        files.sort();

        let locations = files.iter().filter_map(|path| self.extract(path)).collect();

        Ok(Scan {
            files_found: files.len(),
            locations,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scan {
    pub files_found: usize,
    pub locations: Vec<LocationSummary>,
}

/// FollowMee CSV exports, named `<subject>_<anything>.csv`.
///
/// The first data row supplies the position and the day; `Data.Date` is an
/// RFC 3339 timestamp of which only the calendar date is kept, as written
/// (no timezone conversion).
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowMeeExtractor;

const LATITUDE: &str = "Data.Latitude";
const LONGITUDE: &str = "Data.Longitude";
const DATE: &str = "Data.Date";

impl FollowMeeExtractor {
    /// Exports for unassigned (`NA_`) or cancelled subjects are ignored.
    pub fn is_valid_file(file_name: &str) -> bool {
        !matches!(file_name.split('_').next(), Some("NA") | Some("cancelled"))
    }

    pub fn subject_id(file_name: &str) -> Option<&str> {
        file_name.split('_').next().filter(|id| !id.is_empty())
    }

    fn first_point(path: &Path) -> Result<(f64, f64, NaiveDate)> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .context("cannot open file")?;

        let header = reader.headers().context("cannot read header")?.clone();
        let row = reader
            .records()
            .next()
            .ok_or_else(|| anyhow!("no data rows"))?
            .context("unreadable first row")?;

        let latitude = parse_coordinate(&header, &row, LATITUDE)?;
        let longitude = parse_coordinate(&header, &row, LONGITUDE)?;

        let raw_date = column(&header, &row, DATE)?;
        let date = raw_date
            .get(..10)
            .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
            .ok_or_else(|| anyhow!("invalid {DATE} value '{raw_date}'"))?;

        Ok((latitude, longitude, date))
    }
}

fn column<'r>(header: &StringRecord, row: &'r StringRecord, name: &str) -> Result<&'r str> {
    header
        .iter()
        .position(|h| h.trim() == name)
        .and_then(|index| row.get(index))
        .map(str::trim)
        .ok_or_else(|| anyhow!("missing {name} column"))
}

fn parse_coordinate(header: &StringRecord, row: &StringRecord, name: &str) -> Result<f64> {
    let raw = column(header, row, name)?;
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| anyhow!("invalid {name} value '{raw}'"))
}

impl LocationExtractor for FollowMeeExtractor {
    fn extract(&self, path: &Path) -> Option<LocationSummary> {
        let file_name = path.file_name()?.to_str()?;

        if !Self::is_valid_file(file_name) {
            debug!(file = %path.display(), "skipping unassigned or cancelled export");
            return None;
        }

        let subject_id = Self::subject_id(file_name)?;

        match Self::first_point(path) {
            Ok((latitude, longitude, date)) => {
                Some(LocationSummary::new(subject_id, latitude, longitude, date))
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "invalid data in export");
                None
            }
        }
    }
}
