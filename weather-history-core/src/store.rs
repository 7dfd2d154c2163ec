use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Writer, WriterBuilder};
use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::model::{EnrichmentRecord, LocationSummary, WeatherSummary};

/// Persistence for enrichment records, keyed by location.
///
/// `append` does not deduplicate: callers keep the at-most-once guarantee by
/// calling `lookup` first.
pub trait WeatherStore {
    fn lookup(&self, key: &LocationSummary) -> Result<Option<WeatherSummary>>;

    /// Every key with a stored record, read in one pass.
    fn keys(&self) -> Result<Vec<LocationSummary>>;

    fn append(&mut self, summary: &WeatherSummary, key: &LocationSummary) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    SubjectId,
    Latitude,
    Longitude,
    Date,
    MeanTemp,
    MaxTemp,
    MinTemp,
    Precipitation,
    ApparentMeanTemp,
    ApparentMaxTemp,
    ApparentMinTemp,
}

impl Column {
    const ALL: [Column; 11] = [
        Column::SubjectId,
        Column::Latitude,
        Column::Longitude,
        Column::Date,
        Column::MeanTemp,
        Column::MaxTemp,
        Column::MinTemp,
        Column::Precipitation,
        Column::ApparentMeanTemp,
        Column::ApparentMaxTemp,
        Column::ApparentMinTemp,
    ];

    const KEY: [Column; 4] = [Column::SubjectId, Column::Latitude, Column::Longitude, Column::Date];

    fn name(self) -> &'static str {
        match self {
            Column::SubjectId => "subject_id",
            Column::Latitude => "latitude",
            Column::Longitude => "longitude",
            Column::Date => "date",
            Column::MeanTemp => "mean_temp",
            Column::MaxTemp => "max_temp",
            Column::MinTemp => "min_temp",
            Column::Precipitation => "precipitation",
            Column::ApparentMeanTemp => "apparent_mean_temp",
            Column::ApparentMaxTemp => "apparent_max_temp",
            Column::ApparentMinTemp => "apparent_min_temp",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|column| column.name() == name.trim())
    }

    fn cell(self, summary: &WeatherSummary, key: &LocationSummary) -> String {
        let number = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_default();

        match self {
            Column::SubjectId => key.subject_id.clone(),
            Column::Latitude => key.latitude.to_string(),
            Column::Longitude => key.longitude.to_string(),
            Column::Date => key.date.format(DATE_FORMAT).to_string(),
            Column::MeanTemp => number(summary.mean_temp),
            Column::MaxTemp => number(summary.max_temp),
            Column::MinTemp => number(summary.min_temp),
            Column::Precipitation => number(summary.precipitation),
            Column::ApparentMeanTemp => number(summary.apparent_mean_temp),
            Column::ApparentMaxTemp => number(summary.apparent_max_temp),
            Column::ApparentMinTemp => number(summary.apparent_min_temp),
        }
    }
}

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Append-only CSV file holding one row per enriched location.
///
/// The header of an existing file is authoritative: columns are located by
/// name, so files written with an older column set stay readable and
/// appendable.
#[derive(Debug, Clone)]
pub struct CsvWeatherStore {
    path: PathBuf,
    columns: Vec<Option<Column>>,
}

impl CsvWeatherStore {
    /// Open the store at `path`, creating it with the full header if absent.
    /// Existing rows are never rewritten.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                write_header(file, &path)?;
                info!(path = %path.display(), "created weather store");
                Ok(Self::with_full_schema(path))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Self::reopen(path),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to open store file: {}", path.display()))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Weather columns the file's header has no place for. Appends silently
    /// leave these values out.
    pub fn dropped_columns(&self) -> Vec<&'static str> {
        Column::ALL
            .into_iter()
            .filter(|column| !Column::KEY.contains(column))
            .filter(|column| self.position(*column).is_none())
            .map(Column::name)
            .collect()
    }

    /// Every readable record, in file order. Corrupt rows are skipped.
    pub fn records(&self) -> Result<impl Iterator<Item = EnrichmentRecord> + '_> {
        let reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("Failed to read store file: {}", self.path.display()))?;

        Ok(reader.into_records().enumerate().filter_map(move |(index, row)| {
            // +2: one for the header, one because rows are 1-based for humans.
            let line = index + 2;
            match row {
                Ok(row) => {
                    let record = self.parse_record(&row);
                    if record.is_none() {
                        warn!(path = %self.path.display(), line, "skipping store row with unreadable key");
                    }
                    record
                }
                Err(err) => {
                    warn!(path = %self.path.display(), line, error = %err, "skipping corrupt store row");
                    None
                }
            }
        }))
    }

    fn with_full_schema(path: PathBuf) -> Self {
        Self {
            path,
            columns: Column::ALL.into_iter().map(Some).collect(),
        }
    }

    fn reopen(path: PathBuf) -> Result<Self> {
        let is_empty = fs::metadata(&path)
            .with_context(|| format!("Failed to inspect store file: {}", path.display()))?
            .len()
            == 0;

        if is_empty {
            let file = OpenOptions::new()
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open store file: {}", path.display()))?;
            write_header(file, &path)?;
            return Ok(Self::with_full_schema(path));
        }

        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .with_context(|| format!("Failed to read store file: {}", path.display()))?;
        let header = reader
            .headers()
            .with_context(|| format!("Failed to read store header: {}", path.display()))?;

        let columns: Vec<Option<Column>> = header.iter().map(Column::from_name).collect();

        let missing: Vec<&str> = Column::KEY
            .into_iter()
            .filter(|key| !columns.contains(&Some(*key)))
            .map(Column::name)
            .collect();
        if !missing.is_empty() {
            bail!(
                "Store file {} is missing key columns: {}",
                path.display(),
                missing.join(", ")
            );
        }

        let store = Self { path, columns };
        let dropped = store.dropped_columns();
        if !dropped.is_empty() {
            warn!(
                path = %store.path.display(),
                ?dropped,
                "store header lacks weather columns, appended values for them are lost"
            );
        }

        Ok(store)
    }

    fn position(&self, column: Column) -> Option<usize> {
        self.columns.iter().position(|c| *c == Some(column))
    }

    fn parse_record(&self, row: &StringRecord) -> Option<EnrichmentRecord> {
        let field = |column: Column| self.position(column).and_then(|index| row.get(index));
        let number = |column: Column| {
            field(column)
                .and_then(|value| value.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite())
        };

        let location = LocationSummary {
            subject_id: field(Column::SubjectId)?.to_string(),
            latitude: number(Column::Latitude)?,
            longitude: number(Column::Longitude)?,
            date: NaiveDate::parse_from_str(field(Column::Date)?.trim(), DATE_FORMAT).ok()?,
        };

        let weather = WeatherSummary {
            mean_temp: number(Column::MeanTemp),
            max_temp: number(Column::MaxTemp),
            min_temp: number(Column::MinTemp),
            precipitation: number(Column::Precipitation),
            apparent_mean_temp: number(Column::ApparentMeanTemp),
            apparent_max_temp: number(Column::ApparentMaxTemp),
            apparent_min_temp: number(Column::ApparentMinTemp),
        };

        Some(EnrichmentRecord { location, weather })
    }
}

impl WeatherStore for CsvWeatherStore {
    fn lookup(&self, key: &LocationSummary) -> Result<Option<WeatherSummary>> {
        Ok(self
            .records()?
            .find(|record| record.location == *key)
            .map(|record| record.weather))
    }

    fn keys(&self) -> Result<Vec<LocationSummary>> {
        Ok(self.records()?.map(|record| record.location).collect())
    }

    fn append(&mut self, summary: &WeatherSummary, key: &LocationSummary) -> Result<()> {
        let row: Vec<String> = self
            .columns
            .iter()
            .map(|column| column.map(|c| c.cell(summary, key)).unwrap_or_default())
            .collect();

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open store file: {}", self.path.display()))?;
        terminate_last_row(&mut file, &self.path)?;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .write_record(&row)
            .with_context(|| format!("Failed to append to store file: {}", self.path.display()))?;

        sync(writer, &self.path)
    }
}

fn write_header(file: File, path: &Path) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(file);
    writer
        .write_record(Column::ALL.iter().map(|column| column.name()))
        .with_context(|| format!("Failed to write store header: {}", path.display()))?;

    sync(writer, path)
}

/// A row cut short by a crash has no line ending; end it so the next row
/// starts on a line of its own.
fn terminate_last_row(file: &mut File, path: &Path) -> Result<()> {
    let len = file
        .metadata()
        .with_context(|| format!("Failed to inspect store file: {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .and_then(|_| file.read_exact(&mut last))
        .with_context(|| format!("Failed to read store file: {}", path.display()))?;

    if last[0] != b'\n' {
        warn!(path = %path.display(), "store file ends mid-row, terminating it before appending");
        file.write_all(b"\n")
            .with_context(|| format!("Failed to append to store file: {}", path.display()))?;
    }

    Ok(())
}

/// Flush and fsync so the row survives a crash right after return.
fn sync(writer: Writer<File>, path: &Path) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|err| anyhow!("Failed to flush store file {}: {}", path.display(), err.error()))?;

    file.sync_all()
        .with_context(|| format!("Failed to sync store file: {}", path.display()))
}
