use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A subject's position on a given day. This is the key of the weather store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSummary {
    pub subject_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub date: NaiveDate,
}

impl LocationSummary {
    pub fn new(subject_id: impl Into<String>, latitude: f64, longitude: f64, date: NaiveDate) -> Self {
        Self {
            subject_id: subject_id.into(),
            latitude,
            longitude,
            date,
        }
    }
}

impl std::fmt::Display for LocationSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{},{} on {}", self.subject_id, self.latitude, self.longitude, self.date)
    }
}

/// Daily weather for one location. Providers may omit any subset of fields,
/// so each one is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherSummary {
    pub mean_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub min_temp: Option<f64>,
    pub precipitation: Option<f64>,
    pub apparent_mean_temp: Option<f64>,
    pub apparent_max_temp: Option<f64>,
    pub apparent_min_temp: Option<f64>,
}

impl WeatherSummary {
    /// Field names paired with their values, in store column order.
    pub fn fields(&self) -> [(&'static str, Option<f64>); 7] {
        [
            ("mean_temp", self.mean_temp),
            ("max_temp", self.max_temp),
            ("min_temp", self.min_temp),
            ("precipitation", self.precipitation),
            ("apparent_mean_temp", self.apparent_mean_temp),
            ("apparent_max_temp", self.apparent_max_temp),
            ("apparent_min_temp", self.apparent_min_temp),
        ]
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.fields()
            .into_iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| name)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, value)| value.is_none())
    }
}

/// One persisted row: a location and the weather attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub location: LocationSummary,
    pub weather: WeatherSummary,
}
