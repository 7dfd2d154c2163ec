//! Core library for the `weather-history` tool.
//!
//! This crate defines:
//! - The location and weather models, and the CSV store that pairs them
//! - Pacing of provider calls under per-minute and per-day ceilings
//! - Historical weather providers and normalization of their responses
//! - The batch enricher that ties them together
//! - Extraction of locations from FollowMee tracker exports
//!
//! It is used by `weather-history-cli`, but can also be reused by other binaries or services.

pub mod archive;
pub mod config;
pub mod enrich;
pub mod extract;
pub mod model;
pub mod provider;
pub mod rate;
pub mod store;

pub use archive::RawArchive;
pub use config::{Config, ProviderConfig};
pub use enrich::{Enricher, RunReport};
pub use extract::{FollowMeeExtractor, LocationExtractor, Scan};
pub use model::{EnrichmentRecord, LocationSummary, WeatherSummary};
pub use provider::{ProviderId, WeatherSource};
pub use rate::{Clock, RateController, RateError, RateLimits, SystemClock};
pub use store::{CsvWeatherStore, WeatherStore};
