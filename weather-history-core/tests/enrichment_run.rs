//! End-to-end enrichment against a mock Dark Sky server and a CSV store.

use chrono::NaiveDate;
use tempfile::TempDir;
use weather_history_core::{
    CsvWeatherStore, Enricher, FollowMeeExtractor, LocationExtractor, RateController, RateLimits,
    RawArchive, WeatherStore, provider::darksky::DarkSkySource,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn export(date: &str, latitude: f64, longitude: f64) -> String {
    format!("Data.Date,Data.Latitude,Data.Longitude\n{date}T12:00:00-04:00,{latitude},{longitude}\n")
}

async fn mock_day(server: &MockServer, latitude: f64, longitude: f64, date: &str, high: f64) {
    Mock::given(method("GET"))
        .and(path(format!("/forecast/KEY/{latitude},{longitude},{date}T00:00:00")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "daily": { "data": [{ "temperatureHigh": high, "temperatureLow": high - 20.0 }] },
            "hourly": { "data": [{ "temperature": high - 10.0, "precipIntensity": 0.0 }] }
        })))
        .expect(1)
        .mount(server)
        .await;
}

fn enricher(server: &MockServer, store_path: &std::path::Path) -> Enricher<CsvWeatherStore> {
    let store = CsvWeatherStore::open(store_path).unwrap();
    let source = DarkSkySource::with_base_url("KEY".to_string(), &server.uri()).unwrap();
    Enricher::new(store, Box::new(source), RateController::new(RateLimits::unlimited()))
}

#[tokio::test]
async fn second_run_fetches_nothing_and_adds_no_rows() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let inputs = dir.path().join("inputs");
    std::fs::create_dir(&inputs).unwrap();
    std::fs::write(inputs.join("111_a.csv"), export("2018-09-12", 40.7, -73.9)).unwrap();
    std::fs::write(inputs.join("111_b.csv"), export("2018-09-13", 40.7, -73.9)).unwrap();
    std::fs::write(inputs.join("NA_c.csv"), export("2018-09-13", 40.7, -73.9)).unwrap();

    mock_day(&mock_server, 40.7, -73.9, "2018-09-12", 80.0).await;
    mock_day(&mock_server, 40.7, -73.9, "2018-09-13", 85.0).await;

    let store_path = dir.path().join("weather_history.csv");
    let scan = FollowMeeExtractor.scan_dir(&inputs).unwrap();
    assert_eq!(scan.files_found, 3);
    assert_eq!(scan.locations.len(), 2);

    let archive = RawArchive::new(dir.path().join("raw"));
    let report = enricher(&mock_server, &store_path)
        .with_archive(Some(archive.clone()))
        .run(&scan.locations)
        .await
        .unwrap();
    assert_eq!(report.enriched, 2);
    assert_eq!(report.failed, 0);
    assert!(archive.file_for(&scan.locations[0]).exists());

    let mut again = enricher(&mock_server, &store_path);
    let report = again.run(&scan.locations).await.unwrap();
    assert_eq!(report.already_enriched, 2);
    assert_eq!(report.attempted, 0);

    let store = again.store();
    assert_eq!(store.records().unwrap().count(), 2);

    let second_day = weather_history_core::LocationSummary::new(
        "111",
        40.7,
        -73.9,
        NaiveDate::from_ymd_opt(2018, 9, 13).unwrap(),
    );
    let summary = store.lookup(&second_day).unwrap().unwrap();
    assert_eq!(summary.max_temp, Some(85.0));
    assert_eq!(summary.min_temp, Some(65.0));
    assert_eq!(summary.mean_temp, Some(75.0));
    assert_eq!(summary.precipitation, Some(0.0));
    assert_eq!(summary.apparent_mean_temp, None);
}

#[tokio::test]
async fn provider_outage_leaves_keys_for_the_next_run() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("weather_history.csv");

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    let key = weather_history_core::LocationSummary::new(
        "222",
        51.5,
        -0.12,
        NaiveDate::from_ymd_opt(2018, 10, 1).unwrap(),
    );

    let report = enricher(&mock_server, &store_path).run(std::slice::from_ref(&key)).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);

    mock_day(&mock_server, 51.5, -0.12, "2018-10-01", 60.0).await;

    let mut retry = enricher(&mock_server, &store_path);
    let report = retry.run(std::slice::from_ref(&key)).await.unwrap();
    assert_eq!(report.enriched, 1);
    assert_eq!(retry.store().lookup(&key).unwrap().unwrap().max_temp, Some(60.0));
}
