//! Shared utilities for integration tests.

use std::time::Duration;

use forwarder_metrics::config::ObservabilityConfig;
use forwarder_metrics::Telemetry;

/// Telemetry with an in-process recorder and no scrape endpoint.
pub fn telemetry() -> Telemetry {
    Telemetry::install(&ObservabilityConfig {
        metrics_enabled: false,
        ..ObservabilityConfig::default()
    })
    .expect("telemetry installs")
}

/// Value of the series `name` whose label set equals `labels` exactly.
pub fn sample(rendered: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    let mut wanted: Vec<String> = labels.iter().map(|(key, value)| format!("{key}=\"{value}\"")).collect();
    wanted.sort();

    rendered.lines().find_map(|line| {
        let (series, value) = line.rsplit_once(' ')?;
        let (series_name, series_labels) = series.split_once('{').unwrap_or((series, "}"));
        let mut found: Vec<&str> = series_labels.strip_suffix('}')?.split(',').filter(|l| !l.is_empty()).collect();
        found.sort();
        (series_name == name && found == wanted).then(|| value.parse().ok()).flatten()
    })
}

/// Poll until the series reaches `expected`, panicking after about two seconds.
#[allow(dead_code)]
pub async fn eventually(telemetry: &Telemetry, name: &str, labels: &[(&str, &str)], expected: f64) {
    let mut last = None;
    for _ in 0..200 {
        last = sample(&telemetry.render(), name, labels);
        if last == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{name}{labels:?} expected {expected}, last value {last:?}");
}
