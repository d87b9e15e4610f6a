use std::env;

use aqi_service::{FetchRequest, Lifecycle, LoggingConfig, ServiceConfig};

const DEFAULT_LAT: f64 = 36.7783;
const DEFAULT_LON: f64 = -119.4179;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = LoggingConfig::from_env();
    logging.install()?;
    Lifecycle::Started {
        binary: "fetch_airnow",
        logging: &logging,
    }
    .record();

    let cfg = ServiceConfig::from_env()?;
    let service = cfg
        .fetch_service()?
        .ok_or("AIRNOW_API_KEY must be set to fetch sensor data")?;

    let req = FetchRequest {
        latitude: env_f64("AIRNOW_LAT")?.unwrap_or(DEFAULT_LAT),
        longitude: env_f64("AIRNOW_LON")?.unwrap_or(DEFAULT_LON),
        radius_miles: env_f64("AIRNOW_RADIUS_MILES")?,
    };

    let report = service.run(&req)?;
    println!("region={}", report.region);
    println!("rows={}", report.hourly_rows);
    println!("tier={:?}", report.candidate.tier);
    println!("Saved hourly table to {}", report.hourly_path.display());
    println!("Saved features to {}", report.features_path.display());

    Ok(())
}

fn env_f64(key: &str) -> Result<Option<f64>, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|err| format!("invalid {key} value {raw:?}: {err}").into()),
        _ => Ok(None),
    }
}
