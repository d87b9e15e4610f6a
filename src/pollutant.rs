//! Fixed pollutant enumeration shared by the fetcher, merger and feature stages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const POLLUTANT_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pollutant {
    No2,
    Ozone,
    Co,
    So2,
    Pm25,
    Pm10,
}

// Enumeration order; drives column order in every table.
pub const ALL_POLLUTANTS: [Pollutant; POLLUTANT_COUNT] = [
    Pollutant::No2,
    Pollutant::Ozone,
    Pollutant::Co,
    Pollutant::So2,
    Pollutant::Pm25,
    Pollutant::Pm10,
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported pollutant label: {0}")]
pub struct UnknownPollutant(pub String);

impl Pollutant {
    pub fn code(self) -> &'static str {
        match self {
            Self::No2 => "NO2",
            Self::Ozone => "OZONE",
            Self::Co => "CO",
            Self::So2 => "SO2",
            Self::Pm25 => "PM25",
            Self::Pm10 => "PM10",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::No2 => 0,
            Self::Ozone => 1,
            Self::Co => 2,
            Self::So2 => 3,
            Self::Pm25 => 4,
            Self::Pm10 => 5,
        }
    }

    pub fn value_column(self) -> String {
        format!("value_{}", self.code().to_ascii_lowercase())
    }

    pub fn index_column(self) -> String {
        format!("aqi_{}", self.code().to_ascii_lowercase())
    }
}

pub fn parse_pollutant(input: &str) -> Result<Pollutant, UnknownPollutant> {
    match input.trim().to_ascii_uppercase().as_str() {
        "NO2" => Ok(Pollutant::No2),
        "OZONE" | "O3" => Ok(Pollutant::Ozone),
        "CO" => Ok(Pollutant::Co),
        "SO2" => Ok(Pollutant::So2),
        "PM25" | "PM2.5" => Ok(Pollutant::Pm25),
        "PM10" => Ok(Pollutant::Pm10),
        _ => Err(UnknownPollutant(input.to_string())),
    }
}
