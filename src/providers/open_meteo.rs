use chrono::NaiveDate;
use serde::Deserialize;

use crate::budget::CostModel;
use crate::domain::{CanonicalObservation, Period, Provenance, ProviderKind, Target};
use crate::fetch::{FetchError, HttpRequest};
use crate::normalize::NormalizeError;
use crate::providers::{Provider, parse_date};

pub const ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

pub const DAILY_VARIABLES: &[&str] = &[
    "snowfall_sum",
    "precipitation_sum",
    "rain_sum",
    "temperature_2m_max",
    "temperature_2m_min",
    "temperature_2m_mean",
    "apparent_temperature_max",
    "apparent_temperature_min",
    "wind_speed_10m_max",
    "wind_gusts_10m_max",
    "wind_direction_10m_dominant",
    "shortwave_radiation_sum",
    "sunshine_duration",
    "precipitation_hours",
    "weather_code",
    "et0_fao_evapotranspiration",
];

/// Variable count the weighted cost is computed from for one archive request.
pub const PRICED_VARIABLES: u32 = 17;

const CM_TO_MM: f64 = 10.0;
const KMH_TO_MS: f64 = 1.0 / 3.6;

/// Open-Meteo historical archive (ERA5 reanalysis, gridded).
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    base_url: String,
}

impl OpenMeteoProvider {
    pub fn new() -> Self {
        Self::with_base_url(ARCHIVE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for OpenMeteoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    #[serde(default)]
    daily: Option<ArchiveDaily>,
}

#[derive(Debug, Deserialize)]
struct ArchiveDaily {
    #[serde(default)]
    time: Option<Vec<String>>,
    #[serde(default)]
    snowfall_sum: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_sum: Vec<Option<f64>>,
    #[serde(default)]
    rain_sum: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_mean: Vec<Option<f64>>,
    #[serde(default)]
    apparent_temperature_max: Vec<Option<f64>>,
    #[serde(default)]
    apparent_temperature_min: Vec<Option<f64>>,
    #[serde(default)]
    wind_speed_10m_max: Vec<Option<f64>>,
    #[serde(default)]
    wind_gusts_10m_max: Vec<Option<f64>>,
    #[serde(default)]
    wind_direction_10m_dominant: Vec<Option<f64>>,
    #[serde(default)]
    shortwave_radiation_sum: Vec<Option<f64>>,
    #[serde(default)]
    sunshine_duration: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_hours: Vec<Option<f64>>,
    #[serde(default)]
    weather_code: Vec<Option<f64>>,
    #[serde(default)]
    et0_fao_evapotranspiration: Vec<Option<f64>>,
}

fn at(values: &[Option<f64>], idx: usize) -> Option<f64> {
    values.get(idx).copied().flatten().filter(|v| v.is_finite())
}

impl Provider for OpenMeteoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenMeteo
    }

    fn provenance(&self) -> Provenance {
        Provenance::OpenMeteo
    }

    fn cost_model(&self) -> CostModel {
        CostModel::Weighted {
            variables: PRICED_VARIABLES,
            days: 365,
        }
    }

    fn request(
        &self,
        target: &Target,
        period: Period,
        today: NaiveDate,
    ) -> Result<HttpRequest, FetchError> {
        let start = period.first_day();
        let end = period.last_day(today);
        if end < start {
            return Err(FetchError::InvalidRequest(format!(
                "period {period} has not started yet"
            )));
        }
        Ok(HttpRequest::get(&self.base_url)
            .query("latitude", target.latitude)
            .query("longitude", target.longitude)
            .query("start_date", start.format("%Y-%m-%d"))
            .query("end_date", end.format("%Y-%m-%d"))
            .query("daily", DAILY_VARIABLES.join(","))
            .query("timezone", "UTC"))
    }

    fn parse_page(
        &self,
        target: &Target,
        body: &str,
    ) -> Result<Vec<CanonicalObservation>, NormalizeError> {
        let response: ArchiveResponse = serde_json::from_str(body)
            .map_err(|err| NormalizeError::Malformed(err.to_string()))?;
        let Some(daily) = response.daily else {
            return Ok(Vec::new());
        };
        let Some(times) = daily.time.as_ref() else {
            return Ok(Vec::new());
        };

        let provenance = self.provenance();
        let mut observations = Vec::with_capacity(times.len());
        for (idx, time) in times.iter().enumerate() {
            let date = parse_date(time)?;
            let mut obs = CanonicalObservation::empty(target.id.clone(), date, provenance);
            obs.snowfall_mm = at(&daily.snowfall_sum, idx).map(|cm| cm * CM_TO_MM);
            obs.precipitation_mm = at(&daily.precipitation_sum, idx);
            obs.rain_mm = at(&daily.rain_sum, idx);
            obs.temp_max_c = at(&daily.temperature_2m_max, idx);
            obs.temp_min_c = at(&daily.temperature_2m_min, idx);
            obs.temp_mean_c = at(&daily.temperature_2m_mean, idx);
            obs.apparent_temp_max_c = at(&daily.apparent_temperature_max, idx);
            obs.apparent_temp_min_c = at(&daily.apparent_temperature_min, idx);
            obs.precipitation_hours = at(&daily.precipitation_hours, idx);
            obs.radiation_sum_mj_m2 = at(&daily.shortwave_radiation_sum, idx);
            obs.sunshine_duration_s = at(&daily.sunshine_duration, idx);
            obs.evapotranspiration_mm = at(&daily.et0_fao_evapotranspiration, idx);
            obs.wind_speed_max_ms = at(&daily.wind_speed_10m_max, idx).map(|kmh| kmh * KMH_TO_MS);
            obs.wind_gust_max_ms = at(&daily.wind_gusts_10m_max, idx).map(|kmh| kmh * KMH_TO_MS);
            obs.wind_direction_deg = at(&daily.wind_direction_10m_dominant, idx);
            obs.weather_code = at(&daily.weather_code, idx).map(|code| code.round() as i64);
            observations.push(obs);
        }
        Ok(observations)
    }
}
