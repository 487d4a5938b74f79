use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::budget::CostModel;
use crate::domain::{CanonicalObservation, Period, Provenance, ProviderKind, Target};
use crate::fetch::{FetchError, HttpRequest};
use crate::normalize::{NormalizeError, SnowfallRule};
use crate::providers::{Provider, parse_date};

pub const CDO_DATA_URL: &str = "https://www.ncei.noaa.gov/cdo-web/api/v2/data";
pub const DATATYPES: &str = "TMAX,TMIN,TAVG,PRCP,SNOW,SNWD,WSF2,WSF5,WDF2";
pub const PAGE_LIMIT: u32 = 1000;

/// NOAA Climate Data Online, GHCN-Daily station observations. Requires a CDO token.
#[derive(Debug, Clone)]
pub struct NoaaProvider {
    base_url: String,
    token: String,
}

impl NoaaProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(CDO_DATA_URL, token)
    }

    pub fn with_base_url(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DataResponse {
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    results: Option<Vec<DataPoint>>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    resultset: ResultSet,
}

#[derive(Debug, Deserialize)]
struct ResultSet {
    offset: u32,
    count: u32,
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct DataPoint {
    date: String,
    datatype: String,
    value: f64,
}

impl Provider for NoaaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Noaa
    }

    fn provenance(&self) -> Provenance {
        Provenance::NoaaGhcnd
    }

    /// A station-year is roughly four paginated requests.
    fn cost_model(&self) -> CostModel {
        CostModel::Flat { per_unit: 4.0 }
    }

    fn snowfall_rule(&self) -> SnowfallRule {
        SnowfallRule::FirstOf {
            rules: vec![SnowfallRule::Reported, SnowfallRule::DepthIncrease],
        }
    }

    fn request(
        &self,
        target: &Target,
        period: Period,
        today: NaiveDate,
    ) -> Result<HttpRequest, FetchError> {
        let station = target.station_ref.as_deref().ok_or_else(|| {
            FetchError::InvalidRequest(format!("target {} has no GHCND station id", target.id))
        })?;
        let start = period.first_day();
        let end = period.last_day(today);
        if end < start {
            return Err(FetchError::InvalidRequest(format!(
                "period {period} has not started yet"
            )));
        }
        Ok(HttpRequest::get(&self.base_url)
            .header("token", &self.token)
            .query("datasetid", "GHCND")
            .query("stationid", format!("GHCND:{station}"))
            .query("startdate", start.format("%Y-%m-%d"))
            .query("enddate", end.format("%Y-%m-%d"))
            .query("datatypeid", DATATYPES)
            .query("units", "metric")
            .query("limit", PAGE_LIMIT)
            .query("offset", 1))
    }

    fn next_page(&self, previous: &HttpRequest, body: &str) -> Option<HttpRequest> {
        let response: DataResponse = serde_json::from_str(body).ok()?;
        let resultset = response.metadata?.resultset;
        let next_offset = resultset.offset.checked_add(resultset.limit)?;
        if resultset.limit == 0 || next_offset > resultset.count {
            return None;
        }
        Some(previous.with_query("offset", next_offset))
    }

    /// CDO allows five requests per second.
    fn page_delay(&self) -> Duration {
        Duration::from_millis(250)
    }

    fn parse_page(
        &self,
        target: &Target,
        body: &str,
    ) -> Result<Vec<CanonicalObservation>, NormalizeError> {
        let response: DataResponse = serde_json::from_str(body)
            .map_err(|err| NormalizeError::Malformed(err.to_string()))?;
        let Some(results) = response.results else {
            return Ok(Vec::new());
        };

        let provenance = self.provenance();
        let mut by_date: BTreeMap<NaiveDate, CanonicalObservation> = BTreeMap::new();
        for point in results {
            if !point.value.is_finite() {
                continue;
            }
            let date = parse_date(&point.date)?;
            let obs = by_date.entry(date).or_insert_with(|| {
                CanonicalObservation::empty(target.id.clone(), date, provenance)
            });
            let value = Some(point.value);
            match point.datatype.as_str() {
                "TMAX" => obs.temp_max_c = value,
                "TMIN" => obs.temp_min_c = value,
                "TAVG" => obs.temp_mean_c = value,
                "PRCP" => obs.precipitation_mm = value,
                "SNOW" => obs.snowfall_mm = value,
                "SNWD" => obs.snow_depth_mm = value,
                "WSF2" => obs.wind_speed_max_ms = value,
                "WSF5" => obs.wind_gust_max_ms = value,
                "WDF2" => obs.wind_direction_deg = value,
                _ => {}
            }
        }
        Ok(by_date.into_values().collect())
    }
}
