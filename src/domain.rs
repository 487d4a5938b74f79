use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BackfillError;

static TARGET_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_.\-]*$").expect("target id pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetId(String);

impl TargetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TargetId {
    type Err = BackfillError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !TARGET_ID_RE.is_match(normalized) {
            return Err(BackfillError::InvalidTargetId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for TargetId {
    type Error = BackfillError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetId> for String {
    fn from(value: TargetId) -> Self {
        value.0
    }
}

/// One geographic collection point: a weather station or a grid cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub id: TargetId,
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
    pub group: String,
    /// Provider-specific station id for providers that cannot query by coordinates.
    pub station_ref: Option<String>,
}

/// Backfill granularity: one calendar year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Period(i32);

impl Period {
    pub fn year(year: i32) -> Self {
        Self(year)
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.0, 1, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Last day of the year, clipped to `today` for the current year.
    pub fn last_day(self, today: NaiveDate) -> NaiveDate {
        let end = NaiveDate::from_ymd_opt(self.0, 12, 31).unwrap_or(NaiveDate::MAX);
        end.min(today)
    }

    pub fn contains(self, date: NaiveDate) -> bool {
        date.year() == self.0
    }

    /// Every period from `today`'s year back to `start_year`, most recent first.
    pub fn range_recent_first(start_year: i32, today: NaiveDate) -> Vec<Period> {
        (start_year..=today.year()).rev().map(Period).collect()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The atomic piece of schedulable work.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub target: Target,
    pub period: Period,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cold,
    Partial,
    Covered,
}

impl Tier {
    pub fn rank(self) -> u8 {
        match self {
            Tier::Cold => 1,
            Tier::Partial => 2,
            Tier::Covered => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Cold => write!(f, "cold"),
            Tier::Partial => write!(f, "partial"),
            Tier::Covered => write!(f, "covered"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Completed,
    NoData,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Completed => "completed",
            ProgressStatus::NoData => "no_data",
            ProgressStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::NoData)
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = BackfillError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ProgressStatus::Pending),
            "completed" => Ok(ProgressStatus::Completed),
            "no_data" => Ok(ProgressStatus::NoData),
            "failed" => Ok(ProgressStatus::Failed),
            other => Err(BackfillError::Config(format!(
                "unknown progress status: {other}"
            ))),
        }
    }
}

/// Upstream source of a stored observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    NoaaGhcnd,
    OpenMeteo,
}

impl Provenance {
    /// Station observations outrank gridded model output.
    pub fn rank(self) -> i64 {
        match self {
            Provenance::NoaaGhcnd => 2,
            Provenance::OpenMeteo => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::NoaaGhcnd => "noaa_ghcnd",
            Provenance::OpenMeteo => "open_meteo",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = BackfillError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "noaa_ghcnd" => Ok(Provenance::NoaaGhcnd),
            "open_meteo" => Ok(Provenance::OpenMeteo),
            other => Err(BackfillError::Config(format!("unknown provenance: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenMeteo,
    Noaa,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenMeteo => write!(f, "open-meteo"),
            ProviderKind::Noaa => write!(f, "noaa"),
        }
    }
}

/// One normalized day of weather for one target. `None` means unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalObservation {
    pub target_id: TargetId,
    pub date: NaiveDate,
    pub snowfall_mm: Option<f64>,
    pub snow_depth_mm: Option<f64>,
    pub temp_max_c: Option<f64>,
    pub temp_min_c: Option<f64>,
    pub temp_mean_c: Option<f64>,
    pub apparent_temp_max_c: Option<f64>,
    pub apparent_temp_min_c: Option<f64>,
    pub precipitation_mm: Option<f64>,
    pub rain_mm: Option<f64>,
    pub precipitation_hours: Option<f64>,
    pub wind_speed_max_ms: Option<f64>,
    pub wind_gust_max_ms: Option<f64>,
    pub wind_direction_deg: Option<f64>,
    /// Daily shortwave radiation in MJ/m².
    pub radiation_sum_mj_m2: Option<f64>,
    pub sunshine_duration_s: Option<f64>,
    /// Reference evapotranspiration (FAO-56 ET0).
    pub evapotranspiration_mm: Option<f64>,
    pub weather_code: Option<i64>,
    pub provenance: Provenance,
}

impl CanonicalObservation {
    pub fn empty(target_id: TargetId, date: NaiveDate, provenance: Provenance) -> Self {
        Self {
            target_id,
            date,
            snowfall_mm: None,
            snow_depth_mm: None,
            temp_max_c: None,
            temp_min_c: None,
            temp_mean_c: None,
            apparent_temp_max_c: None,
            apparent_temp_min_c: None,
            precipitation_mm: None,
            rain_mm: None,
            precipitation_hours: None,
            wind_speed_max_ms: None,
            wind_gust_max_ms: None,
            wind_direction_deg: None,
            radiation_sum_mj_m2: None,
            sunshine_duration_s: None,
            evapotranspiration_mm: None,
            weather_code: None,
            provenance,
        }
    }
}
