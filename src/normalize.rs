use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CanonicalObservation, Period, Target};
use crate::fetch::RawPayload;
use crate::providers::Provider;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid date in payload: {0}")]
    InvalidDate(String),
}

/// How to fill in snowfall when the provider left it unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SnowfallRule {
    /// Trust the provider's own value; never estimate.
    Reported,
    /// Positive day-over-day snow depth change counts as new snow.
    DepthIncrease,
    /// Precipitation on days at or below `max_temp_c`, scaled by a snow-to-liquid `ratio`.
    ColdPrecipitation { max_temp_c: f64, ratio: f64 },
    /// First rule that produces a value wins.
    FirstOf { rules: Vec<SnowfallRule> },
}

impl SnowfallRule {
    fn estimate(
        &self,
        previous: Option<&CanonicalObservation>,
        current: &CanonicalObservation,
    ) -> Option<f64> {
        match self {
            SnowfallRule::Reported => current.snowfall_mm,
            SnowfallRule::DepthIncrease => {
                let previous = previous?;
                if previous.date.succ_opt() != Some(current.date) {
                    return None;
                }
                let change = current.snow_depth_mm? - previous.snow_depth_mm?;
                (change > 0.0).then_some(change)
            }
            SnowfallRule::ColdPrecipitation { max_temp_c, ratio } => {
                let precipitation = current.precipitation_mm?;
                let temp = current.temp_mean_c?;
                (precipitation > 0.0 && temp <= *max_temp_c).then(|| precipitation * ratio)
            }
            SnowfallRule::FirstOf { rules } => rules
                .iter()
                .find_map(|rule| rule.estimate(previous, current)),
        }
    }
}

/// Maps a provider payload to canonical observations. Pure: no network, no persistence.
#[derive(Debug, Clone)]
pub struct Normalizer {
    snowfall: SnowfallRule,
}

impl Normalizer {
    pub fn new(snowfall: SnowfallRule) -> Self {
        Self { snowfall }
    }

    pub fn for_provider<P: Provider + ?Sized>(provider: &P) -> Self {
        Self::new(provider.snowfall_rule())
    }

    pub fn normalize<P: Provider + ?Sized>(
        &self,
        provider: &P,
        target: &Target,
        period: Period,
        payload: &RawPayload,
    ) -> Result<Vec<CanonicalObservation>, NormalizeError> {
        let mut days: BTreeMap<NaiveDate, CanonicalObservation> = BTreeMap::new();
        for page in &payload.pages {
            for obs in provider.parse_page(target, page)? {
                if !period.contains(obs.date) {
                    continue;
                }
                match days.get_mut(&obs.date) {
                    Some(existing) => merge(existing, obs),
                    None => {
                        days.insert(obs.date, obs);
                    }
                }
            }
        }

        let mut observations: Vec<CanonicalObservation> = days.into_values().collect();
        for obs in &mut observations {
            if obs.temp_mean_c.is_none() {
                if let (Some(max), Some(min)) = (obs.temp_max_c, obs.temp_min_c) {
                    obs.temp_mean_c = Some((max + min) / 2.0);
                }
            }
        }

        for idx in 0..observations.len() {
            if observations[idx].snowfall_mm.is_some() {
                continue;
            }
            let previous = idx.checked_sub(1).map(|prev| &observations[prev]);
            let estimate = self.snowfall.estimate(previous, &observations[idx]);
            observations[idx].snowfall_mm = estimate.map(round_tenth);
        }

        Ok(observations)
    }
}

/// Later known values replace earlier ones; unknowns never erase.
fn merge(existing: &mut CanonicalObservation, update: CanonicalObservation) {
    fn take(slot: &mut Option<f64>, value: Option<f64>) {
        if value.is_some() {
            *slot = value;
        }
    }
    take(&mut existing.snowfall_mm, update.snowfall_mm);
    take(&mut existing.snow_depth_mm, update.snow_depth_mm);
    take(&mut existing.temp_max_c, update.temp_max_c);
    take(&mut existing.temp_min_c, update.temp_min_c);
    take(&mut existing.temp_mean_c, update.temp_mean_c);
    take(&mut existing.apparent_temp_max_c, update.apparent_temp_max_c);
    take(&mut existing.apparent_temp_min_c, update.apparent_temp_min_c);
    take(&mut existing.precipitation_mm, update.precipitation_mm);
    take(&mut existing.rain_mm, update.rain_mm);
    take(&mut existing.precipitation_hours, update.precipitation_hours);
    take(&mut existing.wind_speed_max_ms, update.wind_speed_max_ms);
    take(&mut existing.wind_gust_max_ms, update.wind_gust_max_ms);
    take(&mut existing.wind_direction_deg, update.wind_direction_deg);
    take(&mut existing.radiation_sum_mj_m2, update.radiation_sum_mj_m2);
    take(&mut existing.sunshine_duration_s, update.sunshine_duration_s);
    take(&mut existing.evapotranspiration_mm, update.evapotranspiration_mm);
    if update.weather_code.is_some() {
        existing.weather_code = update.weather_code;
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
