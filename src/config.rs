use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::domain::ProviderKind;
use crate::error::BackfillError;

pub const DEFAULT_BUDGET: f64 = 5000.0;
pub const DEFAULT_START_YEAR: i32 = 1940;
pub const DEFAULT_COMPLETENESS_THRESHOLD: u64 = 20_000;
pub const DEFAULT_PREVIEW_LIMIT: usize = 50;

/// Retry, backoff and circuit-breaker settings for the fetch client.
#[derive(Debug, Clone, Serialize)]
pub struct FetchPolicy {
    pub max_rate_limit_retries: u32,
    pub rate_limit_base_delay: Duration,
    pub rate_limit_max_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub transport_retries: u32,
    pub transport_retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 4,
            rate_limit_base_delay: Duration::from_secs(5),
            rate_limit_max_delay: Duration::from_secs(60),
            circuit_breaker_threshold: 5,
            transport_retries: 2,
            transport_retry_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl FetchPolicy {
    /// Backoff for the `attempt`-th consecutive rate-limit rejection (1-based).
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        let delay = self.rate_limit_base_delay.saturating_mul(attempt.max(1));
        delay.min(self.rate_limit_max_delay)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub provider: ProviderKind,
    /// Weighted-cost cap for this run.
    pub budget: f64,
    pub rate_limit: Duration,
    pub start_year: i32,
    pub today: NaiveDate,
    pub max_tier: u8,
    pub completeness_threshold: u64,
    pub preview_limit: usize,
    pub fetch: FetchPolicy,
}

impl RunConfig {
    pub fn for_provider(provider: ProviderKind, today: NaiveDate) -> Self {
        let rate_limit = match provider {
            ProviderKind::OpenMeteo => Duration::from_millis(1500),
            ProviderKind::Noaa => Duration::from_millis(300),
        };
        Self {
            provider,
            budget: DEFAULT_BUDGET,
            rate_limit,
            start_year: DEFAULT_START_YEAR,
            today,
            max_tier: 3,
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            fetch: FetchPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), BackfillError> {
        if !self.budget.is_finite() || self.budget < 0.0 {
            return Err(BackfillError::Config(format!(
                "budget must be a non-negative number, got {}",
                self.budget
            )));
        }
        if self.start_year > self.today.year() {
            return Err(BackfillError::Config(format!(
                "start year {} is after the current year {}",
                self.start_year,
                self.today.year()
            )));
        }
        if !(1..=3).contains(&self.max_tier) {
            return Err(BackfillError::Config(format!(
                "max tier must be 1, 2 or 3, got {}",
                self.max_tier
            )));
        }
        if self.fetch.circuit_breaker_threshold == 0 {
            return Err(BackfillError::Config(
                "circuit breaker threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses a non-negative seconds value from the command line into a `Duration`.
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("not a number: {value}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|_| format!("invalid duration: {value}"))
}
