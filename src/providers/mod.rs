pub mod noaa;
pub mod open_meteo;

use std::time::Duration;

use chrono::NaiveDate;

use crate::budget::CostModel;
use crate::domain::{CanonicalObservation, Period, Provenance, ProviderKind, Target};
use crate::fetch::{FetchError, HttpRequest, HttpResponse};
use crate::normalize::{NormalizeError, SnowfallRule};

pub use noaa::NoaaProvider;
pub use open_meteo::OpenMeteoProvider;

/// Everything provider-specific: request shape, pagination, the rate-limit
/// predicate, pricing, provenance and the payload mapping.
pub trait Provider {
    fn kind(&self) -> ProviderKind;

    fn provenance(&self) -> Provenance;

    fn cost_model(&self) -> CostModel;

    fn snowfall_rule(&self) -> SnowfallRule {
        SnowfallRule::Reported
    }

    fn request(
        &self,
        target: &Target,
        period: Period,
        today: NaiveDate,
    ) -> Result<HttpRequest, FetchError>;

    fn next_page(&self, _previous: &HttpRequest, _body: &str) -> Option<HttpRequest> {
        None
    }

    fn page_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn is_rate_limited(&self, response: &HttpResponse) -> bool {
        response.status == 429
    }

    /// Maps one page into observations. Several pages may carry parts of the same day.
    fn parse_page(
        &self,
        target: &Target,
        body: &str,
    ) -> Result<Vec<CanonicalObservation>, NormalizeError>;
}

impl<P: Provider + ?Sized> Provider for Box<P> {
    fn kind(&self) -> ProviderKind {
        (**self).kind()
    }

    fn provenance(&self) -> Provenance {
        (**self).provenance()
    }

    fn cost_model(&self) -> CostModel {
        (**self).cost_model()
    }

    fn snowfall_rule(&self) -> SnowfallRule {
        (**self).snowfall_rule()
    }

    fn request(
        &self,
        target: &Target,
        period: Period,
        today: NaiveDate,
    ) -> Result<HttpRequest, FetchError> {
        (**self).request(target, period, today)
    }

    fn next_page(&self, previous: &HttpRequest, body: &str) -> Option<HttpRequest> {
        (**self).next_page(previous, body)
    }

    fn page_delay(&self) -> Duration {
        (**self).page_delay()
    }

    fn is_rate_limited(&self, response: &HttpResponse) -> bool {
        (**self).is_rate_limited(response)
    }

    fn parse_page(
        &self,
        target: &Target,
        body: &str,
    ) -> Result<Vec<CanonicalObservation>, NormalizeError> {
        (**self).parse_page(target, body)
    }
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate, NormalizeError> {
    let day = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|_| NormalizeError::InvalidDate(value.to_string()))
}
