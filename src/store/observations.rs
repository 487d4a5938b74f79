use std::collections::HashMap;

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};

use crate::domain::{CanonicalObservation, TargetId};
use crate::error::BackfillError;
use crate::store::{Store, parse_column};

const DATE_FORMAT: &str = "%Y-%m-%d";

impl Store {
    /// Idempotent batch upsert keyed on `(target_id, date)`. A row from a lower-ranked
    /// source never replaces a higher-ranked one. Returns the rows actually written.
    pub fn upsert_all(&mut self, observations: &[CanonicalObservation]) -> Result<usize, BackfillError> {
        let tx = self.conn.transaction()?;
        let applied = upsert_rows(&tx, observations)?;
        tx.commit()?;
        Ok(applied)
    }

    /// Stored row count per target; targets without rows are absent.
    pub fn observation_counts(&self) -> Result<HashMap<TargetId, u64>, BackfillError> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT target_id, COUNT(*) FROM daily_observations GROUP BY target_id")?;
        let rows = statement.query_map([], |row| {
            Ok((parse_column::<TargetId>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (target_id, count) = row?;
            counts.insert(target_id, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    pub fn observation(
        &self,
        target_id: &TargetId,
        date: NaiveDate,
    ) -> Result<Option<CanonicalObservation>, BackfillError> {
        let observation = self
            .conn
            .query_row(
                "
                SELECT target_id, date, snowfall_mm, snow_depth_mm, temp_max_c, temp_min_c,
                       temp_mean_c, apparent_temp_max_c, apparent_temp_min_c,
                       precipitation_mm, rain_mm, precipitation_hours, wind_speed_max_ms,
                       wind_gust_max_ms, wind_direction_deg, radiation_sum_mj_m2,
                       sunshine_duration_s, evapotranspiration_mm, weather_code, provenance
                FROM daily_observations
                WHERE target_id = ?1 AND date = ?2
                ",
                params![target_id.as_str(), date.format(DATE_FORMAT).to_string()],
                |row| {
                    let raw_date: String = row.get(1)?;
                    let date = NaiveDate::parse_from_str(&raw_date, DATE_FORMAT).map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(err))
                    })?;
                    Ok(CanonicalObservation {
                        target_id: parse_column(row, 0)?,
                        date,
                        snowfall_mm: row.get(2)?,
                        snow_depth_mm: row.get(3)?,
                        temp_max_c: row.get(4)?,
                        temp_min_c: row.get(5)?,
                        temp_mean_c: row.get(6)?,
                        apparent_temp_max_c: row.get(7)?,
                        apparent_temp_min_c: row.get(8)?,
                        precipitation_mm: row.get(9)?,
                        rain_mm: row.get(10)?,
                        precipitation_hours: row.get(11)?,
                        wind_speed_max_ms: row.get(12)?,
                        wind_gust_max_ms: row.get(13)?,
                        wind_direction_deg: row.get(14)?,
                        radiation_sum_mj_m2: row.get(15)?,
                        sunshine_duration_s: row.get(16)?,
                        evapotranspiration_mm: row.get(17)?,
                        weather_code: row.get(18)?,
                        provenance: parse_column(row, 19)?,
                    })
                },
            )
            .optional()?;
        Ok(observation)
    }
}

pub(super) fn upsert_rows(
    conn: &Connection,
    observations: &[CanonicalObservation],
) -> rusqlite::Result<usize> {
    let mut statement = conn.prepare_cached(
        "
        INSERT INTO daily_observations (
            target_id,
            date,
            snowfall_mm,
            snow_depth_mm,
            temp_max_c,
            temp_min_c,
            temp_mean_c,
            apparent_temp_max_c,
            apparent_temp_min_c,
            precipitation_mm,
            rain_mm,
            precipitation_hours,
            wind_speed_max_ms,
            wind_gust_max_ms,
            wind_direction_deg,
            radiation_sum_mj_m2,
            sunshine_duration_s,
            evapotranspiration_mm,
            weather_code,
            provenance,
            provenance_rank
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21
        )
        ON CONFLICT(target_id, date) DO UPDATE SET
            snowfall_mm=excluded.snowfall_mm,
            snow_depth_mm=excluded.snow_depth_mm,
            temp_max_c=excluded.temp_max_c,
            temp_min_c=excluded.temp_min_c,
            temp_mean_c=excluded.temp_mean_c,
            apparent_temp_max_c=excluded.apparent_temp_max_c,
            apparent_temp_min_c=excluded.apparent_temp_min_c,
            precipitation_mm=excluded.precipitation_mm,
            rain_mm=excluded.rain_mm,
            precipitation_hours=excluded.precipitation_hours,
            wind_speed_max_ms=excluded.wind_speed_max_ms,
            wind_gust_max_ms=excluded.wind_gust_max_ms,
            wind_direction_deg=excluded.wind_direction_deg,
            radiation_sum_mj_m2=excluded.radiation_sum_mj_m2,
            sunshine_duration_s=excluded.sunshine_duration_s,
            evapotranspiration_mm=excluded.evapotranspiration_mm,
            weather_code=excluded.weather_code,
            provenance=excluded.provenance,
            provenance_rank=excluded.provenance_rank
        WHERE excluded.provenance_rank >= daily_observations.provenance_rank
        ",
    )?;

    let mut applied = 0;
    for obs in observations {
        applied += statement.execute(params![
            obs.target_id.as_str(),
            obs.date.format(DATE_FORMAT).to_string(),
            obs.snowfall_mm,
            obs.snow_depth_mm,
            obs.temp_max_c,
            obs.temp_min_c,
            obs.temp_mean_c,
            obs.apparent_temp_max_c,
            obs.apparent_temp_min_c,
            obs.precipitation_mm,
            obs.rain_mm,
            obs.precipitation_hours,
            obs.wind_speed_max_ms,
            obs.wind_gust_max_ms,
            obs.wind_direction_deg,
            obs.radiation_sum_mj_m2,
            obs.sunshine_duration_s,
            obs.evapotranspiration_mm,
            obs.weather_code,
            obs.provenance.as_str(),
            obs.provenance.rank(),
        ])?;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Provenance;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 2, 15).unwrap()
    }

    fn observation(provenance: Provenance, snowfall: f64) -> CanonicalObservation {
        let mut obs = CanonicalObservation::empty("alta_ut".parse().unwrap(), day(), provenance);
        obs.snowfall_mm = Some(snowfall);
        obs
    }

    #[test]
    fn unknown_fields_stay_null() {
        let mut store = Store::open_in_memory().unwrap();
        let obs = observation(Provenance::OpenMeteo, 12.0);
        store.upsert_all(std::slice::from_ref(&obs)).unwrap();
        let stored = store.observation(&obs.target_id, day()).unwrap().unwrap();
        assert_eq!(stored, obs);
        assert_eq!(stored.temp_max_c, None);
    }

    #[test]
    fn every_measured_column_round_trips() {
        let mut store = Store::open_in_memory().unwrap();
        let mut obs = observation(Provenance::OpenMeteo, 3.0);
        obs.apparent_temp_max_c = Some(-9.5);
        obs.apparent_temp_min_c = Some(-21.0);
        obs.precipitation_hours = Some(6.0);
        obs.radiation_sum_mj_m2 = Some(8.42);
        obs.sunshine_duration_s = Some(21_600.0);
        obs.evapotranspiration_mm = Some(0.4);
        obs.weather_code = Some(71);
        store.upsert_all(std::slice::from_ref(&obs)).unwrap();
        let stored = store.observation(&obs.target_id, day()).unwrap().unwrap();
        assert_eq!(stored, obs);
    }

    #[test]
    fn gridded_data_never_overwrites_station_data() {
        let mut store = Store::open_in_memory().unwrap();
        let station = observation(Provenance::NoaaGhcnd, 76.0);
        let gridded = observation(Provenance::OpenMeteo, 40.0);

        assert_eq!(store.upsert_all(std::slice::from_ref(&station)).unwrap(), 1);
        assert_eq!(store.upsert_all(std::slice::from_ref(&gridded)).unwrap(), 0);

        let stored = store.observation(&station.target_id, day()).unwrap().unwrap();
        assert_eq!(stored.provenance, Provenance::NoaaGhcnd);
        assert_eq!(stored.snowfall_mm, Some(76.0));
    }

    #[test]
    fn station_data_replaces_gridded_data() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .upsert_all(&[observation(Provenance::OpenMeteo, 40.0)])
            .unwrap();
        store
            .upsert_all(&[observation(Provenance::NoaaGhcnd, 55.0)])
            .unwrap();
        let stored = store
            .observation(&"alta_ut".parse().unwrap(), day())
            .unwrap()
            .unwrap();
        assert_eq!(stored.provenance, Provenance::NoaaGhcnd);
        assert_eq!(stored.snowfall_mm, Some(55.0));
    }

    #[test]
    fn counts_rows_per_target() {
        let mut store = Store::open_in_memory().unwrap();
        let mut rows = Vec::new();
        for d in 1..=3 {
            let date = NaiveDate::from_ymd_opt(2021, 1, d).unwrap();
            rows.push(CanonicalObservation::empty(
                "alta_ut".parse().unwrap(),
                date,
                Provenance::OpenMeteo,
            ));
        }
        store.upsert_all(&rows).unwrap();
        store.upsert_all(&rows).unwrap();
        let counts = store.observation_counts().unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[&"alta_ut".parse::<TargetId>().unwrap()], 3);
    }
}
