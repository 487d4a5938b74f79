mod observations;
mod progress;

use std::error::Error as StdError;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8Path;
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use tracing::debug;

use crate::domain::{CanonicalObservation, Period, ProgressStatus, Target, TargetId};
use crate::error::BackfillError;

pub use progress::{ProgressRecord, ProgressSummary};

pub const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The shared SQLite database: progress outcomes, canonical observations and the
/// target mirror the analysis queries join against.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Utf8Path) -> Result<Self, BackfillError> {
        let conn = Connection::open(path.as_std_path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn };
        store.migrate()?;
        debug!(path = %path, "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, BackfillError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, BackfillError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), BackfillError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(BackfillError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../../migrations/0001_backfill_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Mirrors the catalog into the `targets` table.
    pub fn register_targets(&mut self, targets: &[Target]) -> Result<(), BackfillError> {
        let tx = self.conn.transaction()?;
        {
            let mut statement = tx.prepare_cached(
                "
                INSERT INTO targets (
                    target_id,
                    display_name,
                    latitude,
                    longitude,
                    group_tag,
                    station_ref
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(target_id) DO UPDATE SET
                    display_name=excluded.display_name,
                    latitude=excluded.latitude,
                    longitude=excluded.longitude,
                    group_tag=excluded.group_tag,
                    station_ref=excluded.station_ref
                ",
            )?;
            for target in targets {
                statement.execute(params![
                    target.id.as_str(),
                    target.display_name,
                    target.latitude,
                    target.longitude,
                    target.group,
                    target.station_ref,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Writes a unit's observations and its outcome atomically. Returns the number of
    /// rows the provenance guard let through.
    pub fn persist_unit(
        &mut self,
        target_id: &TargetId,
        period: Period,
        status: ProgressStatus,
        observations: &[CanonicalObservation],
        error_message: Option<&str>,
    ) -> Result<usize, BackfillError> {
        let tx = self.conn.transaction()?;
        let applied = observations::upsert_rows(&tx, observations)?;
        progress::write_outcome(
            &tx,
            target_id,
            period,
            status,
            observations.len(),
            error_message,
        )?;
        tx.commit()?;
        Ok(applied)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Reads a text column through `FromStr`, surfacing parse failures as conversion errors.
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: StdError + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}
