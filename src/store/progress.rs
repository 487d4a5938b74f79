use std::collections::{BTreeSet, HashMap};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::domain::{Period, ProgressStatus, TargetId};
use crate::error::BackfillError;
use crate::store::{Store, now_rfc3339, parse_column};

/// Last recorded outcome of one `(target, period)` unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub target_id: TargetId,
    pub period: Period,
    pub status: ProgressStatus,
    pub units_written: u64,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSummary {
    pub pending: u64,
    pub completed: u64,
    pub no_data: u64,
    pub failed: u64,
}

impl ProgressSummary {
    pub fn terminal(&self) -> u64 {
        self.completed + self.no_data
    }

    pub fn total(&self) -> u64 {
        self.pending + self.completed + self.no_data + self.failed
    }

    pub(crate) fn add(&mut self, status: ProgressStatus) {
        match status {
            ProgressStatus::Pending => self.pending += 1,
            ProgressStatus::Completed => self.completed += 1,
            ProgressStatus::NoData => self.no_data += 1,
            ProgressStatus::Failed => self.failed += 1,
        }
    }
}

const TERMINAL_FILTER: &str = "status IN ('completed', 'no_data')";

impl Store {
    /// Periods of `target_id` that must never be fetched again.
    pub fn terminal_periods(&self, target_id: &TargetId) -> Result<BTreeSet<Period>, BackfillError> {
        let mut statement = self.conn.prepare_cached(&format!(
            "SELECT period FROM backfill_progress WHERE target_id = ?1 AND {TERMINAL_FILTER}"
        ))?;
        let rows = statement.query_map([target_id.as_str()], |row| {
            row.get::<_, i32>(0).map(Period::year)
        })?;
        let mut periods = BTreeSet::new();
        for period in rows {
            periods.insert(period?);
        }
        Ok(periods)
    }

    pub fn terminal_periods_by_target(
        &self,
    ) -> Result<HashMap<TargetId, BTreeSet<Period>>, BackfillError> {
        let mut statement = self.conn.prepare_cached(&format!(
            "SELECT target_id, period FROM backfill_progress WHERE {TERMINAL_FILTER}"
        ))?;
        let rows = statement.query_map([], |row| {
            Ok((
                parse_column::<TargetId>(row, 0)?,
                Period::year(row.get(1)?),
            ))
        })?;
        let mut by_target: HashMap<TargetId, BTreeSet<Period>> = HashMap::new();
        for row in rows {
            let (target_id, period) = row?;
            by_target.entry(target_id).or_default().insert(period);
        }
        Ok(by_target)
    }

    /// Upserts the outcome of one attempted unit. Committed immediately.
    pub fn record_outcome(
        &self,
        target_id: &TargetId,
        period: Period,
        status: ProgressStatus,
        units_written: usize,
        error_message: Option<&str>,
    ) -> Result<(), BackfillError> {
        write_outcome(&self.conn, target_id, period, status, units_written, error_message)?;
        Ok(())
    }

    pub fn outcome(
        &self,
        target_id: &TargetId,
        period: Period,
    ) -> Result<Option<ProgressRecord>, BackfillError> {
        let record = self
            .conn
            .query_row(
                "
                SELECT target_id, period, status, units_written, completed_at, error_message
                FROM backfill_progress
                WHERE target_id = ?1 AND period = ?2
                ",
                params![target_id.as_str(), period.value()],
                read_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Every recorded outcome, ordered by target then most recent period first.
    pub fn progress_records(&self) -> Result<Vec<ProgressRecord>, BackfillError> {
        let mut statement = self.conn.prepare_cached(
            "
            SELECT target_id, period, status, units_written, completed_at, error_message
            FROM backfill_progress
            ORDER BY target_id, period DESC
            ",
        )?;
        let rows = statement.query_map([], read_record)?;
        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    pub fn summarize(&self) -> Result<ProgressSummary, BackfillError> {
        let mut statement = self
            .conn
            .prepare_cached("SELECT status, COUNT(*) FROM backfill_progress GROUP BY status")?;
        let rows = statement.query_map([], |row| {
            Ok((parse_column::<ProgressStatus>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        let mut summary = ProgressSummary::default();
        for row in rows {
            let (status, count) = row?;
            let count = u64::try_from(count).unwrap_or(0);
            match status {
                ProgressStatus::Pending => summary.pending = count,
                ProgressStatus::Completed => summary.completed = count,
                ProgressStatus::NoData => summary.no_data = count,
                ProgressStatus::Failed => summary.failed = count,
            }
        }
        Ok(summary)
    }
}

pub(super) fn write_outcome(
    conn: &Connection,
    target_id: &TargetId,
    period: Period,
    status: ProgressStatus,
    units_written: usize,
    error_message: Option<&str>,
) -> rusqlite::Result<()> {
    let completed_at = (status != ProgressStatus::Pending).then(now_rfc3339);
    conn.execute(
        "
        INSERT INTO backfill_progress (
            target_id,
            period,
            status,
            units_written,
            completed_at,
            error_message
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(target_id, period) DO UPDATE SET
            status=excluded.status,
            units_written=excluded.units_written,
            completed_at=excluded.completed_at,
            error_message=excluded.error_message
        ",
        params![
            target_id.as_str(),
            period.value(),
            status.as_str(),
            i64::try_from(units_written).unwrap_or(i64::MAX),
            completed_at,
            error_message,
        ],
    )?;
    Ok(())
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressRecord> {
    Ok(ProgressRecord {
        target_id: parse_column(row, 0)?,
        period: Period::year(row.get(1)?),
        status: parse_column(row, 2)?,
        units_written: u64::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
        completed_at: row.get(4)?,
        error_message: row.get(5)?,
    })
}
