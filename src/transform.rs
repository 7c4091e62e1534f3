// ABOUTME: Row normalization between extraction and load
// ABOUTME: Blank-to-null casting, UTC timestamp normalization, and canonical column alignment

use chrono::{DateTime, Duration, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::value::{Record, Value};

/// Replace empty-string values with null. Any other string, including
/// `"0"` and whitespace, is kept.
pub fn cast_nulls(rows: Vec<Record>) -> Vec<Record> {
    rows.into_iter()
        .map(|row| {
            row.map_values(|v| match v {
                Value::String(s) if s.is_empty() => Value::Null,
                other => other,
            })
        })
        .collect()
}

/// Convert every date-time value to a UTC ISO-8601 string.
///
/// Values without zone information are taken to be local time in `tz`,
/// resolving DST edges to standard time: a repeated wall-clock time takes
/// the later (standard) offset, and a time inside a spring-forward gap is
/// read with the offset in force just before the gap. Dates, times, and
/// non-temporal values pass through.
pub fn normalize_timestamps(rows: Vec<Record>, tz: Tz) -> Vec<Record> {
    rows.into_iter()
        .map(|row| row.map_values(|v| normalize_value(v, tz)))
        .collect()
}

fn normalize_value(value: Value, tz: Tz) -> Value {
    match value {
        Value::DateTime(naive) => Value::String(localize(naive, tz).to_rfc3339()),
        Value::DateTimeTz(zoned) => Value::String(zoned.with_timezone(&Utc).to_rfc3339()),
        other => other,
    }
}

fn localize(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    if let Some(local) = tz.from_local_datetime(&naive).latest() {
        return local.with_timezone(&Utc);
    }

    // DST gap
    let offset_secs = naive
        .checked_sub_signed(Duration::days(1))
        .and_then(|earlier| tz.from_local_datetime(&earlier).latest())
        .map(|dt| dt.offset().fix().local_minus_utc())
        .unwrap_or(0);
    let utc = naive
        .checked_sub_signed(Duration::seconds(i64::from(offset_secs)))
        .unwrap_or(naive);
    Utc.from_utc_datetime(&utc)
}

/// Rewrite every row to exactly `columns`, in that order.
///
/// Columns the row lacks become null; columns outside the list are dropped.
pub fn align_columns(rows: Vec<Record>, columns: &[String]) -> Vec<Record> {
    rows.into_iter()
        .map(|mut row| {
            columns
                .iter()
                .map(|c| (c.clone(), row.take(c).unwrap_or(Value::Null)))
                .collect()
        })
        .collect()
}

/// The three passes in their fixed order.
#[derive(Debug, Clone, Copy)]
pub struct Transformer {
    timezone: Tz,
}

impl Transformer {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn apply(&self, rows: Vec<Record>, columns: &[String]) -> Vec<Record> {
        let rows = cast_nulls(rows);
        let rows = normalize_timestamps(rows, self.timezone);
        align_columns(rows, columns)
    }
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}
