// ABOUTME: Cron trigger - fires a job at each time matched by a 5-field cron expression
// ABOUTME: Evaluated in a configured time zone; stops waiting as soon as shutdown is signalled

use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::broadcast;

use crate::error::{Result, SyncError};

/// A parsed `m h dom mon dow` schedule bound to a time zone.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronTrigger {
    /// Parse a classic five-field cron expression.
    ///
    /// Numeric days of week follow the classic convention (0 or 7 is
    /// Sunday); names such as `MON-FRI` are accepted too.
    pub fn new(expression: &str, timezone: Tz) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SyncError::Config(format!(
                "cron expression '{}' must have five fields: minute hour day-of-month month day-of-week",
                expression
            )));
        }

        let extended = format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            translate_day_of_week(fields[4])
        );
        let schedule = Schedule::from_str(&extended).map_err(|e| {
            SyncError::Config(format!("invalid cron expression '{}': {}", expression, e))
        })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Call `job` at every fire time until `shutdown` receives a message.
    ///
    /// A job that is already running is awaited to completion; shutdown only
    /// interrupts the wait between fire times.
    pub async fn run<F, Fut>(&self, mut shutdown: broadcast::Receiver<()>, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        tracing::info!(
            "Starting scheduler with cron={} in {}",
            self.expression,
            self.timezone
        );

        loop {
            let now = Utc::now();
            let Some(next) = self.next_after(now) else {
                tracing::warn!("Cron expression {} has no future fire times", self.expression);
                break;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tracing::info!("Next run at {}", next.with_timezone(&self.timezone));

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            job().await;
        }
    }
}

/// Shift numeric day-of-week values from 0-7 (Sunday = 0 or 7) to the
/// 1-7 (Sunday = 1) numbering the `cron` crate expects. Step values after
/// `/` and names are left alone.
fn translate_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            if let Some(days) = expand_sunday_range(range, step) {
                return days;
            }
            let range = range
                .split('-')
                .map(|bound| match bound.parse::<u8>() {
                    Ok(n) if n <= 7 => ((n % 7) + 1).to_string(),
                    _ => bound.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// A numeric range ending at 7 wraps past Saturday once translated, so it
/// becomes an explicit list of days instead.
fn expand_sunday_range(range: &str, step: Option<&str>) -> Option<String> {
    let (low, high) = range.split_once('-')?;
    let low = low.parse::<u8>().ok()?;
    let high = high.parse::<u8>().ok()?;
    if high != 7 || low > high {
        return None;
    }
    let step = match step {
        Some(step) => step.parse::<usize>().ok().filter(|s| *s > 0)?,
        None => 1,
    };

    let mut days: Vec<u8> = (low..=high).step_by(step).map(|n| (n % 7) + 1).collect();
    days.sort_unstable();
    days.dedup();
    Some(
        days.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(","),
    )
}
