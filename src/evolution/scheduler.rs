//! Cron-driven trigger for the evolution loop.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EvolutionConfig;

use super::cycle::EvolutionLoop;

/// Zone a cron expression is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleZone {
    Named(Tz),
    Local,
}

impl ScheduleZone {
    /// IANA name, or host local time when unset.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => Ok(Self::Local),
            Some(n) => n
                .parse::<Tz>()
                .map(Self::Named)
                .map_err(|e| anyhow::anyhow!("Invalid evolution timezone '{n}': {e}")),
        }
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr.trim())
        .with_context(|| format!("Invalid evolution schedule '{expr}'"))
}

/// First fire time strictly after `after`.
pub fn next_fire(schedule: &Schedule, zone: ScheduleZone, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match zone {
        ScheduleZone::Named(tz) => schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|t| t.with_timezone(&Utc)),
        ScheduleZone::Local => schedule
            .after(&after.with_timezone(&Local))
            .next()
            .map(|t| t.with_timezone(&Utc)),
    }
}

/// Run a cycle at every fire time until `token` is cancelled.
///
/// Each cycle's as-of time is the moment it fires. Cycle errors are logged
/// and the loop keeps going; the previous instructions stay active.
pub fn spawn_scheduler(
    evolution: Arc<EvolutionLoop>,
    config: &EvolutionConfig,
    token: CancellationToken,
) -> Result<JoinHandle<()>> {
    let schedule = parse_schedule(&config.schedule)?;
    let zone = ScheduleZone::parse(config.timezone.as_deref())?;

    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = next_fire(&schedule, zone, Utc::now()) else {
                tracing::warn!("Evolution schedule has no future fire times; scheduler stopped");
                return;
            };
            tracing::debug!(next = %next, "Next evolution cycle scheduled");
            let wait = (next - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                () = token.cancelled() => {
                    tracing::info!("Evolution scheduler stopped");
                    return;
                }
                () = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = evolution.run_cycle(Utc::now()).await {
                tracing::warn!(error = %e, code = e.code(), "Scheduled evolution cycle failed");
            }
        }
    }))
}
