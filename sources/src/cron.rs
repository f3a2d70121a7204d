//! Scheduled source. Configured with a cronspec of the form
//! `seconds(optional) minutes hours day-of-month month day-of-week`,
//! a descriptor such as `@hourly`, or `@every <duration>`. Each firing
//! invokes the fn with an empty map.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{parse_duration, Configurable, Context, Function, Map, Source, Value};
use errors::{ConfigError, Error, Result};
use log::debug;

enum CronSchedule {
    Every(Duration),
    Spec(Box<cron::Schedule>),
}

pub struct CronSource {
    schedule: Option<CronSchedule>,
}

impl CronSource {
    pub fn new() -> CronSource {
        CronSource { schedule: None }
    }
}

impl Default for CronSource {
    fn default() -> Self {
        CronSource::new()
    }
}

fn parse_cronspec(spec: &str) -> Result<CronSchedule> {
    let spec = spec.trim();

    if let Some(rest) = spec.strip_prefix("@every") {
        return Ok(CronSchedule::Every(parse_duration(rest.trim())?));
    }

    // Descriptors and five-field specs normalize to the six-field
    // seconds-first form.
    let normalized = match spec {
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@weekly" => "0 0 0 * * Sun".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@hourly" => "0 0 * * * *".to_string(),
        other if other.starts_with('@') => {
            return Err(Error::parse(format!("unknown cron descriptor {other:?}")))
        }
        other if other.split_whitespace().count() == 5 => format!("0 {other}"),
        other => other.to_string(),
    };

    let schedule = cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::with_message(errors::ErrorKind::Parse, format!("cronspec {spec:?}"), Some(e)))?;
    Ok(CronSchedule::Spec(Box::new(schedule)))
}

impl Configurable for CronSource {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_string(&mut self, value: String) -> Result<()> {
        self.schedule = Some(parse_cronspec(&value)?);
        Ok(())
    }
}

#[async_trait]
impl Source for CronSource {
    async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()> {
        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("cron source".to_string()))?;

        loop {
            let wait = match schedule {
                CronSchedule::Every(period) => *period,
                CronSchedule::Spec(schedule) => match schedule.upcoming(Utc).next() {
                    Some(next) => (next - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                    None => {
                        // Nothing will ever fire again; park until shutdown.
                        ctx.done().await;
                        return Ok(());
                    }
                },
            };

            tokio::select! {
                _ = ctx.done() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }

            let f = f.clone();
            let tick_ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = f.invoke(&tick_ctx, Value::Map(Map::new())).await {
                    debug!("cron invocation returned error: {e}");
                }
            });
        }
    }
}
