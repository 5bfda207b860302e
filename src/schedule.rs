//! Cron scheduler
//!
//! A single scheduler drives every recurring activity in the service: topic
//! refresh ticks, the recycle-bin sweep, author subscription polls, and
//! provider maintenance ticks. Expressions come in two forms:
//!
//! - standard five-field cron (`分 时 日 月 周`), evaluated in the configured
//!   time zone (default Asia/Shanghai),
//! - the `@every <duration>` shortcut (e.g. `@every 1h`, `@every 30m`).
//!
//! Registration failures (invalid expressions) surface synchronously so the
//! lifecycle API can reject bad metadata with a 400 before anything is
//! scheduled.

use crate::collection::SyncMap;
use crate::error::{Error, Result};
use crate::types::CronHandle;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default scheduler time zone
const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Shanghai;

/// The action fired on each tick of a cron entry
pub type CronAction = Arc<dyn Fn() + Send + Sync>;

/// A parsed schedule expression
#[derive(Clone, Debug)]
enum CronSpec {
    /// Five-field cron expression
    Expr(Box<cron::Schedule>),
    /// `@every <duration>` shortcut
    Every(Duration),
}

/// Parse a schedule expression into its spec.
///
/// Five-field expressions are normalised to the six-field form the `cron`
/// crate expects by prepending a seconds field of `0`.
fn parse_spec(expr: &str) -> Result<CronSpec> {
    let expr = expr.trim();
    if let Some(rest) = expr.strip_prefix("@every") {
        let dur = humantime::parse_duration(rest.trim()).map_err(|_| Error::InvalidCron {
            expr: expr.to_string(),
        })?;
        if dur.is_zero() {
            return Err(Error::InvalidCron {
                expr: expr.to_string(),
            });
        }
        return Ok(CronSpec::Every(dur));
    }

    let fields = expr.split_whitespace().count();
    let normalised = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule = cron::Schedule::from_str(&normalised).map_err(|_| Error::InvalidCron {
        expr: expr.to_string(),
    })?;
    Ok(CronSpec::Expr(Box::new(schedule)))
}

#[derive(Clone)]
struct Entry {
    cancel: CancellationToken,
    next_fire: Arc<Mutex<Option<DateTime<Utc>>>>,
}

/// Cron scheduler parametrised by a time zone.
///
/// Entries are identified by opaque [`CronHandle`]s; handle `0` is reserved
/// for "no entry" and is ignored by [`remove`](Self::remove).
pub struct CronScheduler {
    tz: Tz,
    entries: SyncMap<CronHandle, Entry>,
    next_id: AtomicU64,
    root: CancellationToken,
}

impl CronScheduler {
    /// Create a scheduler for the named time zone, falling back to
    /// Asia/Shanghai when the name does not resolve.
    pub fn new(timezone: &str) -> Self {
        let tz = match Tz::from_str(timezone) {
            Ok(tz) => tz,
            Err(_) => {
                tracing::warn!(timezone, "unknown time zone, falling back to Asia/Shanghai");
                DEFAULT_TIMEZONE
            }
        };
        Self {
            tz,
            entries: SyncMap::new(),
            next_id: AtomicU64::new(1),
            root: CancellationToken::new(),
        }
    }

    /// Validate an expression without registering anything.
    pub fn validate(expr: &str) -> Result<()> {
        parse_spec(expr).map(|_| ())
    }

    /// Register an entry; `action` fires on every tick until the entry is
    /// removed or the scheduler stops.
    ///
    /// Returns the handle synchronously; an invalid expression is an error
    /// and registers nothing.
    pub fn add(&self, expr: &str, action: CronAction) -> Result<CronHandle> {
        let spec = parse_spec(expr)?;
        let handle = self.next_id.fetch_add(1, Ordering::Relaxed);

        let entry = Entry {
            cancel: self.root.child_token(),
            next_fire: Arc::new(Mutex::new(None)),
        };
        self.entries.put(handle, entry.clone());

        let tz = self.tz;
        let cancel = entry.cancel.clone();
        let next_fire = entry.next_fire.clone();
        tokio::spawn(async move {
            loop {
                let Some((delay, at)) = next_tick(&spec, tz) else {
                    break;
                };
                if let Ok(mut slot) = next_fire.lock() {
                    *slot = Some(at);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => action(),
                }
            }
        });

        Ok(handle)
    }

    /// Cancel an entry. Handle `0` and unknown handles are no-ops.
    pub fn remove(&self, handle: CronHandle) {
        if handle == 0 {
            return;
        }
        if let Some(entry) = self.entries.delete(&handle) {
            entry.cancel.cancel();
        }
    }

    /// The next fire time of an entry, if it is registered and has computed
    /// its first tick.
    pub fn next_fire(&self, handle: CronHandle) -> Option<DateTime<Utc>> {
        let entry = self.entries.get(&handle)?;
        let slot = entry.next_fire.lock().ok()?;
        *slot
    }

    /// Compute when an expression would first fire, without registering it.
    ///
    /// Used to decide whether a freshly loaded topic needs a jitter timer
    /// before its first cron tick.
    pub fn preview_next(&self, expr: &str) -> Result<Option<DateTime<Utc>>> {
        let spec = parse_spec(expr)?;
        Ok(next_tick(&spec, self.tz).map(|(_, at)| at))
    }

    /// Cancel every entry and refuse nothing further; idempotent.
    pub fn stop(&self) {
        self.root.cancel();
        self.entries.clear();
    }
}

/// Compute the delay until, and instant of, the next tick.
fn next_tick(spec: &CronSpec, tz: Tz) -> Option<(Duration, DateTime<Utc>)> {
    match spec {
        CronSpec::Every(d) => Some((*d, Utc::now() + chrono::Duration::from_std(*d).ok()?)),
        CronSpec::Expr(schedule) => {
            let next = schedule.upcoming(tz).next()?;
            let next_utc = next.with_timezone(&Utc);
            let delay = (next_utc - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            Some((delay, next_utc))
        }
    }
}
