//! Progress records and console helpers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runner::Runner;

/// Completed and total job counts of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        Self { completed, total }
    }

    /// Completed share in `0.0..=1.0`; zero for an empty run.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }

    /// e.g. `"40% Complete - 6 Jobs Remaining of 10 Jobs"`.
    pub fn pretty(&self) -> String {
        let percent = (self.fraction() * 10_000.0).round() / 100.0;
        format!(
            "{percent}% Complete - {} Jobs Remaining of {} Jobs",
            self.remaining(),
            self.total
        )
    }
}

/// The cached text form, `"4.0 / 10.0"`.
impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} / {:.1}", self.completed as f64, self.total as f64)
    }
}

impl FromStr for Progress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Other(format!("malformed progress record: {s:?}"));
        let (completed, total) = s.split_once('/').ok_or_else(bad)?;
        let count = |part: &str| -> Result<usize> {
            let n: f64 = part.trim().parse().map_err(|_| bad())?;
            if n.is_finite() && n >= 0.0 {
                Ok(n.round() as usize)
            } else {
                Err(bad())
            }
        };
        Ok(Self::new(count(completed)?, count(total)?))
    }
}

/// Refresh a run's progress and render it for humans.
pub async fn pretty_progress(runner: &Runner) -> Result<String> {
    Ok(runner.update_progress().await?.pretty())
}

/// Print the run's progress every `interval` until it completes.
pub async fn track_progress(runner: &Runner, interval: Duration) -> Result<Progress> {
    loop {
        let progress = runner.update_progress().await?;
        println!("{}", progress.pretty());
        if runner.complete().await? {
            return Ok(progress);
        }
        tokio::time::sleep(interval).await;
    }
}
