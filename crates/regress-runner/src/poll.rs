use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::RegressResult;
use crate::markers::{count_completed, MarkerSource};

/// Jobs that may still be outstanding when the partial report is produced.
pub const PARTIAL_SLACK: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Partial,
    Final,
}

impl Threshold {
    pub fn reached(self, done: usize, total: usize) -> bool {
        match self {
            Threshold::Partial => done + PARTIAL_SLACK >= total,
            Threshold::Final => done >= total,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Threshold::Partial => "partial",
            Threshold::Final => "final",
        }
    }
}

/// The pause between poll cycles. Returning `Break` abandons the wait.
pub trait Pacer {
    fn pause(&mut self, interval: Duration) -> ControlFlow<()>;
}

/// Sleeps for the full interval and never abandons the wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepPacer;

impl Pacer for SleepPacer {
    fn pause(&mut self, interval: Duration) -> ControlFlow<()> {
        thread::sleep(interval);
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollProgress {
    pub at: DateTime<Utc>,
    pub cycle: usize,
    pub done: usize,
    pub total: usize,
    pub threshold: Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Reached { done: usize, total: usize, cycles: usize },
    Interrupted { done: usize, total: usize, cycles: usize },
}

impl PollOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, PollOutcome::Reached { .. })
    }
}

pub struct Poller<'a> {
    source: &'a dyn MarkerSource,
    jobs: BTreeSet<String>,
    interval: Duration,
    last_done: Option<usize>,
}

impl<'a> Poller<'a> {
    pub fn new(source: &'a dyn MarkerSource, jobs: BTreeSet<String>, interval: Duration) -> Self {
        Self {
            source,
            jobs,
            interval,
            last_done: None,
        }
    }

    pub fn total(&self) -> usize {
        self.jobs.len()
    }

    pub fn last_done(&self) -> Option<usize> {
        self.last_done
    }

    /// One scan: how many known jobs have a marker right now.
    pub fn scan(&mut self) -> RegressResult<usize> {
        let markers = self.source.enumerate()?;
        let done = count_completed(&markers, &self.jobs);
        self.last_done = Some(done);
        Ok(done)
    }

    /// Scans until `threshold` is reached, pausing between cycles. There is no
    /// timeout; only the pacer can end the wait early.
    pub fn wait_for(
        &mut self,
        threshold: Threshold,
        pacer: &mut dyn Pacer,
        on_progress: &mut dyn FnMut(&PollProgress),
    ) -> RegressResult<PollOutcome> {
        let total = self.total();
        let mut cycle = 0usize;
        loop {
            cycle += 1;
            let done = self.scan()?;
            let progress = PollProgress {
                at: Utc::now(),
                cycle,
                done,
                total,
                threshold,
            };
            info!(
                at = %progress.at.to_rfc3339(),
                waiting_for = threshold.as_str(),
                "{}/{} jobs done",
                done,
                total
            );
            on_progress(&progress);
            if threshold.reached(done, total) {
                return Ok(PollOutcome::Reached {
                    done,
                    total,
                    cycles: cycle,
                });
            }
            if pacer.pause(self.interval).is_break() {
                return Ok(PollOutcome::Interrupted {
                    done,
                    total,
                    cycles: cycle,
                });
            }
        }
    }
}
