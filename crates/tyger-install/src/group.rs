//! Promise groups: one synchronization barrier per provisioning wave

use crate::error::Result;
use crate::promise::{Awaitable, Dependency};
use crate::report::WaveReport;
use std::time::Instant;

/// An ordered set of type-erased promises forming one wave
///
/// Members are already running when they are added; draining the group only
/// collects their results.
#[derive(Default, Clone)]
pub struct PromiseGroup {
    members: Vec<Dependency>,
}

impl PromiseGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, member: Dependency) {
        self.members.push(member);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.members.iter()
    }

    /// Wait for every member in order and classify each outcome
    ///
    /// Never stops early: a failure in one member does not skip collecting the rest.
    pub async fn wait_all(&self) -> WaveReport {
        let started = Instant::now();
        let mut report = WaveReport::new();

        for member in &self.members {
            match member.wait_err().await {
                Ok(()) => report.add_success(),
                Err(err) => report.add_failure(err),
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Wait for the whole wave, log each root cause once, and fold the outcome
    ///
    /// Returns [`crate::InstallError::AlreadyLogged`] if anything failed.
    pub async fn wait(&self) -> Result<()> {
        let report = self.wait_all().await;
        tracing::debug!("Wave finished: {}", report);
        report.into_result()
    }

    /// Wait for the whole wave and return the first error that is not a short-circuit
    ///
    /// Nothing is logged; the caller owns the error.
    pub async fn first_error(&self) -> Result<()> {
        let mut first = None;
        for member in &self.members {
            if let Err(err) = member.wait_err().await {
                if !err.is_dependency_failed() && first.is_none() {
                    first = Some(err);
                }
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
