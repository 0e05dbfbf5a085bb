//! Per-stage resource budget
//!
//! Parsers and differs call [`StageBudget::check`] at loop heads and
//! recursion points; exceeding the deadline or the nesting limit aborts the
//! stage with [`RuleError::ResourceExhausted`].

use std::time::{Duration, Instant};

use crate::config::LimitsConfig;
use crate::error::{Result, RuleError};
use crate::executor::Stage;

#[derive(Debug, Clone)]
pub struct StageBudget {
    stage: Stage,
    expires_at: Option<Instant>,
    max_nesting_depth: usize,
}

impl StageBudget {
    pub fn new(stage: Stage, timeout: Option<Duration>, max_nesting_depth: usize) -> Self {
        Self {
            stage,
            expires_at: timeout.map(|t| Instant::now() + t),
            max_nesting_depth,
        }
    }

    /// Fresh budget for `stage`, starting now
    pub fn start(stage: Stage, limits: &LimitsConfig) -> Self {
        Self::new(stage, limits.stage_timeout(), limits.max_nesting_depth)
    }

    /// No deadline, default nesting limit
    pub fn unbounded(stage: Stage) -> Self {
        Self::start(stage, &LimitsConfig::default())
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn max_nesting_depth(&self) -> usize {
        self.max_nesting_depth
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Fail once the deadline has passed
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            return Err(self.exhausted("deadline exceeded"));
        }
        Ok(())
    }

    /// Deadline check plus a nesting guard for recursive walks
    pub fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > self.max_nesting_depth {
            return Err(self.exhausted(format!(
                "nesting depth {} exceeds limit of {}",
                depth, self.max_nesting_depth
            )));
        }
        self.check()
    }

    pub fn exhausted(&self, reason: impl Into<String>) -> RuleError {
        RuleError::ResourceExhausted {
            stage: self.stage,
            reason: reason.into(),
        }
    }
}
