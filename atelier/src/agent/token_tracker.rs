//! Per-instance context budget accounting.
//!
//! Counters only grow; the warning and critical thresholds each fire exactly
//! once per instance, on the record that crosses them. CRITICAL is the
//! registry's cue to hand the role off to a fresh instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use a2a_event::TokenUsage;

/// Result of recording one operation's usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageStatus {
    Ok,
    /// Crossed the warning fraction with this record.
    Warning,
    /// Crossed the critical fraction with this record; handoff required.
    Critical,
}

/// One recorded operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot embedded into handoff documents.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub cumulative_input: u64,
    pub cumulative_output: u64,
    pub cumulative_cached: u64,
    pub total: u64,
    pub usage_fraction: f64,
    pub context_limit: u64,
}

/// Cumulative token tracking for one agent instance.
#[derive(Clone, Debug)]
pub struct TokenTracker {
    context_limit: u64,
    warn_fraction: f64,
    crit_fraction: f64,
    cumulative_input: u64,
    cumulative_output: u64,
    cumulative_cached: u64,
    operations: Vec<OperationRecord>,
    warning_fired: bool,
    critical_fired: bool,
}

impl TokenTracker {
    pub fn new(context_limit: u64, warn_fraction: f64, crit_fraction: f64) -> Self {
        Self {
            context_limit: context_limit.max(1),
            warn_fraction,
            crit_fraction,
            cumulative_input: 0,
            cumulative_output: 0,
            cumulative_cached: 0,
            operations: Vec::new(),
            warning_fired: false,
            critical_fired: false,
        }
    }

    pub fn total(&self) -> u64 {
        self.cumulative_input + self.cumulative_output
    }

    pub fn usage_fraction(&self) -> f64 {
        self.total() as f64 / self.context_limit as f64
    }

    pub fn operations(&self) -> &[OperationRecord] {
        &self.operations
    }

    /// Adds one operation's usage and reports whether a threshold was crossed
    /// by this record. Each threshold fires at most once per instance.
    pub fn record(&mut self, op_name: &str, usage: &TokenUsage) -> UsageStatus {
        self.cumulative_input += usage.input_tokens;
        self.cumulative_output += usage.output_tokens;
        self.cumulative_cached += usage.cached_tokens;
        self.operations.push(OperationRecord {
            op_name: op_name.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            timestamp: Utc::now(),
        });

        let fraction = self.usage_fraction();
        if fraction >= self.crit_fraction && !self.critical_fired {
            self.critical_fired = true;
            // A jump straight past both thresholds still reports only the
            // more severe crossing; warning must not fire afterwards.
            self.warning_fired = true;
            return UsageStatus::Critical;
        }
        if fraction >= self.warn_fraction && !self.warning_fired {
            self.warning_fired = true;
            return UsageStatus::Warning;
        }
        UsageStatus::Ok
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            cumulative_input: self.cumulative_input,
            cumulative_output: self.cumulative_output,
            cumulative_cached: self.cumulative_cached,
            total: self.total(),
            usage_fraction: self.usage_fraction(),
            context_limit: self.context_limit,
        }
    }
}
