//! Execution-scoped context and bookkeeping.
//!
//! The core never touches global state; the driver threads an
//! [`ExecutionCtx`] into operations that stamp executions.

use tracing::info;

/// Checker parameters consulted by the core.
#[derive(Debug, Clone)]
pub struct Params {
    /// Verbosity level for end-of-execution reporting.
    pub verbose: u8,
    /// Maximum number of executions to explore (0 = unlimited).
    pub max_executions: u32,
    /// Emit Graphviz dumps of the cycle graph and predicate trees.
    pub dump_graphs: bool,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            verbose: 0,
            max_executions: 0,
            dump_graphs: false,
        }
    }
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Feasible and ran to completion without bugs.
    Complete,
    /// Feasible but explored no new behavior.
    Redundant,
    /// Feasible with at least one bug report.
    Buggy,
    /// The speculative extension contradicted itself.
    Infeasible,
}

/// Counters accumulated across executions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecStats {
    pub num_total: u64,
    pub num_complete: u64,
    pub num_redundant: u64,
    pub num_buggy_executions: u64,
    pub num_infeasible: u64,
}

impl ExecStats {
    pub fn record(&mut self, outcome: ExecOutcome) {
        self.num_total += 1;
        match outcome {
            ExecOutcome::Complete => self.num_complete += 1,
            ExecOutcome::Redundant => self.num_redundant += 1,
            ExecOutcome::Buggy => self.num_buggy_executions += 1,
            ExecOutcome::Infeasible => self.num_infeasible += 1,
        }
    }

    pub fn log_summary(&self) {
        info!(
            complete = self.num_complete,
            redundant = self.num_redundant,
            buggy = self.num_buggy_executions,
            infeasible = self.num_infeasible,
            total = self.num_total,
            "model-checking complete"
        );
    }
}

/// Per-run context passed into the core.
///
/// Execution numbering starts at 1 and is bumped once per explored
/// execution; instruction records compare it to invalidate state from
/// earlier executions.
#[derive(Debug, Clone)]
pub struct ExecutionCtx {
    execution_number: u32,
    params: Params,
    stats: ExecStats,
}

impl ExecutionCtx {
    pub fn new(params: Params) -> Self {
        ExecutionCtx {
            execution_number: 1,
            params,
            stats: ExecStats::default(),
        }
    }

    pub fn execution_number(&self) -> u32 {
        self.execution_number
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn stats(&self) -> &ExecStats {
        &self.stats
    }

    /// Record the outcome of the current execution and move to the next.
    pub fn finish_execution(&mut self, outcome: ExecOutcome) {
        self.stats.record(outcome);
        self.execution_number += 1;
    }

    /// Reset numbering and counters after a checker restart.
    pub fn reset_for_restart(&mut self) {
        self.execution_number = 1;
        self.stats = ExecStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_numbering_advances_and_resets() {
        let mut ctx = ExecutionCtx::new(Params::default());
        assert_eq!(ctx.execution_number(), 1);
        ctx.finish_execution(ExecOutcome::Complete);
        ctx.finish_execution(ExecOutcome::Infeasible);
        assert_eq!(ctx.execution_number(), 3);
        assert_eq!(ctx.stats().num_total, 2);
        assert_eq!(ctx.stats().num_infeasible, 1);

        ctx.reset_for_restart();
        assert_eq!(ctx.execution_number(), 1);
        assert_eq!(ctx.stats().num_total, 0);
    }
}
