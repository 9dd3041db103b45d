//! Session profiling.
//!
//! Accumulates wall time per pipeline phase over the whole session and, when pass timing is
//! enabled, per optimizer pass. Reported once when the client ends the session.

use crate::opt::{Pass, PassTiming};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lifting,
    Optimizing,
    Codegen,
}

#[derive(Debug, Default)]
pub struct Profiler {
    enabled: bool,
    time_passes: bool,
    lifting: Duration,
    optimizing: Duration,
    codegen: Duration,
    /// Totals per pass, in first-seen order.
    passes: Vec<(Pass, Duration, usize)>,
}

impl Profiler {
    pub fn new(enabled: bool, time_passes: bool) -> Self {
        Self {
            enabled,
            time_passes,
            ..Self::default()
        }
    }

    /// Start of a timed phase; `None` when profiling is off.
    pub fn start(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    pub fn record(&mut self, phase: Phase, start: Option<Instant>) {
        let Some(start) = start else {
            return;
        };
        self.add(phase, start.elapsed());
    }

    pub fn add(&mut self, phase: Phase, elapsed: Duration) {
        let total = match phase {
            Phase::Lifting => &mut self.lifting,
            Phase::Optimizing => &mut self.optimizing,
            Phase::Codegen => &mut self.codegen,
        };
        *total += elapsed;
    }

    pub fn total(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Lifting => self.lifting,
            Phase::Optimizing => self.optimizing,
            Phase::Codegen => self.codegen,
        }
    }

    pub fn record_passes(&mut self, timings: &[PassTiming]) {
        for timing in timings {
            match self.passes.iter_mut().find(|(pass, _, _)| *pass == timing.pass) {
                Some((_, total, runs)) => {
                    *total += timing.duration;
                    *runs += 1;
                }
                None => self.passes.push((timing.pass, timing.duration, 1)),
            }
        }
    }

    /// Lines printed at the end of the session.
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.enabled {
            lines.push(self.to_string());
        }
        if self.time_passes {
            for (pass, total, runs) in &self.passes {
                lines.push(format!(
                    "Pass timing: {:>16} {:>8.3}ms over {runs} runs",
                    pass.name(),
                    total.as_secs_f64() * 1000.0
                ));
            }
        }
        lines
    }
}

impl fmt::Display for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server profile: {}ms lifting; {}ms opt; {}ms codegen",
            self.lifting.as_millis(),
            self.optimizing.as_millis(),
            self.codegen.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_profiler_records_nothing() {
        let mut profiler = Profiler::new(false, false);
        let start = profiler.start();
        assert!(start.is_none());
        profiler.record(Phase::Lifting, start);
        assert_eq!(profiler.total(Phase::Lifting), Duration::ZERO);
        assert!(profiler.report_lines().is_empty());
    }

    #[test]
    fn test_summary_line() {
        let mut profiler = Profiler::new(true, false);
        profiler.add(Phase::Lifting, Duration::from_millis(12));
        profiler.add(Phase::Lifting, Duration::from_millis(3));
        profiler.add(Phase::Optimizing, Duration::from_millis(7));
        profiler.add(Phase::Codegen, Duration::from_micros(1500));
        assert_eq!(
            profiler.report_lines(),
            vec!["Server profile: 15ms lifting; 7ms opt; 1ms codegen".to_string()]
        );
    }

    #[test]
    fn test_pass_totals_accumulate() {
        let mut profiler = Profiler::new(false, true);
        let timing = |pass, ms| PassTiming {
            pass,
            duration: Duration::from_millis(ms),
        };
        profiler.record_passes(&[timing(Pass::ConstFold, 2), timing(Pass::DeadCode, 1)]);
        profiler.record_passes(&[timing(Pass::ConstFold, 3)]);

        let lines = profiler.report_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("const-fold"));
        assert!(lines[0].contains("5.000ms over 2 runs"));
        assert!(lines[1].contains("dce"));
    }
}
