//! Test report bookkeeping.
//!
//! Pure aggregation, no business logic: suites and cases are opened and
//! closed by the orchestrator, and their counts are the delta between
//! the running totals at open and at close. Rendering is left to the
//! caller.

use std::time::{Duration, Instant};
use tracing::warn;

/// One probe case.
#[derive(Debug, Clone)]
pub struct Case {
    /// Case name.
    pub name: String,
    /// Whether actual matched expected.
    pub ok: bool,
    /// Combined probe output.
    pub output: String,
    /// Wall-clock duration between open and close.
    pub duration: Duration,
}

/// One rule's suite of cases.
#[derive(Debug, Clone)]
pub struct Suite {
    /// Suite (rule) name.
    pub name: String,
    /// Cases closed while this suite was open.
    pub tests: usize,
    /// Failed cases closed while this suite was open.
    pub failures: usize,
    /// Wall-clock duration between open and close.
    pub duration: Duration,
    /// Cases in execution order.
    pub cases: Vec<Case>,
}

struct OpenCase {
    name: String,
    opened: Instant,
}

struct OpenSuite {
    name: String,
    tests_at_open: usize,
    failures_at_open: usize,
    opened: Instant,
    cases: Vec<Case>,
    current_case: Option<OpenCase>,
}

/// Hierarchical pass/fail/timing aggregation for one run.
#[derive(Debug)]
pub struct TestReport {
    name: String,
    tests: usize,
    failures: usize,
    suites: Vec<Suite>,
    current: Option<OpenSuite>,
    started: Instant,
    duration: Option<Duration>,
}

impl std::fmt::Debug for OpenSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSuite").field("name", &self.name).finish()
    }
}

impl TestReport {
    /// Create an empty report.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tests: 0,
            failures: 0,
            suites: Vec::new(),
            current: None,
            started: Instant::now(),
            duration: None,
        }
    }

    /// Open a suite. An already-open suite is closed first.
    pub fn start_suite(&mut self, name: &str) {
        if self.current.is_some() {
            warn!(suite = name, "previous suite left open, closing it");
            self.end_suite();
        }
        self.current = Some(OpenSuite {
            name: name.to_string(),
            tests_at_open: self.tests,
            failures_at_open: self.failures,
            opened: Instant::now(),
            cases: Vec::new(),
            current_case: None,
        });
    }

    /// Close the open suite, computing its counts as deltas against the
    /// running totals.
    pub fn end_suite(&mut self) {
        let Some(mut open) = self.current.take() else {
            warn!("end_suite without an open suite");
            return;
        };
        if open.current_case.is_some() {
            warn!(suite = %open.name, "case left open at suite close");
        }
        self.suites.push(Suite {
            name: open.name,
            tests: self.tests - open.tests_at_open,
            failures: self.failures - open.failures_at_open,
            duration: open.opened.elapsed(),
            cases: std::mem::take(&mut open.cases),
        });
    }

    /// Open a case within the open suite.
    pub fn start_case(&mut self, name: &str) {
        let Some(suite) = self.current.as_mut() else {
            warn!(case = name, "start_case without an open suite");
            return;
        };
        suite.current_case = Some(OpenCase {
            name: name.to_string(),
            opened: Instant::now(),
        });
    }

    /// Close the open case with its outcome and captured output.
    pub fn end_case(&mut self, ok: bool, output: String) {
        self.tests += 1;
        if !ok {
            self.failures += 1;
        }
        let Some(suite) = self.current.as_mut() else {
            warn!("end_case without an open suite");
            return;
        };
        let Some(open) = suite.current_case.take() else {
            warn!("end_case without an open case");
            return;
        };
        suite.cases.push(Case {
            name: open.name,
            ok,
            output,
            duration: open.opened.elapsed(),
        });
    }

    /// Finalize the report, fixing the total duration.
    pub fn finish(&mut self) {
        if self.current.is_some() {
            self.end_suite();
        }
        self.duration = Some(self.started.elapsed());
    }

    /// Report name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total cases closed.
    #[must_use]
    pub fn tests(&self) -> usize {
        self.tests
    }

    /// Total failed cases.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Whether every case passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures == 0
    }

    /// Closed suites in execution order.
    #[must_use]
    pub fn suites(&self) -> &[Suite] {
        &self.suites
    }

    /// Total duration; `None` until [`TestReport::finish`].
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
}

impl Default for TestReport {
    fn default() -> Self {
        Self::new("NetworkPolicyTests")
    }
}
