//! Measurements of how long the phases of disassembly take.
//!
//! Every call of [`with`] is added to a process-wide table of phases, so the
//! numbers accumulate across disassemblies until [`reset`] is called.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use lazy_static::lazy_static;


lazy_static! {
    /// Holds all measurements.
    static ref TIMER: Mutex<Timer> = Mutex::new(Timer::default());
}

/// The accumulated measurements of all phases.
#[derive(Debug, Default)]
struct Timer {
    phases: HashMap<&'static str, Phase>,
}

/// Acquire the timer. A panic while measuring leaves the table intact, so a
/// poisoned lock is still usable.
fn timer() -> MutexGuard<'static, Timer> {
    TIMER.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run the closure and add its duration to the phase `name`.
pub fn with<F, T>(name: &'static str, f: F) -> T where F: FnOnce() -> T {
    let started = Instant::now();
    let value = f();
    let elapsed = started.elapsed();

    let mut timer = timer();
    let phase = timer.phases.entry(name).or_insert_with(|| Phase::new(name));
    phase.calls += 1;
    phase.duration += elapsed;

    value
}

/// Retrieve the measurements so far.
pub fn get() -> Report {
    let timer = timer();
    let mut phases: Vec<Phase> = timer.phases.values().cloned().collect();
    phases.sort_by(|a, b| b.duration.cmp(&a.duration).then(a.name.cmp(b.name)));
    Report { phases }
}

/// Forget all measurements.
pub fn reset() {
    timer().phases.clear();
}

/// How often a phase ran and how long it took in total.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Phase {
    pub name: &'static str,
    pub calls: u64,
    pub duration: Duration,
}

impl Phase {
    fn new(name: &'static str) -> Phase {
        Phase { name, calls: 0, duration: Duration::from_nanos(0) }
    }

    /// The average duration of one call.
    pub fn average(&self) -> Duration {
        if self.calls == 0 {
            Duration::from_nanos(0)
        } else {
            self.duration / self.calls as u32
        }
    }
}

/// A snapshot of all phases, sorted by total duration (high to low).
#[derive(Debug, Clone)]
pub struct Report {
    pub phases: Vec<Phase>,
}

impl Report {
    /// The measurements of the phase `name`.
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|phase| phase.name == name)
    }

    /// The summed duration of all phases.
    pub fn total(&self) -> Duration {
        self.phases.iter().map(|phase| phase.duration).sum()
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let total = self.total();
        for phase in &self.phases {
            let ratio = if total.as_nanos() == 0 {
                0.0
            } else {
                phase.duration.as_nanos() as f64 / total.as_nanos() as f64
            };
            writeln!(f, "{}: {:?} in {} calls, {:?} each ({:.2} %)",
                phase.name, phase.duration, phase.calls, phase.average(), 100.0 * ratio)?;
        }
        writeln!(f, "Total: {:?}", total)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_calls() {
        // Other tests measure concurrently, so only look at a private phase.
        let a = with("timings-test", || 1);
        let b = with("timings-test", || 2);
        assert_eq!(a + b, 3);

        let report = get();
        let phase = report.phase("timings-test").unwrap();
        assert!(phase.calls >= 2);
        assert!(phase.average() <= phase.duration);
        assert!(report.to_string().contains("timings-test: "));
        assert!(report.total() >= phase.duration);
    }

    #[test]
    fn average_of_nothing() {
        assert_eq!(Phase::new("empty").average(), Duration::from_nanos(0));
    }
}
