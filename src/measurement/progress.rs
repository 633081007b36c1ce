//! Textual progress reporting on stdout.

use std::io::Write;
use std::time::{Duration, Instant};

/// `"{pct}% completed \telapsed time: {e}s \ttime left: {l}s"`
pub fn format_progress(fraction: f64, elapsed: Duration) -> String {
    let fraction = fraction.clamp(0.0, 1.0);
    let elapsed = elapsed.as_secs_f64();
    let time_left = if fraction > 0.0 {
        format!("{:.1}", (1.0 - fraction) / fraction * elapsed)
    } else {
        "??".to_string()
    };
    format!(
        "{:.0}% completed \telapsed time: {:.1}s \ttime left: {}s",
        fraction * 100.0,
        elapsed,
        time_left
    )
}

/// Rate-limited progress printer for one measurement run.
pub struct ProgressReporter {
    start: Instant,
    interval: Duration,
    last_print: Option<Instant>,
    verbose: bool,
    last_line: Option<String>,
}

impl ProgressReporter {
    /// Reporter printing at most once per `interval` when `verbose`.
    #[must_use]
    pub fn new(verbose: bool, interval: Duration) -> Self {
        Self {
            start: Instant::now(),
            interval,
            last_print: None,
            verbose,
            last_line: None,
        }
    }

    /// Time since the reporter was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Most recent line produced, printed or not.
    pub fn last_line(&self) -> Option<&str> {
        self.last_line.as_deref()
    }

    /// Report `done` of `total` points. The final update is always shown.
    pub fn update(&mut self, done: usize, total: usize) {
        let now = Instant::now();
        let finished = total > 0 && done >= total;
        let due = self
            .last_print
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !(due || finished) {
            return;
        }

        let fraction = if total == 0 {
            0.0
        } else {
            done as f64 / total as f64
        };
        let line = format_progress(fraction, self.start.elapsed());
        tracing::debug!(done, total, "{}", line);

        if self.verbose {
            let mut stdout = std::io::stdout().lock();
            let _ = write!(stdout, "\r{}", line);
            if finished {
                let _ = writeln!(stdout);
            }
            let _ = stdout.flush();
        }
        self.last_print = Some(now);
        self.last_line = Some(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_at_zero() {
        let line = format_progress(0.0, Duration::from_millis(300));
        assert_eq!(line, "0% completed \telapsed time: 0.3s \ttime left: ??s");
    }

    #[test]
    fn test_format_halfway() {
        let line = format_progress(0.5, Duration::from_secs(4));
        assert_eq!(line, "50% completed \telapsed time: 4.0s \ttime left: 4.0s");
    }

    #[test]
    fn test_format_done() {
        let line = format_progress(1.0, Duration::from_secs(2));
        assert_eq!(line, "100% completed \telapsed time: 2.0s \ttime left: 0.0s");
    }

    #[test]
    fn test_rate_limiting_keeps_final_line() {
        let mut reporter = ProgressReporter::new(false, Duration::from_secs(3600));
        reporter.update(1, 10);
        let first = reporter.last_line().map(str::to_string);
        reporter.update(5, 10);
        assert_eq!(reporter.last_line().map(str::to_string), first);
        reporter.update(10, 10);
        assert!(reporter.last_line().unwrap().starts_with("100% completed"));
    }
}
