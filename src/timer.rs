use std::time::{Duration, Instant};

/// Measures the wall time of an action, for diagnostic log lines
pub struct ExecutionTimer {
    beginning: Instant,
}

impl ExecutionTimer {
    pub fn new() -> Self {
        Self {
            beginning: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.beginning.elapsed()
    }

    /// e.g. "Parsing kernel32.dll took 0.02 s", seconds rounded up to two decimals
    pub fn build_log_message(&self, action: &str) -> String {
        let seconds = (self.elapsed().as_secs_f64() * 100.0).ceil() / 100.0;
        format!("{} took {} s", action, seconds)
    }
}

impl Default for ExecutionTimer {
    fn default() -> Self {
        Self::new()
    }
}
