use std::time::Instant;

/// Logs how long a scope took at `trace` level. Does nothing, not even read the
/// clock, when trace logging is off.
pub struct ScopeTimer<'a> {
    name: &'a str,
    start_time: Option<Instant>,
}

impl<'a> ScopeTimer<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            start_time: log::log_enabled!(log::Level::Trace).then(Instant::now),
        }
    }
}

impl Drop for ScopeTimer<'_> {
    fn drop(&mut self) {
        if let Some(start_time) = self.start_time {
            log::trace!("{} took {:.2?}", self.name, start_time.elapsed());
        }
    }
}
