//! Event timing hooks.
//!
//! When the `timing` tunable is set, the build phases mark start and end
//! events through `log::debug!`. The disabled default costs nothing at the
//! call sites.

use std::time::Instant;

pub(crate) struct Timing {
    enabled: bool,
}

impl Timing {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Mark the start of an event; the end is marked when the returned
    /// guard drops.
    pub fn scope(&self, event: &'static str) -> TimingScope {
        if self.enabled {
            log::debug!("{event}: start");
            TimingScope {
                event,
                started: Some(Instant::now()),
            }
        } else {
            TimingScope {
                event,
                started: None,
            }
        }
    }
}

pub(crate) struct TimingScope {
    event: &'static str,
    started: Option<Instant>,
}

impl Drop for TimingScope {
    fn drop(&mut self) {
        if let Some(started) = self.started {
            log::debug!("{}: done in {:.3?}", self.event, started.elapsed());
        }
    }
}
