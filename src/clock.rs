use super::types::TimeStamp;
use std::sync::Mutex;

/// Source of `now` for every timestamp the engine writes.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp {
        TimeStamp::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<TimeStamp>,
}

impl ManualClock {
    pub fn new(start: TimeStamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: TimeStamp) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = now.plus(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
