//! Short-lived memory of stop requests.
//!
//! A stop command and a fire event for the same alarm can arrive nearly
//! together. The stop is recorded here the moment it is issued, before it is
//! queued behind any fire event already in flight; the fire path checks this
//! tracker and stands down if a live request exists.
//!
//! Entries expire after a fixed window so a legitimately re-armed alarm is
//! not suppressed forever. Expired entries are purged on every access.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::alarm::AlarmId;

#[derive(Debug)]
pub struct StopRequestTracker {
    expiry: Duration,
    requests: Mutex<HashMap<AlarmId, Instant>>,
}

impl StopRequestTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_stop_requested(&self, id: AlarmId) {
        let mut requests = self.requests.lock();
        let now = Instant::now();
        requests.insert(id, now);
        self.purge(&mut requests, now);
    }

    pub fn is_stop_requested(&self, id: AlarmId) -> bool {
        let mut requests = self.requests.lock();
        self.purge(&mut requests, Instant::now());
        requests.contains_key(&id)
    }

    pub fn clear(&self, id: AlarmId) {
        self.requests.lock().remove(&id);
    }

    fn purge(&self, requests: &mut HashMap<AlarmId, Instant>, now: Instant) {
        requests.retain(|_, at| now.duration_since(*at) <= self.expiry);
    }
}
