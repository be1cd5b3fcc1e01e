use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Per-class announcement cooldown.
///
/// Remembers when each class was last announced and refuses another
/// announcement of the same class until `cooldown` has elapsed. Entries are
/// never evicted; the class vocabulary is fixed by the detector.
pub struct CooldownEngine {
    cooldown: Duration,
    last_announced: Mutex<HashMap<String, Instant>>,
}

impl CooldownEngine {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_announced: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// True when `class_name` has never been announced or its cooldown has
    /// elapsed at `now`. Does not record anything.
    pub fn should_announce(&self, class_name: &str, now: Instant) -> bool {
        is_due(&self.table(), class_name, now, self.cooldown)
    }

    /// Records an announcement of `class_name` at `now`.
    ///
    /// A timestamp older than the stored one is ignored so the per-class
    /// record never moves backwards.
    pub fn record_announcement(&self, class_name: &str, now: Instant) {
        record(&mut self.table(), class_name, now);
    }

    /// Checks the cooldown, runs `submit` when due, and records the
    /// announcement only if `submit` returns true. The whole sequence holds
    /// one lock, so concurrent callers cannot both announce a class inside a
    /// single cooldown window.
    pub fn announce_if_due<F>(&self, class_name: &str, now: Instant, submit: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let mut table = self.table();
        if !is_due(&table, class_name, now, self.cooldown) {
            return false;
        }
        if !submit() {
            return false;
        }
        record(&mut table, class_name, now);
        true
    }

    pub fn last_announced(&self, class_name: &str) -> Option<Instant> {
        self.table().get(class_name).copied()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        // Entries are single timestamps, so a poisoned table is still consistent.
        self.last_announced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_due(
    table: &HashMap<String, Instant>,
    class_name: &str,
    now: Instant,
    cooldown: Duration,
) -> bool {
    match table.get(class_name) {
        None => true,
        Some(&last) => now.saturating_duration_since(last) >= cooldown,
    }
}

fn record(table: &mut HashMap<String, Instant>, class_name: &str, now: Instant) {
    table
        .entry(class_name.to_string())
        .and_modify(|last| *last = (*last).max(now))
        .or_insert(now);
}
