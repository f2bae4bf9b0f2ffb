use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// How long a hold may live before its release is worth a warning.
const WATCHDOG: Duration = Duration::from_secs(10);

/// Process-wide soft-reference table: hex hash -> hold count.
///
/// A hold keeps a blob alive while an operation is in flight, independent
/// of any persistent reference. Retain sweeps and attachment GC consult
/// the table before deleting anything.
#[derive(Clone, Default)]
pub struct HoldTable {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl HoldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a hold on a hash. Returns a guard; dropping it (or calling
    /// [`Hold::release`]) gives the hold back.
    pub fn hold(&self, hex: impl Into<String>) -> Hold {
        let hex = hex.into();
        *self.counts.lock().entry(hex.clone()).or_insert(0) += 1;
        Hold {
            table: self.clone(),
            hex,
            released: false,
            acquired: Instant::now(),
        }
    }

    /// `true` if at least one hold exists for the hash.
    pub fn is_held(&self, hex: &str) -> bool {
        self.counts.lock().contains_key(hex)
    }

    /// Current hold count for a hash.
    pub fn count(&self, hex: &str) -> usize {
        self.counts.lock().get(hex).copied().unwrap_or(0)
    }

    /// Decrement and return the remaining count; the entry is removed at
    /// zero.
    fn decrement(&self, hex: &str) -> usize {
        let mut counts = self.counts.lock();
        match counts.get_mut(hex) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                counts.remove(hex);
                0
            }
            None => 0,
        }
    }
}

impl std::fmt::Debug for HoldTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoldTable")
            .field("entries", &self.counts.lock().len())
            .finish()
    }
}

/// One live hold on a hash.
///
/// `release` is idempotent; a second call only warns. `Drop` releases as
/// a backstop so a hold can never outlive its owner, and logs when the
/// hold lived past the watchdog duration.
pub struct Hold {
    table: HoldTable,
    hex: String,
    released: bool,
    acquired: Instant,
}

impl Hold {
    /// The held hash, lowercase hex.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Give the hold back. Returns the remaining hold count for the hash.
    pub fn release(&mut self) -> usize {
        if self.released {
            warn!(hash = %self.hex, "hold released twice");
            return self.table.count(&self.hex);
        }
        self.released = true;
        self.table.decrement(&self.hex)
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        if !self.released {
            debug!(hash = %self.hex, "hold dropped without explicit release");
            self.table.decrement(&self.hex);
        }
        if self.acquired.elapsed() > WATCHDOG {
            warn!(
                hash = %self.hex,
                held_for = ?self.acquired.elapsed(),
                "hold lived past the watchdog duration"
            );
        }
    }
}
