//! Round-robin monitor registry.
//!
//! Each device's polling tick drains at most one entry, spreading expensive
//! reads across many 5 ms quanta. Permanent entries live for the device's
//! lifetime; temporary entries are inserted at the cursor so they are
//! serviced on the very next call, and removed after that single service.

use crate::bus::Timestamp;

type PollFn = Box<dyn FnMut(Timestamp) + Send>;

struct Entry {
    poll: PollFn,
    temporary: bool,
}

/// Ordered list of poll functions with an internal cursor.
pub struct MonitorRegistry {
    entries: Vec<Entry>,
    cursor: usize,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        MonitorRegistry {
            entries: Vec::new(),
            cursor: 0,
        }
    }

    /// Append a permanent entry.
    pub fn add<F>(&mut self, poll: F)
    where
        F: FnMut(Timestamp) + Send + 'static,
    {
        self.entries.push(Entry {
            poll: Box::new(poll),
            temporary: false,
        });
    }

    /// Insert a temporary entry at the cursor: it is serviced on the next
    /// `execute_next_mon` call regardless of cursor position, then removed.
    pub fn insert_temporary<F>(&mut self, poll: F)
    where
        F: FnMut(Timestamp) + Send + 'static,
    {
        let at = self.cursor.min(self.entries.len());
        self.entries.insert(
            at,
            Entry {
                poll: Box::new(poll),
                temporary: true,
            },
        );
    }

    /// Service exactly one entry and advance. Reaching the end returns
    /// `false` once and rewinds, so every entry is serviced exactly once
    /// per full drain cycle.
    pub fn execute_next_mon(&mut self, timestamp: Timestamp) -> bool {
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
            return false;
        }
        let temporary = self.entries[self.cursor].temporary;
        (self.entries[self.cursor].poll)(timestamp);
        if temporary {
            self.entries.remove(self.cursor);
        } else {
            self.cursor += 1;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
