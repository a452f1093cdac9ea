use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use chrono::{DateTime, Utc};

use crate::task::TaskInvocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<EntryKey, TaskInvocation>,
    by_id: HashMap<String, EntryKey>,
    next_seq: u64,
}

/// In-memory set of invocations awaiting a future execute time, ordered by
/// that time with ties broken by insertion order. Shared between the
/// receiver and the scheduler tick; a single mutex serializes mutators.
pub struct Schedule {
    inner: Mutex<Inner>,
}

impl Schedule {
    pub fn new() -> Schedule {
        Schedule {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert keyed by task id. Re-adding an id replaces the old entry.
    pub fn add(&self, invocation: TaskInvocation) {
        let mut inner = self.inner.lock().unwrap();
        Self::add_locked(&mut inner, invocation);
    }

    fn add_locked(inner: &mut Inner, invocation: TaskInvocation) {
        if let Some(old_key) = inner.by_id.remove(&invocation.task_id) {
            inner.entries.remove(&old_key);
        }

        let key = EntryKey {
            at: invocation
                .execute_time
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            seq: inner.next_seq,
        };
        inner.next_seq += 1;
        inner.by_id.insert(invocation.task_id.clone(), key);
        inner.entries.insert(key, invocation);
    }

    pub fn remove(&self, task_id: &str) -> Option<TaskInvocation> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.by_id.remove(task_id)?;
        inner.entries.remove(&key)
    }

    /// Atomically take every entry with `execute_time <= now`, in order.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<TaskInvocation> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();

        while let Some(key) = inner.entries.keys().next().copied() {
            if key.at > now {
                break;
            }
            if let Some(invocation) = inner.entries.remove(&key) {
                inner.by_id.remove(&invocation.task_id);
                due.push(invocation);
            }
        }

        due
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().unwrap().by_id.contains_key(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<TaskInvocation> {
        let inner = self.inner.lock().unwrap();
        let key = inner.by_id.get(task_id)?;
        inner.entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current entries in schedule order, for persistence.
    pub fn snapshot(&self) -> Vec<TaskInvocation> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .cloned()
            .collect()
    }

    /// Replace the contents with a previously persisted snapshot.
    pub fn restore(&self, entries: Vec<TaskInvocation>) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.by_id.clear();
        for invocation in entries {
            Self::add_locked(&mut inner, invocation);
        }
    }
}

impl Default for Schedule {
    fn default() -> Schedule {
        Schedule::new()
    }
}
