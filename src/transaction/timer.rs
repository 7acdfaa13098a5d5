//! Shared timer wheel. Deadlines are plain [`Instant`]s polled by the
//! endpoint loop, so tests can drive time by polling with an `Instant`
//! of their choosing instead of sleeping.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
struct TimerKey {
    execute_at: Instant,
    task_id: u64,
}

pub struct Timer<T> {
    tasks: RwLock<BTreeMap<TimerKey, T>>,
    id_to_tasks: RwLock<HashMap<u64, Instant>>,
    last_task_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            id_to_tasks: RwLock::new(HashMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|ts| ts.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .write()
            .as_mut()
            .map(|ts| {
                ts.insert(
                    TimerKey {
                        execute_at,
                        task_id,
                    },
                    value,
                )
            })
            .ok();
        self.id_to_tasks
            .write()
            .as_mut()
            .map(|it| it.insert(task_id, execute_at))
            .ok();
        task_id
    }

    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let execute_at = self
            .id_to_tasks
            .write()
            .as_mut()
            .map(|it| it.remove(&task_id))
            .ok()
            .flatten()?;
        self.tasks
            .write()
            .as_mut()
            .map(|ts| {
                ts.remove(&TimerKey {
                    execute_at,
                    task_id,
                })
            })
            .ok()
            .flatten()
    }

    /// Remove and return every task due at or before `now`, in
    /// deadline order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut result = Vec::new();
        let keys_to_remove = {
            let mut tasks = match self.tasks.write() {
                Ok(tasks) => tasks,
                Err(_) => return result,
            };
            let keys_to_remove = tasks
                .range(
                    ..=TimerKey {
                        execute_at: now,
                        task_id: u64::MAX,
                    },
                )
                .map(|(key, _)| *key)
                .collect::<Vec<_>>();
            if keys_to_remove.is_empty() {
                return result;
            }
            result.reserve(keys_to_remove.len());
            for key in keys_to_remove.iter() {
                if let Some(value) = tasks.remove(key) {
                    result.push(value);
                }
            }
            keys_to_remove
        };
        self.id_to_tasks
            .write()
            .as_mut()
            .map(|it| {
                for key in keys_to_remove {
                    it.remove(&key.task_id);
                }
            })
            .ok();
        result
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}
