//! Deferred task processor (§4.7). Scheduling a task doesn't run it inline;
//! it queues the task for the next call to [`DeferredProcessor::process`],
//! normally made once per poll iteration from [`crate::poll_group::PollGroup`].
//! This gives callbacks a place to react to state changes (sender flow
//! control, object destruction) without running nested inside whatever lock
//! or call stack triggered the change.
//!
//! A [`Registration`] groups the tasks belonging to one owner (a sender, a
//! connection) so they can all be revoked together when the owner goes away.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::cb::Cb;

struct TaskSlot {
    cb: Option<Cb<bool>>,
    permanent: bool,
    scheduled: bool,
}

struct Core {
    tasks: Mutex<Slab<TaskSlot>>,
    oneshot_queue: Mutex<VecDeque<usize>>,
    permanent: Mutex<Vec<usize>>,
    trigger: Mutex<Option<Cb>>,
}

impl Core {
    fn fire_trigger(&self) {
        if let Some(cb) = self.trigger.lock().unwrap().as_mut() {
            cb.call();
        }
    }

    fn call_task(&self, id: usize) -> Option<bool> {
        let mut cb = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.get_mut(id)?.cb.take()
        }?;
        let result = cb.call();
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(slot) = tasks.get_mut(id) {
            slot.cb = Some(cb);
        }
        result
    }
}

/// Per-thread-context deferred task queue. Cheap to clone: all clones share
/// the same underlying task storage.
#[derive(Clone)]
pub struct DeferredProcessor {
    core: Arc<Core>,
}

impl DeferredProcessor {
    pub fn new() -> DeferredProcessor {
        DeferredProcessor {
            core: Arc::new(Core {
                tasks: Mutex::new(Slab::new()),
                oneshot_queue: Mutex::new(VecDeque::new()),
                permanent: Mutex::new(Vec::new()),
                trigger: Mutex::new(None),
            }),
        }
    }

    /// Wires a callback that wakes the owning `PollGroup` when a task is
    /// scheduled from another thread. Set once, by the thread context that
    /// owns this processor.
    pub fn set_trigger(&self, cb: Cb) {
        *self.core.trigger.lock().unwrap() = Some(cb);
    }

    pub fn new_registration(&self) -> Registration {
        Registration {
            core: self.core.clone(),
            owned: Mutex::new(Vec::new()),
        }
    }

    /// Runs every scheduled one-shot task and every permanent task once.
    /// Returns whether another `process()` call would find more work
    /// (either a re-armed one-shot task or — always — the presence of any
    /// permanent task, since permanent tasks force another iteration).
    pub fn process(&self) -> bool {
        let mut more = false;

        let due: Vec<usize> = self.core.oneshot_queue.lock().unwrap().drain(..).collect();
        for id in due {
            let was_scheduled = {
                let mut tasks = self.core.tasks.lock().unwrap();
                match tasks.get_mut(id) {
                    Some(slot) if slot.scheduled => {
                        slot.scheduled = false;
                        true
                    }
                    _ => false,
                }
            };
            if !was_scheduled {
                continue;
            }
            if let Some(true) = self.core.call_task(id) {
                self.schedule_raw(id);
                more = true;
            }
        }

        let permanent_ids: Vec<usize> = self.core.permanent.lock().unwrap().clone();
        if !permanent_ids.is_empty() {
            more = true;
        }
        for id in permanent_ids {
            self.core.call_task(id);
        }

        more
    }

    fn schedule_raw(&self, id: usize) {
        let mut tasks = self.core.tasks.lock().unwrap();
        if let Some(slot) = tasks.get_mut(id) {
            if !slot.scheduled {
                slot.scheduled = true;
                drop(tasks);
                self.core.oneshot_queue.lock().unwrap().push_back(id);
                self.core.fire_trigger();
            }
        }
    }
}

impl Default for DeferredProcessor {
    fn default() -> DeferredProcessor {
        DeferredProcessor::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

/// A owner-scoped handle for scheduling and revoking tasks against a shared
/// [`DeferredProcessor`].
pub struct Registration {
    core: Arc<Core>,
    owned: Mutex<Vec<usize>>,
}

impl Registration {
    /// Registers a new task, initially unscheduled (unless `permanent`, in
    /// which case it runs on every `process()` call from here on).
    pub fn add_task(&self, cb: impl FnMut() -> bool + Send + 'static, permanent: bool) -> TaskId {
        let id = self.core.tasks.lock().unwrap().insert(TaskSlot {
            cb: Some(Cb::new(cb)),
            permanent,
            scheduled: false,
        });
        self.owned.lock().unwrap().push(id);
        if permanent {
            self.core.permanent.lock().unwrap().push(id);
        }
        TaskId(id)
    }

    /// Queues `id` to run on the next `process()` call. No-op if already
    /// scheduled or if `id` was permanent (already always-scheduled).
    pub fn schedule_task(&self, id: TaskId) {
        let mut tasks = self.core.tasks.lock().unwrap();
        if let Some(slot) = tasks.get_mut(id.0) {
            if slot.permanent || slot.scheduled {
                return;
            }
            slot.scheduled = true;
            drop(tasks);
            self.core.oneshot_queue.lock().unwrap().push_back(id.0);
            self.core.fire_trigger();
        }
    }

    /// Cancels a pending schedule without removing the task; it can be
    /// scheduled again later.
    pub fn revoke_task(&self, id: TaskId) {
        if let Some(slot) = self.core.tasks.lock().unwrap().get_mut(id.0) {
            slot.scheduled = false;
        }
    }

    /// Removes every task created through this registration.
    pub fn release(&self) {
        let owned: Vec<usize> = self.owned.lock().unwrap().drain(..).collect();
        let mut tasks = self.core.tasks.lock().unwrap();
        let mut permanent = self.core.permanent.lock().unwrap();
        for id in owned {
            tasks.try_remove(id);
            permanent.retain(|&p| p != id);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scheduled_task_runs_once_on_process() {
        let dp = DeferredProcessor::new();
        let reg = dp.new_registration();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = reg.add_task(move || { c.fetch_add(1, Ordering::SeqCst); false }, false);

        assert!(!dp.process());
        reg.schedule_task(id);
        assert!(!dp.process());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_returning_true_reschedules_itself() {
        let dp = DeferredProcessor::new();
        let reg = dp.new_registration();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = reg.add_task(
            move || {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                n < 3
            },
            false,
        );
        reg.schedule_task(id);
        assert!(dp.process());
        assert!(dp.process());
        assert!(!dp.process());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_task_always_runs_and_forces_another_iteration() {
        let dp = DeferredProcessor::new();
        let reg = dp.new_registration();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        reg.add_task(move || { c.fetch_add(1, Ordering::SeqCst); false }, true);

        assert!(dp.process());
        assert!(dp.process());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn revoked_task_does_not_run() {
        let dp = DeferredProcessor::new();
        let reg = dp.new_registration();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = reg.add_task(move || { c.fetch_add(1, Ordering::SeqCst); false }, false);
        reg.schedule_task(id);
        reg.revoke_task(id);
        dp.process();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn releasing_a_registration_removes_its_tasks() {
        let dp = DeferredProcessor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let reg = dp.new_registration();
            let c = calls.clone();
            reg.add_task(move || { c.fetch_add(1, Ordering::SeqCst); false }, true);
            assert!(dp.process());
        }
        assert!(!dp.process());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
