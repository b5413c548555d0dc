//! Locks, events and condition variables handed to plugins by handle.
//!
//! Every blocking call takes an absolute [`Deadline`]. An expired deadline
//! turns the call into a poll and [`Deadline::NO_LIMIT`] waits forever. A
//! wait that runs out of time returns `Timeout` and leaves the object as it
//! found it.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::thread::{self, ThreadId};

use super::registry::{ObjectKind, Resource};
use crate::error::{Result, VmiopError};
use crate::types::Deadline;


/// Blocks on `cv` until `ready` holds or `deadline` passes. Returns whether
/// `ready` held on exit.
fn wait_until<T, F>(cv: &Condvar, guard: &mut MutexGuard<'_, T>, deadline: Deadline, mut ready: F) -> bool
where
    F: FnMut(&mut T) -> bool,
{
    loop {
        if ready(&mut **guard) {
            return true;
        }
        match deadline.instant() {
            None => cv.wait(guard),
            Some(at) => {
                if cv.wait_until(guard, at).timed_out() {
                    return ready(&mut **guard);
                }
            }
        }
    }
}


/// Mutual exclusion lock that may be taken and released in separate calls.
#[derive(Default)]
pub struct Lock {
    holder: Mutex<Option<ThreadId>>,
    released: Condvar,
}


impl Resource for Lock {
    const KIND: ObjectKind = ObjectKind::Lock;
}


impl Lock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, waiting until `deadline`. Re-acquiring a lock the
    /// calling thread already holds fails with `Inval`.
    pub fn lock(&self, deadline: Deadline) -> Result<()> {
        let me = thread::current().id();
        let mut holder = self.holder.lock();
        if *holder == Some(me) {
            return Err(VmiopError::Inval);
        }
        if !wait_until(&self.released, &mut holder, deadline, |h| h.is_none()) {
            return Err(VmiopError::Timeout);
        }
        *holder = Some(me);
        Ok(())
    }

    pub fn try_lock(&self) -> Result<()> {
        self.lock(Deadline::POLL)
    }

    /// Releases the lock. Only the holding thread may do so.
    pub fn unlock(&self) -> Result<()> {
        let mut holder = self.holder.lock();
        if *holder != Some(thread::current().id()) {
            return Err(VmiopError::Inval);
        }
        *holder = None;
        drop(holder);
        self.released.notify_one();
        Ok(())
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }

    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }
}


#[derive(Default)]
struct EventState {
    posted: bool,
}


/// Level-triggered event.
#[derive(Default)]
pub struct Event {
    state: Mutex<EventState>,
    cv: Condvar,
}


impl Resource for Event {
    const KIND: ObjectKind = ObjectKind::Event;
}


impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts the event and wakes the first waiter, or all of them.
    pub fn post(&self, wakeup_first: bool) {
        self.state.lock().posted = true;
        if wakeup_first {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }

    /// Waits for the event to be posted.
    pub fn wait(&self, deadline: Deadline, clear_before_return: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !wait_until(&self.cv, &mut state, deadline, |s| s.posted) {
            return Err(VmiopError::Timeout);
        }
        if clear_before_return {
            state.posted = false;
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.state.lock().posted = false;
    }

    pub fn is_posted(&self) -> bool {
        self.state.lock().posted
    }
}


#[derive(Default)]
struct CondVarState {
    next_ticket: u64,
    waiting: VecDeque<u64>,
    woken: Vec<u64>,
}


/// Condition variable paired with a [`Lock`] at wait time.
#[derive(Default)]
pub struct CondVar {
    state: Mutex<CondVarState>,
    cv: Condvar,
}


impl Resource for CondVar {
    const KIND: ObjectKind = ObjectKind::CondVar;
}


impl CondVar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically releases `lock`, waits for a signal and re-acquires `lock`.
    ///
    /// The calling thread must hold `lock`. The lock is held again on
    /// return, including when the wait timed out.
    pub fn wait(&self, lock: &Lock, deadline: Deadline) -> Result<()> {
        if !lock.is_held_by_current_thread() {
            return Err(VmiopError::Inval);
        }
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push_back(ticket);
        // Registered before the lock drops, so no signal can slip past.
        if let Err(err) = lock.unlock() {
            state.waiting.retain(|&t| t != ticket);
            return Err(err);
        }

        let signalled = wait_until(&self.cv, &mut state, deadline, |s| s.woken.contains(&ticket));
        if signalled {
            state.woken.retain(|&t| t != ticket);
        } else {
            state.waiting.retain(|&t| t != ticket);
        }
        drop(state);

        lock.lock(Deadline::NO_LIMIT)?;
        if signalled { Ok(()) } else { Err(VmiopError::Timeout) }
    }

    /// Wakes the longest-waiting thread, if any.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        if let Some(ticket) = state.waiting.pop_front() {
            state.woken.push(ticket);
            drop(state);
            self.cv.notify_all();
        }
    }

    pub fn broadcast(&self) {
        let mut state = self.state.lock();
        if state.waiting.is_empty() {
            return;
        }
        let drained: Vec<u64> = state.waiting.drain(..).collect();
        state.woken.extend(drained);
        drop(state);
        self.cv.notify_all();
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().waiting.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn lock_is_exclusive_and_owned() {
        let lock = Arc::new(Lock::new());
        lock.lock(Deadline::NO_LIMIT).unwrap();
        assert_eq!(lock.lock(Deadline::POLL), Err(VmiopError::Inval));

        let other = Arc::clone(&lock);
        let res = thread::spawn(move || (other.try_lock(), other.unlock())).join().unwrap();
        assert_eq!(res, (Err(VmiopError::Timeout), Err(VmiopError::Inval)));

        lock.unlock().unwrap();
        assert_eq!(lock.unlock(), Err(VmiopError::Inval));
        assert!(!lock.is_locked());
    }

    #[test]
    fn event_wait_times_out_without_side_effects() {
        let ev = Event::new();
        assert_eq!(ev.wait(Deadline::POLL, true), Err(VmiopError::Timeout));
        assert_eq!(ev.wait(Deadline::after(Duration::from_millis(10)), true), Err(VmiopError::Timeout));
        ev.post(true);
        ev.wait(Deadline::POLL, false).unwrap();
        assert!(ev.is_posted());
        ev.wait(Deadline::POLL, true).unwrap();
        assert!(!ev.is_posted());
    }

    #[test]
    fn event_wakes_blocked_waiter() {
        let ev = Arc::new(Event::new());
        let waiter = {
            let ev = Arc::clone(&ev);
            thread::spawn(move || ev.wait(Deadline::after(Duration::from_secs(10)), true))
        };
        thread::sleep(Duration::from_millis(20));
        ev.post(false);
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn condvar_requires_lock_and_reacquires_on_timeout() {
        let lock = Lock::new();
        let cv = CondVar::new();
        assert_eq!(cv.wait(&lock, Deadline::POLL), Err(VmiopError::Inval));
        lock.lock(Deadline::NO_LIMIT).unwrap();
        assert_eq!(cv.wait(&lock, Deadline::after(Duration::from_millis(5))), Err(VmiopError::Timeout));
        assert!(lock.is_held_by_current_thread());
        assert_eq!(cv.waiters(), 0);
        lock.unlock().unwrap();
    }

    #[test]
    fn condvar_signal_reaches_waiter() {
        let lock = Arc::new(Lock::new());
        let cv = Arc::new(CondVar::new());
        let ready = Arc::new(Mutex::new(false));

        let waiter = {
            let (lock, cv, ready) = (Arc::clone(&lock), Arc::clone(&cv), Arc::clone(&ready));
            thread::spawn(move || {
                lock.lock(Deadline::NO_LIMIT).unwrap();
                while !*ready.lock() {
                    cv.wait(&lock, Deadline::after(Duration::from_secs(10))).unwrap();
                }
                lock.unlock().unwrap();
            })
        };

        while cv.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        lock.lock(Deadline::NO_LIMIT).unwrap();
        *ready.lock() = true;
        cv.signal();
        lock.unlock().unwrap();
        waiter.join().unwrap();
    }
}
