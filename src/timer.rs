// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Timers that deliver their expirations as events.
//!
//! Timer waiters do not use the per-thread park protocol: all waiters on one
//! timer sleep on a single shared condition variable and, on every wake,
//! re-check whether they have become the queue head. Only the head consumes
//! an available expiration and pops itself; a pulse-type event is spent by
//! that consumption, while a non-pulse event stays set for the next head.
//! This serializes tick delivery to one waiter per expiration without a
//! condition variable per waiter.

use std::sync::{Arc, Condvar as HostCondvar, Mutex as HostMutex, PoisonError};
use std::time::Duration;

use log::{trace, warn};

use crate::attr::ObjectAttr;
use crate::error::SyncError;
use crate::kernel::{Kernel, Uid};
use crate::park::lock;
use crate::queue::{WaitPayload, WaitQueue, WaitRecord};
use crate::thread::ThreadHandle;

/// Deadline value of a disarmed timer.
const NEVER: u64 = u64::MAX;

pub(crate) struct Timer {
    uid: Uid,
    name: String,
    state: HostMutex<TimerState>,
    /// Shared by every waiter on this timer.
    tick: HostCondvar,
}

struct TimerState {
    /// Microsecond timestamp the timer counts from.
    base: u64,
    /// Next expiration; `NEVER` while unarmed.
    next_event: u64,
    interval: u64,
    is_repeat: bool,
    is_pulse: bool,
    event_set: bool,
    is_started: bool,
    waiters: WaitQueue,
}

impl TimerState {
    /// Folds an elapsed deadline into `event_set`; a repeating timer re-arms
    /// itself by whole interval multiples until the deadline is back in the
    /// future.
    fn refresh(&mut self, now: u64) {
        if !self.is_started || self.next_event > now {
            return;
        }
        self.event_set = true;
        if self.is_repeat && self.interval > 0 {
            let missed = (now - self.next_event) / self.interval + 1;
            self.next_event += missed * self.interval;
        } else {
            self.next_event = NEVER;
        }
    }
}

impl Kernel {
    pub(crate) fn find_timer(&self, uid: Uid) -> Result<Arc<Timer>, SyncError> {
        self.tables()
            .timers
            .get(&uid)
            .cloned()
            .ok_or(SyncError::UnknownTimerId)
    }

    pub fn timer_create(
        &self,
        thread_id: Uid,
        name: &str,
        attr: ObjectAttr,
    ) -> Result<Uid, SyncError> {
        Kernel::check_name(name, attr)?;
        let uid = self.next_uid();
        trace!("timer_create: uid: {uid} thread_id: {thread_id} name: \"{name}\"");
        let timer = Arc::new(Timer {
            uid,
            name: name.to_owned(),
            state: HostMutex::new(TimerState {
                base: self.now_us(),
                next_event: NEVER,
                interval: 0,
                is_repeat: false,
                is_pulse: false,
                event_set: false,
                is_started: false,
                waiters: WaitQueue::new(attr.discipline()),
            }),
            tick: HostCondvar::new(),
        });
        self.tables().timers.insert(uid, timer);
        Ok(uid)
    }

    pub fn timer_find(&self, name: &str) -> Result<Uid, SyncError> {
        let tables = self.tables();
        tables
            .timers
            .iter()
            .find(|(_, timer)| timer.name == name)
            .map(|(uid, _)| *uid)
            .ok_or(SyncError::UnknownTimerId)
    }

    /// Arms the expiration event: pulse or persistent, one-shot or periodic.
    pub fn timer_set_event(
        &self,
        timer_id: Uid,
        pulse: bool,
        interval_us: u64,
        repeat: bool,
    ) -> Result<(), SyncError> {
        let timer = self.find_timer(timer_id)?;
        let mut state = lock(&timer.state);
        state.is_pulse = pulse;
        state.interval = interval_us;
        state.is_repeat = repeat;
        state.event_set = false;
        if state.is_started && interval_us > 0 {
            state.next_event = self.now_us() + interval_us;
        }
        timer.tick.notify_all();
        Ok(())
    }

    pub fn timer_start(&self, timer_id: Uid) -> Result<(), SyncError> {
        let timer = self.find_timer(timer_id)?;
        let mut state = lock(&timer.state);
        if state.is_started {
            return Err(SyncError::TimerAlreadyStarted);
        }
        state.is_started = true;
        if state.interval > 0 {
            state.next_event = self.now_us() + state.interval;
        }
        timer.tick.notify_all();
        Ok(())
    }

    pub fn timer_stop(&self, timer_id: Uid) -> Result<(), SyncError> {
        let timer = self.find_timer(timer_id)?;
        let mut state = lock(&timer.state);
        if !state.is_started {
            return Err(SyncError::TimerNotStarted);
        }
        state.is_started = false;
        state.next_event = NEVER;
        timer.tick.notify_all();
        Ok(())
    }

    /// Microseconds the timer has counted since its base.
    pub fn timer_time(&self, timer_id: Uid) -> Result<u64, SyncError> {
        let timer = self.find_timer(timer_id)?;
        let base = lock(&timer.state).base;
        Ok(self.now_us().saturating_sub(base))
    }

    /// Rebases the timer so it reads `time`, returning the previous reading.
    pub fn timer_set_time(&self, timer_id: Uid, time: u64) -> Result<u64, SyncError> {
        let timer = self.find_timer(timer_id)?;
        let now = self.now_us();
        let mut state = lock(&timer.state);
        let previous = now.saturating_sub(state.base);
        state.base = now.saturating_sub(time);
        Ok(previous)
    }

    pub fn timer_base(&self, timer_id: Uid) -> Result<u64, SyncError> {
        let timer = self.find_timer(timer_id)?;
        let base = lock(&timer.state).base;
        Ok(base)
    }

    /// Microseconds until the next expiration; zero when disarmed or already
    /// elapsed.
    pub fn timer_remaining(&self, timer_id: Uid) -> Result<u64, SyncError> {
        let timer = self.find_timer(timer_id)?;
        let state = lock(&timer.state);
        if !state.is_started || state.next_event == NEVER {
            return Ok(0);
        }
        Ok(state.next_event.saturating_sub(self.now_us()))
    }

    /// Blocks until this timer delivers an expiration to the calling thread.
    /// Also reachable through [`Kernel::event_wait`] with the timer's id.
    pub fn timer_wait(
        &self,
        thread_id: Uid,
        timer_id: Uid,
        timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let timer = self.find_timer(timer_id)?;
        let thread = self.get_thread(thread_id)?;
        timer.wait(self, &thread, timeout)
    }

    pub fn timer_delete(&self, thread_id: Uid, timer_id: Uid) -> Result<(), SyncError> {
        let timer = self.find_timer(timer_id)?;
        let state = lock(&timer.state);
        if state.waiters.is_empty() {
            self.tables().timers.remove(&timer_id);
        } else {
            warn!(
                "timer_delete: uid: {} thread_id: {} has {} waiting threads, not deleting",
                timer_id,
                thread_id,
                state.waiters.len()
            );
        }
        Ok(())
    }
}

impl Timer {
    pub(crate) fn wait(
        &self,
        kernel: &Kernel,
        thread: &Arc<ThreadHandle>,
        mut timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        trace!(
            "timer_wait: uid: {} thread_id: {} name: \"{}\" next_event: {} waiting_threads: {}",
            self.uid,
            thread.uid(),
            self.name,
            state.next_event,
            state.waiters.len()
        );

        let record = WaitRecord::new(thread, WaitPayload::Tick);
        state.waiters.push(Arc::clone(&record));
        let deadline = match timeout.as_deref() {
            Some(&us) if us > 0 => Some(kernel.now_us() + u64::from(us)),
            _ => None,
        };

        loop {
            let now = kernel.now_us();
            state.refresh(now);

            let is_head = state
                .waiters
                .front()
                .is_some_and(|head| Arc::ptr_eq(head, &record));
            if state.event_set && is_head {
                state.waiters.pop();
                if state.is_pulse {
                    state.event_set = false;
                }
                // The next head re-checks on this wake.
                self.tick.notify_all();
                return Ok(());
            }

            if let Some(deadline) = deadline {
                if now >= deadline {
                    state.waiters.erase(&record);
                    if let Some(remaining) = timeout.as_deref_mut() {
                        *remaining = 0;
                    }
                    return Err(SyncError::WaitTimeout);
                }
            }

            // Sleep until whichever comes first: the caller's deadline or the
            // timer's next expiration.
            let mut until = deadline.unwrap_or(NEVER);
            if state.is_started {
                until = until.min(state.next_event);
            }
            state = if until == NEVER {
                self.tick
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner)
            } else {
                let sleep = Duration::from_micros(until.saturating_sub(kernel.now_us()));
                self.tick
                    .wait_timeout(state, sleep)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            };
        }
    }
}
