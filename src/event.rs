// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Simple events: pattern waits with an attached 64-bit user datum.
//!
//! The wait-on-event entry point serves both simple events and timers: an id
//! that is not a known simple event falls through to the timer table before
//! it is reported unknown. `set` is destructive, `pulse` restores the
//! pre-call pattern and user data once its wake scan is done, so the update
//! is visible only to the waiters it woke.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as HostMutex};

use log::{trace, warn};

use crate::attr::ObjectAttr;
use crate::error::SyncError;
use crate::kernel::{Kernel, Uid};
use crate::park::{lock, park};
use crate::queue::{WaitPayload, WaitQueue, WaitRecord};
use crate::thread::ThreadHandle;

pub(crate) struct SimpleEvent {
    uid: Uid,
    name: String,
    attr: ObjectAttr,
    state: HostMutex<SimpleEventState>,
}

struct SimpleEventState {
    pattern: u32,
    user_data: u64,
    waiters: WaitQueue,
}

impl Kernel {
    pub(crate) fn find_simple_event(&self, uid: Uid) -> Result<Arc<SimpleEvent>, SyncError> {
        self.tables()
            .simple_events
            .get(&uid)
            .cloned()
            .ok_or(SyncError::UnknownEventId)
    }

    pub fn simple_event_create(
        &self,
        thread_id: Uid,
        name: &str,
        attr: ObjectAttr,
        init_pattern: u32,
    ) -> Result<Uid, SyncError> {
        Kernel::check_name(name, attr)?;
        let uid = self.next_uid();
        trace!(
            "simple_event_create: uid: {uid} thread_id: {thread_id} name: \"{name}\" attr: {attr:?} init_pattern: {init_pattern:#b}"
        );
        let event = Arc::new(SimpleEvent {
            uid,
            name: name.to_owned(),
            attr,
            state: HostMutex::new(SimpleEventState {
                pattern: init_pattern,
                user_data: 0,
                waiters: WaitQueue::new(attr.discipline()),
            }),
        });
        self.tables().simple_events.insert(uid, event);
        Ok(uid)
    }

    /// Waits until `pattern` intersects the event's pattern. The id may name
    /// a simple event or a timer; a timer wait ignores `pattern` and delivers
    /// the next expiration instead.
    pub fn event_wait(
        &self,
        thread_id: Uid,
        event_id: Uid,
        pattern: u32,
        out_pattern: Option<&mut u32>,
        out_user_data: Option<&mut u64>,
        timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let thread = self.get_thread(thread_id)?;
        if let Ok(event) = self.find_simple_event(event_id) {
            return event.wait(&thread, pattern, out_pattern, out_user_data, timeout);
        }
        // Not an event: the id may name a timer instead.
        let timer = self
            .tables()
            .timers
            .get(&event_id)
            .cloned()
            .ok_or(SyncError::UnknownEventId)?;
        timer.wait(self, &thread, timeout)
    }

    pub fn simple_event_set(
        &self,
        thread_id: Uid,
        event_id: Uid,
        pattern: u32,
        user_data: u64,
    ) -> Result<(), SyncError> {
        let event = self.find_simple_event(event_id)?;
        trace!(
            "simple_event_set: uid: {} thread_id: {} pattern: {:#b}",
            event_id,
            thread_id,
            pattern
        );
        let mut state = lock(&event.state);
        event.apply(&mut state, pattern, user_data);
        Ok(())
    }

    /// Like `set`, except the pattern and user data revert once the woken
    /// waiters have been served.
    pub fn simple_event_pulse(
        &self,
        thread_id: Uid,
        event_id: Uid,
        pattern: u32,
        user_data: u64,
    ) -> Result<(), SyncError> {
        let event = self.find_simple_event(event_id)?;
        trace!(
            "simple_event_pulse: uid: {} thread_id: {} pattern: {:#b}",
            event_id,
            thread_id,
            pattern
        );
        let mut state = lock(&event.state);
        let saved = (state.pattern, state.user_data);
        event.apply(&mut state, pattern, user_data);
        (state.pattern, state.user_data) = saved;
        Ok(())
    }

    /// Keeps only the bits present in `pattern`. Wakes nobody.
    pub fn simple_event_clear(
        &self,
        thread_id: Uid,
        event_id: Uid,
        pattern: u32,
    ) -> Result<(), SyncError> {
        let event = self.find_simple_event(event_id)?;
        trace!(
            "simple_event_clear: uid: {} thread_id: {} pattern: {:#b}",
            event_id,
            thread_id,
            pattern
        );
        lock(&event.state).pattern &= pattern;
        Ok(())
    }

    pub fn simple_event_delete(&self, thread_id: Uid, event_id: Uid) -> Result<(), SyncError> {
        let event = self.find_simple_event(event_id)?;
        let state = lock(&event.state);
        if state.waiters.is_empty() {
            self.tables().simple_events.remove(&event_id);
        } else {
            warn!(
                "simple_event_delete: uid: {} thread_id: {} has {} waiting threads, not deleting",
                event_id,
                thread_id,
                state.waiters.len()
            );
        }
        Ok(())
    }
}

impl SimpleEvent {
    fn auto_reset(&self) -> bool {
        self.attr.contains(ObjectAttr::AUTO_RESET)
    }

    fn wait(
        &self,
        thread: &Arc<ThreadHandle>,
        pattern: u32,
        out_pattern: Option<&mut u32>,
        out_user_data: Option<&mut u64>,
        timeout: Option<&mut u32>,
    ) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        trace!(
            "event_wait: uid: {} thread_id: {} name: \"{}\" pattern: {:#b} wait_pattern: {:#b}",
            self.uid,
            thread.uid(),
            self.name,
            state.pattern,
            pattern
        );

        if state.pattern & pattern != 0 {
            let satisfied = state.pattern;
            if self.auto_reset() {
                state.pattern &= !pattern;
            }
            if let Some(out) = out_pattern {
                *out = satisfied;
            }
            if let Some(out) = out_user_data {
                *out = state.user_data;
            }
            return Ok(());
        }

        let record = WaitRecord::new(
            thread,
            WaitPayload::Event {
                pattern,
                out_pattern: 0.into(),
                out_user_data: 0.into(),
            },
        );
        let result = park(
            thread,
            &self.state,
            state,
            &record,
            |s| &mut s.waiters,
            timeout,
        );
        let WaitPayload::Event {
            out_pattern: pattern_cell,
            out_user_data: user_data_cell,
            ..
        } = &record.payload
        else {
            unreachable!()
        };
        if let Some(out) = out_pattern {
            *out = pattern_cell.load(Ordering::Acquire);
        }
        if let Some(out) = out_user_data {
            *out = user_data_cell.load(Ordering::Acquire);
        }
        result
    }

    /// Merges `pattern`/`user_data` in and wakes every waiter the new
    /// pattern satisfies, honoring auto-reset per consumed wait.
    fn apply(&self, state: &mut SimpleEventState, pattern: u32, user_data: u64) {
        state.pattern |= pattern;
        state.user_data = user_data;

        let mut at = 0;
        while at < state.waiters.len() {
            let record = match state.waiters.get(at) {
                Some(record) => Arc::clone(record),
                None => break,
            };
            let WaitPayload::Event {
                pattern: wanted,
                out_pattern,
                out_user_data,
            } = &record.payload
            else {
                unreachable!()
            };
            if state.pattern & *wanted != 0 {
                out_pattern.store(state.pattern, Ordering::Release);
                out_user_data.store(state.user_data, Ordering::Release);
                if self.auto_reset() {
                    state.pattern &= !*wanted;
                }
                state.waiters.remove_at(at);
                record.thread.make_runnable();
            } else {
                at += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn kernel_and_thread() -> (Arc<Kernel>, Uid) {
        let kernel = Arc::new(Kernel::new());
        let thread = kernel.register_thread("main", 160);
        (kernel, thread.uid())
    }

    #[test]
    fn set_is_destructive_and_carries_user_data() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .simple_event_create(tid, "ev", ObjectAttr::empty(), 0)
            .unwrap();
        kernel.simple_event_set(tid, eid, 0b1, 0xdead).unwrap();

        // Two consecutive waits both see the pattern: no auto-reset.
        for _ in 0..2 {
            let mut pattern = 0u32;
            let mut user_data = 0u64;
            kernel
                .event_wait(tid, eid, 0b1, Some(&mut pattern), Some(&mut user_data), None)
                .unwrap();
            assert_eq!(pattern, 0b1);
            assert_eq!(user_data, 0xdead);
        }
    }

    #[test]
    fn auto_reset_clears_the_matched_bits_on_consumption() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .simple_event_create(tid, "ev", ObjectAttr::AUTO_RESET, 0b11)
            .unwrap();

        let mut pattern = 0u32;
        kernel
            .event_wait(tid, eid, 0b01, Some(&mut pattern), None, None)
            .unwrap();
        assert_eq!(pattern, 0b11);

        // The matched bit is gone; the other survives.
        let mut timeout = 10_000u32;
        assert_eq!(
            kernel.event_wait(tid, eid, 0b01, None, None, Some(&mut timeout)),
            Err(SyncError::WaitTimeout)
        );
        kernel.event_wait(tid, eid, 0b10, None, None, None).unwrap();
    }

    #[test]
    fn pulse_is_visible_only_to_woken_waiters() {
        let (kernel, tid) = kernel_and_thread();
        let eid = kernel
            .simple_event_create(tid, "ev", ObjectAttr::empty(), 0)
            .unwrap();

        let waiter = kernel.register_thread("waiter", 160).uid();
        let handle = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                let mut pattern = 0u32;
                let mut user_data = 0u64;
                let result = kernel.event_wait(
                    waiter,
                    eid,
                    0b1,
                    Some(&mut pattern),
                    Some(&mut user_data),
                    None,
                );
                (result, pattern, user_data)
            })
        };
        thread::sleep(Duration::from_millis(50)); // Let it park.

        kernel.simple_event_pulse(tid, eid, 0b1, 77).unwrap();
        let (result, pattern, user_data) = handle.join().unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(pattern, 0b1);
        assert_eq!(user_data, 77);

        // The pulse left no trace behind.
        let mut timeout = 10_000u32;
        assert_eq!(
            kernel.event_wait(tid, eid, 0b1, None, None, Some(&mut timeout)),
            Err(SyncError::WaitTimeout)
        );
    }

    #[test]
    fn unknown_event_id_falls_through_both_tables() {
        let (kernel, tid) = kernel_and_thread();
        assert_eq!(
            kernel.event_wait(tid, 4242, 0b1, None, None, None),
            Err(SyncError::UnknownEventId)
        );
    }
}
