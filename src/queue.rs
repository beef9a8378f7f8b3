// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Wait queues and the records they hold.
//!
//! Each synchronization object owns one queue (message pipes own two) of
//! pending waits. A record is shared between the queue and the parked thread:
//! wakers fill in its output cells and flip the thread runnable under the
//! object's lock, the sleeper reads them after the wake. The ordering
//! discipline is fixed when the object is created.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as HostMutex};

use crate::attr::EvfWaitMode;
use crate::error::SyncError;
use crate::kernel::Uid;
use crate::thread::ThreadHandle;

/// Queue ordering discipline, chosen per object at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Discipline {
    /// Insertion order.
    Fifo,
    /// Lower priority value first; ties keep insertion order.
    Priority,
}

/// What a parked thread is waiting for, and where grant results land.
///
/// Output cells are atomics: a waker writes them under the object's lock
/// before flipping the thread runnable, and only the sleeper reads them after
/// the wake, so `Relaxed` ordering would do — the status lock already orders
/// the handoff — but `Release`/`Acquire` keeps the intent visible.
pub(crate) enum WaitPayload {
    /// Mutex: the lock count to grant on ownership transfer.
    Lock { count: i32 },
    /// Semaphore: the count to subtract when granted.
    Need { count: i32 },
    /// Condition variable: nothing beyond the wake itself.
    Sleep,
    /// Reader/writer lock: whether exclusive ownership was requested.
    Excl { exclusive: bool },
    /// Event flag: requested bits, match/clear mode, satisfied-pattern cell.
    Flag {
        pattern: u32,
        mode: EvfWaitMode,
        out: AtomicU32,
    },
    /// Simple event: requested bits plus pattern/user-data result cells.
    Event {
        pattern: u32,
        out_pattern: AtomicU32,
        out_user_data: AtomicU64,
    },
    /// Message pipe send: bytes still to deliver and how many must move at
    /// once for the wait to complete.
    PipeSend {
        data: HostMutex<Vec<u8>>,
        min: usize,
        transferred: AtomicUsize,
    },
    /// Message pipe receive: destination scratch buffer and the minimum
    /// acceptable transfer.
    PipeRecv {
        buf: HostMutex<Vec<u8>>,
        min: usize,
        transferred: AtomicUsize,
    },
    /// Timer tick: delivery is positional (queue head), no payload.
    Tick,
}

const INTR_NONE: u8 = 0;
const INTR_CANCELED: u8 = 1;
const INTR_DELETED: u8 = 2;

/// One pending wait.
pub(crate) struct WaitRecord {
    pub(crate) thread: Arc<ThreadHandle>,
    pub(crate) priority: i32,
    pub(crate) payload: WaitPayload,
    /// Written by cancel/forced-delete paths while the record is queued,
    /// checked by the sleeper at wake time.
    interrupt: AtomicU8,
}

impl WaitRecord {
    pub(crate) fn new(thread: &Arc<ThreadHandle>, payload: WaitPayload) -> Arc<Self> {
        Arc::new(Self {
            thread: Arc::clone(thread),
            priority: thread.priority(),
            payload,
            interrupt: AtomicU8::new(INTR_NONE),
        })
    }

    pub(crate) fn cancel(&self) {
        self.interrupt.store(INTR_CANCELED, Ordering::Release);
    }

    pub(crate) fn mark_deleted(&self) {
        self.interrupt.store(INTR_DELETED, Ordering::Release);
    }

    /// The status code a canceled or drained waiter reports instead of
    /// success.
    pub(crate) fn interruption(&self) -> Option<SyncError> {
        match self.interrupt.load(Ordering::Acquire) {
            INTR_CANCELED => Some(SyncError::WaitCancel),
            INTR_DELETED => Some(SyncError::WaitDelete),
            _ => None,
        }
    }
}

/// The ordered set of pending waits for one object.
pub(crate) struct WaitQueue {
    discipline: Discipline,
    entries: VecDeque<Arc<WaitRecord>>,
}

impl WaitQueue {
    pub(crate) fn new(discipline: Discipline) -> Self {
        Self {
            discipline,
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, record: Arc<WaitRecord>) {
        match self.discipline {
            Discipline::Fifo => self.entries.push_back(record),
            Discipline::Priority => {
                // First slot whose priority is strictly worse keeps ties in
                // arrival order.
                let at = self
                    .entries
                    .iter()
                    .position(|e| e.priority > record.priority)
                    .unwrap_or(self.entries.len());
                self.entries.insert(at, record);
            }
        }
    }

    pub(crate) fn front(&self) -> Option<&Arc<WaitRecord>> {
        self.entries.front()
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<WaitRecord>> {
        self.entries.pop_front()
    }

    /// Removes the given record by identity. Returns `false` when a grant
    /// (or a drain) already took it out of the queue.
    pub(crate) fn erase(&mut self, record: &Arc<WaitRecord>) -> bool {
        match self.entries.iter().position(|e| Arc::ptr_eq(e, record)) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    pub(crate) fn find_thread(&self, uid: Uid) -> Option<usize> {
        self.entries.iter().position(|e| e.thread.uid() == uid)
    }

    pub(crate) fn get(&self, at: usize) -> Option<&Arc<WaitRecord>> {
        self.entries.get(at)
    }

    pub(crate) fn remove_at(&mut self, at: usize) -> Option<Arc<WaitRecord>> {
        self.entries.remove(at)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Arc<WaitRecord>> + '_ {
        self.entries.drain(..)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
