// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The shared go-to-sleep protocol.
//!
//! Every blocking primitive parks the same way: register a wait record in the
//! object's queue, flip the thread's scheduler status to waiting, drop the
//! object lock, and block on the thread's own condition variable until a
//! waker flips the status back. Only the wake predicate a granting thread
//! evaluates and the record fields it fills in differ per primitive.

use std::sync::{Arc, Mutex as HostMutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::SyncError;
use crate::queue::{WaitQueue, WaitRecord};
use crate::thread::{ThreadHandle, ThreadStatus};

/// Poison-tolerant lock acquisition. A panicking guest thread must not wedge
/// every other thread parked on the same object.
pub(crate) fn lock<T>(mutex: &HostMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parks the calling thread on `object` until a waker grants the wait.
///
/// `record` is pushed into the queue selected by `queue` while `guard` is
/// still held; the guard is then released for the duration of the sleep.
/// `timeout` is in/out microseconds — a present-but-zero value waits
/// unconditionally, and a genuine expiry writes 0 back as the remaining time.
///
/// On expiry the thread forces itself runnable and removes its own record.
/// If the record is already gone a grant won the race against the expiry, and
/// the wait reports success: whatever the waker transferred (ownership,
/// counts, bytes) belongs to this thread now. A record still present but
/// marked canceled or deleted surfaces as [`SyncError::WaitCancel`] /
/// [`SyncError::WaitDelete`] instead of success.
pub(crate) fn park<T>(
    thread: &Arc<ThreadHandle>,
    object: &HostMutex<T>,
    mut guard: MutexGuard<'_, T>,
    record: &Arc<WaitRecord>,
    queue: fn(&mut T) -> &mut WaitQueue,
    timeout: Option<&mut u32>,
) -> Result<(), SyncError> {
    queue(&mut guard).push(Arc::clone(record));

    let mut status = lock(&thread.status);
    debug_assert_eq!(*status, ThreadStatus::Run);
    *status = ThreadStatus::Wait;
    drop(guard);

    match timeout {
        Some(timeout) if *timeout > 0 => {
            let duration = Duration::from_micros(u64::from(*timeout));
            let (mut status, result) = thread
                .status_cond
                .wait_timeout_while(status, duration, |status| *status != ThreadStatus::Run)
                .unwrap_or_else(PoisonError::into_inner);
            if result.timed_out() {
                *timeout = 0;
                *status = ThreadStatus::Run;
                drop(status);

                let mut guard = lock(object);
                if queue(&mut guard).erase(record) {
                    return Err(SyncError::WaitTimeout);
                }
                // The record is gone: a grant landed between the expiry and
                // the re-lock. Fall through and report it.
            }
        }
        _ => {
            let _status = thread
                .status_cond
                .wait_while(status, |status| *status != ThreadStatus::Run)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    match record.interruption() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
