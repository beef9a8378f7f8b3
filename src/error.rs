// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Guest-visible status codes.

use thiserror::Error;

/// Every way a synchronization call can fail, as the guest sees it.
///
/// All failures are recovered locally into one of these codes; nothing in
/// this crate treats guest misbehavior as fatal. The call-wrapper layer above
/// maps each variant onto the guest ABI's numeric error codes, which is why
/// the lightweight mutex/condvar family keeps its own variants rather than
/// sharing the heavyweight ones.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("unknown thread id")]
    UnknownThreadId,
    #[error("unknown mutex id")]
    UnknownMutexId,
    #[error("unknown lightweight mutex id")]
    UnknownLwMutexId,
    #[error("unknown condition variable id")]
    UnknownCondId,
    #[error("unknown lightweight condition variable id")]
    UnknownLwCondId,
    #[error("unknown semaphore id")]
    UnknownSemaId,
    #[error("unknown event flag id")]
    UnknownEvfId,
    #[error("unknown event id")]
    UnknownEventId,
    #[error("unknown reader/writer lock id")]
    UnknownRwLockId,
    #[error("unknown timer id")]
    UnknownTimerId,
    #[error("unknown message pipe id")]
    UnknownMsgPipeId,

    #[error("object name exceeds the maximum length")]
    UidNameTooLong,
    #[error("illegal count")]
    IllegalCount,

    #[error("recursive lock of a non-recursive mutex")]
    MutexRecursive,
    #[error("recursive lock of a non-recursive lightweight mutex")]
    LwMutexRecursive,
    #[error("mutex is owned by another thread")]
    MutexFailedToOwn,
    #[error("lightweight mutex is owned by another thread")]
    LwMutexFailedToOwn,
    #[error("unlock count exceeds the held lock count")]
    MutexUnlockUnderflow,
    #[error("unlock count exceeds the held lightweight lock count")]
    LwMutexUnlockUnderflow,

    #[error("signal would raise the semaphore above its maximum")]
    SemaOverflow,

    #[error("reader/writer lock is not held by the calling thread")]
    RwLockNotOwner,

    #[error("event flag already has a waiter")]
    EvfMultiWait,
    #[error("event flag condition not met")]
    EvfConditionNotMet,

    #[error("timer is already counting")]
    TimerAlreadyStarted,
    #[error("timer is not counting")]
    TimerNotStarted,

    #[error("wait timed out")]
    WaitTimeout,
    #[error("wait was canceled")]
    WaitCancel,
    #[error("object was deleted while waiting on it")]
    WaitDelete,
}
