// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # guestsync
//!
//! > The guest-thread synchronization kernel of a hosted hardware emulator.
//!
//! Guest programs expect the blocking and waking semantics of their original
//! real-time OS: FIFO or priority wake order chosen per object at creation,
//! recursive lock counting, head-of-line semaphore distribution, bounded
//! partial-read message pipes, periodic timer ticks delivered to exactly one
//! waiter. The host toolchain provides none of this directly, so this crate
//! composes `std::sync` mutexes and condition variables into the
//! guest-visible state machines.
//!
//! Every blocking primitive is built from the same two leaves: a per-object
//! wait queue of wait records, and a shared park protocol that puts the calling host thread to sleep on its own
//! per-thread condition variable until another thread explicitly grants the
//! wait. Primitives differ only in their state and in the predicate their
//! wakers evaluate.
//!
//! Entry points live on [`Kernel`], keyed by the unique ids its object table
//! hands out; guest call wrappers translate the returned [`SyncError`] codes
//! to the guest ABI.

mod attr;
mod condvar;
mod error;
mod event;
mod eventflag;
mod kernel;
mod msgpipe;
mod mutex;
mod park;
mod queue;
mod rwlock;
mod semaphore;
mod thread;
mod timer;

pub use attr::{EvfWaitMode, ObjectAttr, PipeMode};
pub use condvar::SignalTarget;
pub use error::SyncError;
pub use kernel::{Kernel, Uid, Weight, MAX_NAME_LEN};
pub use thread::{ThreadHandle, ThreadStatus};
