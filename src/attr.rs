// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Creation attributes and per-call mode bits.

use bitflags::bitflags;

use crate::queue::Discipline;

bitflags! {
    /// Object creation attributes, shared by every primitive kind.
    ///
    /// Unknown bits are accepted and ignored, as the guest kernel does.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectAttr: u32 {
        /// The owner may re-lock a mutex / re-write-lock an rwlock it holds.
        const RECURSIVE = 0x0000_0002;
        /// Creation fails when the supplied name exceeds [`MAX_NAME_LEN`].
        ///
        /// [`MAX_NAME_LEN`]: crate::MAX_NAME_LEN
        const NAME_REQUIRED = 0x0000_0080;
        /// A consumed simple-event wait clears the matched pattern bits.
        const AUTO_RESET = 0x0000_0100;
        /// More than one thread may wait on an event flag at a time.
        const MULTI_WAIT = 0x0000_1000;
        /// Waiters queue in priority order (lower value first) instead of
        /// arrival order.
        const PRIORITY_QUEUE = 0x0000_2000;
    }
}

impl ObjectAttr {
    pub(crate) fn discipline(self) -> Discipline {
        if self.contains(ObjectAttr::PRIORITY_QUEUE) {
            Discipline::Priority
        } else {
            Discipline::Fifo
        }
    }
}

bitflags! {
    /// How an event-flag wait matches and what it clears on satisfaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvfWaitMode: u32 {
        /// Satisfied when any requested bit is set. Without this bit the
        /// wait requires every requested bit (AND match).
        const OR = 0x0000_0001;
        /// Clear the whole flag word on satisfaction.
        const CLEAR_ALL = 0x0000_0002;
        /// Clear only the requested bits on satisfaction.
        const CLEAR_MATCHED = 0x0000_0004;
    }
}

bitflags! {
    /// Message pipe transfer modes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeMode: u32 {
        /// All-or-nothing transfer. Without this bit a transfer completes as
        /// soon as at least one byte can move (ASAP).
        const FULL = 0x0000_0001;
        /// Fail fast instead of parking when the transfer cannot proceed.
        const DONT_WAIT = 0x0000_0010;
    }
}
