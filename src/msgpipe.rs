// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Message pipes: bounded byte rings with full/partial transfer semantics.
//!
//! Senders and receivers keep independent wait queues. A transfer carries a
//! minimum acceptable size — one byte in ASAP mode, everything in FULL mode —
//! and whoever completes a transfer scans the opposite queue from the front
//! for the first record whose minimum has become satisfiable, services
//! exactly that record through its wait record, and stops. Deletion is the
//! one forced teardown in the kernel: every queued thread is woken with a
//! deletion status and the deleter busy-waits for them to drain before the
//! object disappears.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as HostMutex};

use log::trace;
use ringbuf::{
    traits::{Consumer as _, Observer as _, Producer as _, Split as _},
    HeapCons, HeapProd, HeapRb,
};

use crate::attr::{ObjectAttr, PipeMode};
use crate::error::SyncError;
use crate::kernel::{Kernel, Uid};
use crate::park::{lock, park};
use crate::queue::{Discipline, WaitPayload, WaitQueue, WaitRecord};
use crate::thread::ThreadHandle;

pub(crate) struct MsgPipe {
    uid: Uid,
    name: String,
    state: HostMutex<PipeState>,
    /// Waiters still inside a woken `send`/`recv` call during a forced
    /// delete; the deleter spins until this drains to zero.
    remaining_threads: AtomicU32,
}

struct PipeState {
    prod: HeapProd<u8>,
    cons: HeapCons<u8>,
    senders: WaitQueue,
    receivers: WaitQueue,
    being_deleted: bool,
}

fn min_size(mode: PipeMode, len: usize) -> usize {
    if mode.contains(PipeMode::FULL) {
        len
    } else {
        1
    }
}

impl Kernel {
    pub(crate) fn find_msgpipe(&self, uid: Uid) -> Result<Arc<MsgPipe>, SyncError> {
        self.tables()
            .msgpipes
            .get(&uid)
            .cloned()
            .ok_or(SyncError::UnknownMsgPipeId)
    }

    pub fn msgpipe_create(
        &self,
        thread_id: Uid,
        name: &str,
        attr: ObjectAttr,
        buf_size: usize,
    ) -> Result<Uid, SyncError> {
        Kernel::check_name(name, attr)?;
        if buf_size == 0 {
            return Err(SyncError::IllegalCount);
        }

        let uid = self.next_uid();
        trace!(
            "msgpipe_create: uid: {uid} thread_id: {thread_id} name: \"{name}\" attr: {attr:?} buf_size: {buf_size}"
        );
        let (prod, cons) = HeapRb::<u8>::new(buf_size).split();
        let msgpipe = Arc::new(MsgPipe {
            uid,
            name: name.to_owned(),
            state: HostMutex::new(PipeState {
                prod,
                cons,
                // Receivers honor the priority attribute; senders always
                // queue in arrival order.
                senders: WaitQueue::new(Discipline::Fifo),
                receivers: WaitQueue::new(attr.discipline()),
                being_deleted: false,
            }),
            remaining_threads: AtomicU32::new(0),
        });
        self.tables().msgpipes.insert(uid, msgpipe);
        Ok(uid)
    }

    pub fn msgpipe_find(&self, name: &str) -> Result<Uid, SyncError> {
        let tables = self.tables();
        tables
            .msgpipes
            .iter()
            .find(|(_, pipe)| pipe.name == name)
            .map(|(uid, _)| *uid)
            .ok_or(SyncError::UnknownMsgPipeId)
    }

    /// Writes `data` into the pipe. Returns the number of bytes delivered:
    /// everything under FULL mode, at least one byte under ASAP, and zero
    /// when DONT_WAIT found no room.
    pub fn msgpipe_send(
        &self,
        thread_id: Uid,
        pipe_id: Uid,
        mode: PipeMode,
        data: &[u8],
        timeout: Option<&mut u32>,
    ) -> Result<usize, SyncError> {
        let pipe = self.find_msgpipe(pipe_id)?;
        let thread = self.get_thread(thread_id)?;
        pipe.send(&thread, mode, data, timeout)
    }

    /// Reads into `buf` under the same mode rules as
    /// [`msgpipe_send`](Self::msgpipe_send).
    pub fn msgpipe_recv(
        &self,
        thread_id: Uid,
        pipe_id: Uid,
        mode: PipeMode,
        buf: &mut [u8],
        timeout: Option<&mut u32>,
    ) -> Result<usize, SyncError> {
        let pipe = self.find_msgpipe(pipe_id)?;
        let thread = self.get_thread(thread_id)?;
        pipe.recv(&thread, mode, buf, timeout)
    }

    /// Deletes the pipe even while threads wait on it: every queued thread is
    /// woken with [`SyncError::WaitDelete`], and the call spins until the
    /// last of them has left its `send`/`recv` frame before the object is
    /// erased. Deletion is rare and the woken threads exit promptly, so the
    /// busy-wait stays short.
    pub fn msgpipe_delete(&self, thread_id: Uid, pipe_id: Uid) -> Result<(), SyncError> {
        let pipe = self.find_msgpipe(pipe_id)?;
        trace!("msgpipe_delete: uid: {pipe_id} thread_id: {thread_id}");

        let mut state = lock(&pipe.state);
        if state.being_deleted {
            return Err(SyncError::UnknownMsgPipeId);
        }
        let waiting = state.senders.len() + state.receivers.len();
        if waiting > 0 {
            state.being_deleted = true;
            pipe.remaining_threads
                .store(waiting as u32, Ordering::Release);
            for record in state.senders.drain() {
                record.mark_deleted();
                record.thread.make_runnable();
            }
            for record in state.receivers.drain() {
                record.mark_deleted();
                record.thread.make_runnable();
            }
            drop(state);

            while pipe.remaining_threads.load(Ordering::Acquire) != 0 {
                std::thread::yield_now();
            }
        } else {
            drop(state);
        }

        self.tables().msgpipes.remove(&pipe_id);
        Ok(())
    }
}

impl MsgPipe {
    fn send(
        &self,
        thread: &Arc<ThreadHandle>,
        mode: PipeMode,
        data: &[u8],
        timeout: Option<&mut u32>,
    ) -> Result<usize, SyncError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = lock(&self.state);
        if state.being_deleted {
            return Err(SyncError::UnknownMsgPipeId);
        }
        trace!(
            "msgpipe_send: uid: {} thread_id: {} name: \"{}\" mode: {:?} size: {} free: {}",
            self.uid,
            thread.uid(),
            self.name,
            mode,
            data.len(),
            state.prod.vacant_len()
        );

        let min = min_size(mode, data.len());
        if state.prod.vacant_len() >= min {
            let pushed = state.prod.push_slice(data);
            self.service_receivers(&mut state);
            return Ok(pushed);
        }
        if mode.contains(PipeMode::DONT_WAIT) {
            return Ok(0);
        }

        let record = WaitRecord::new(
            thread,
            WaitPayload::PipeSend {
                data: HostMutex::new(data.to_vec()),
                min,
                transferred: 0.into(),
            },
        );
        match park(
            thread,
            &self.state,
            state,
            &record,
            |s| &mut s.senders,
            timeout,
        ) {
            Ok(()) => {
                let WaitPayload::PipeSend { transferred, .. } = &record.payload else {
                    unreachable!()
                };
                Ok(transferred.load(Ordering::Acquire))
            }
            Err(SyncError::WaitDelete) => {
                self.remaining_threads.fetch_sub(1, Ordering::AcqRel);
                Err(SyncError::WaitDelete)
            }
            Err(error) => Err(error),
        }
    }

    fn recv(
        &self,
        thread: &Arc<ThreadHandle>,
        mode: PipeMode,
        buf: &mut [u8],
        timeout: Option<&mut u32>,
    ) -> Result<usize, SyncError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = lock(&self.state);
        if state.being_deleted {
            return Err(SyncError::UnknownMsgPipeId);
        }
        trace!(
            "msgpipe_recv: uid: {} thread_id: {} name: \"{}\" mode: {:?} size: {} available: {}",
            self.uid,
            thread.uid(),
            self.name,
            mode,
            buf.len(),
            state.cons.occupied_len()
        );

        let min = min_size(mode, buf.len());
        if state.cons.occupied_len() >= min {
            let popped = state.cons.pop_slice(buf);
            self.service_senders(&mut state);
            return Ok(popped);
        }
        if mode.contains(PipeMode::DONT_WAIT) {
            return Ok(0);
        }

        let record = WaitRecord::new(
            thread,
            WaitPayload::PipeRecv {
                buf: HostMutex::new(vec![0u8; buf.len()]),
                min,
                transferred: 0.into(),
            },
        );
        match park(
            thread,
            &self.state,
            state,
            &record,
            |s| &mut s.receivers,
            timeout,
        ) {
            Ok(()) => {
                let WaitPayload::PipeRecv {
                    buf: scratch,
                    transferred,
                    ..
                } = &record.payload
                else {
                    unreachable!()
                };
                let n = transferred.load(Ordering::Acquire);
                buf[..n].copy_from_slice(&lock(scratch)[..n]);
                Ok(n)
            }
            Err(SyncError::WaitDelete) => {
                self.remaining_threads.fetch_sub(1, Ordering::AcqRel);
                Err(SyncError::WaitDelete)
            }
            Err(error) => Err(error),
        }
    }

    /// Serves the first queued receiver whose minimum is now available, front
    /// to back, and stops there. Its completion frees space, so the sender
    /// queue gets the same one-record scan in turn.
    fn service_receivers(&self, state: &mut PipeState) {
        let available = state.cons.occupied_len();
        let mut chosen = None;
        for at in 0.. {
            let Some(record) = state.receivers.get(at) else {
                break;
            };
            let WaitPayload::PipeRecv { min, .. } = &record.payload else {
                unreachable!()
            };
            if *min <= available {
                chosen = Some(at);
                break;
            }
        }
        let Some(at) = chosen else { return };
        let Some(record) = state.receivers.remove_at(at) else {
            return;
        };

        let WaitPayload::PipeRecv {
            buf, transferred, ..
        } = &record.payload
        else {
            unreachable!()
        };
        let n = state.cons.pop_slice(&mut lock(buf)[..]);
        transferred.store(n, Ordering::Release);
        record.thread.make_runnable();

        self.service_senders(state);
    }

    /// Mirror image of [`Self::service_receivers`] for queued senders.
    fn service_senders(&self, state: &mut PipeState) {
        let free = state.prod.vacant_len();
        let mut chosen = None;
        for at in 0.. {
            let Some(record) = state.senders.get(at) else {
                break;
            };
            let WaitPayload::PipeSend { min, .. } = &record.payload else {
                unreachable!()
            };
            if *min <= free {
                chosen = Some(at);
                break;
            }
        }
        let Some(at) = chosen else { return };
        let Some(record) = state.senders.remove_at(at) else {
            return;
        };

        let WaitPayload::PipeSend {
            data, transferred, ..
        } = &record.payload
        else {
            unreachable!()
        };
        let n = state.prod.push_slice(&lock(data)[..]);
        transferred.store(n, Ordering::Release);
        record.thread.make_runnable();

        self.service_receivers(state);
    }
}
