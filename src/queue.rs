//! The commit queue
//!
//! At most one atomic commit is in flight at the kernel. A commit queued
//! while another is in flight waits in the single `next` slot, and further
//! commits are merged onto it, newest values winning, so a producer faster
//! than the display never builds up a backlog.
//!
//! ```text
//!   queue()          flip done           flip done
//!  ---------> next ------------> cur ------------> last ----> dropped
//! ```
//!
//! `last` is what the display is showing: its FBs stay referenced until the
//! following flip replaces it.

use crate::atomic::{Atomic, CommitFlags};
use crate::device::FlipEvent;
use crate::poll::{PollScheduler, PollTask, TaskId};
use crate::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Where the queue is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing in flight
    Idle,
    /// One commit waiting for its flip
    Committed,
    /// One in flight and one waiting to follow it
    CommittedPending,
}

#[derive(Default)]
struct Slots {
    next: Option<Atomic>,
    cur: Option<Atomic>,
    last: Option<Atomic>,
    retries: u32,
    retry_task: Option<TaskId>,
    seq: u64,
    dead: bool,
}

impl Slots {
    fn state(&self) -> QueueState {
        // A busy commit parked for retry counts as committed
        match (self.cur.is_some(), self.next.is_some()) {
            (false, false) => QueueState::Idle,
            (true, true) => QueueState::CommittedPending,
            _ => QueueState::Committed,
        }
    }
}

pub(crate) struct CommitQueue {
    scheduler: Arc<dyn PollScheduler>,
    flags: CommitFlags,
    retry_limit: u32,
    retry_delay: Duration,
    slots: Mutex<Slots>,
    changed: Condvar,
    me: Weak<CommitQueue>,
}

impl CommitQueue {
    pub(crate) fn new(
        scheduler: Arc<dyn PollScheduler>,
        modeset: bool,
        retry_limit: u32,
        retry_delay: Duration,
    ) -> Arc<Self> {
        let mut flags = CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT;
        if modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        Arc::new_cyclic(|me| Self {
            scheduler,
            flags,
            retry_limit,
            retry_delay,
            slots: Mutex::new(Slots::default()),
            changed: Condvar::new(),
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> QueueState {
        self.lock().state()
    }

    /// Submit now if nothing is in flight, otherwise wait in `next`
    pub(crate) fn queue(&self, atomic: Atomic) -> Result<()> {
        if atomic.is_empty() {
            debug!("Empty commit not queued");
            return Ok(());
        }

        let mut rejected = None;
        let mut displaced = None;
        let result = {
            let mut s = self.lock();
            if s.dead {
                Err(Error::DeviceLost("commit queue stopped".to_string()))
            } else if let Some(next) = s.next.as_mut() {
                debug!("Merging commit into pending one");
                displaced = Some(next.merge_displaced(atomic));
                Ok(())
            } else if s.cur.is_some() {
                s.next = Some(atomic);
                Ok(())
            } else {
                match self.try_submit(&mut s, atomic) {
                    Ok(()) => Ok(()),
                    Err((e, a)) => {
                        rejected = Some(a);
                        Err(e)
                    }
                }
            }
        };
        // Anything released here may run pool hooks and RMFB
        drop(displaced);
        drop(rejected);
        result
    }

    /// Submit `atomic`; EBUSY parks it in `next` and arms a retry
    fn try_submit(&self, s: &mut Slots, atomic: Atomic) -> std::result::Result<(), (Error, Atomic)> {
        s.seq += 1;
        match atomic.submit(self.flags, s.seq) {
            Ok(()) => {
                debug!(seq = s.seq, "Commit submitted");
                s.cur = Some(atomic);
                s.retries = 0;
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && s.retries < self.retry_limit => {
                s.retries += 1;
                debug!(attempt = s.retries, "Commit busy, retrying");
                s.next = Some(atomic);
                self.arm_retry(s);
                Ok(())
            }
            Err(e) => {
                s.retries = 0;
                warn!(seq = s.seq, error = %e, "Commit rejected");
                atomic.dump();
                Err((Error::commit(e), atomic))
            }
        }
    }

    fn arm_retry(&self, s: &mut Slots) {
        if s.retry_task.is_some() {
            return;
        }
        let me = self.me.clone();
        let task = PollTask::timer(self.retry_delay, move |_| {
            if let Some(q) = me.upgrade() {
                q.retry();
            }
        });
        s.retry_task = Some(self.scheduler.add_task(task));
    }

    fn retry(&self) {
        let mut rejected = None;
        {
            let mut s = self.lock();
            s.retry_task = None;
            // With a commit in flight its flip submits `next`
            if s.dead || s.cur.is_some() {
                return;
            }
            if let Some(next) = s.next.take() {
                if let Err((e, a)) = self.try_submit(&mut s, next) {
                    error!(error = %e, "Retried commit failed; dropping it");
                    rejected = Some(a);
                }
            }
            self.changed.notify_all();
        }
        drop(rejected);
    }

    /// A page flip completed: retire `last`, promote `cur`, submit `next`
    pub(crate) fn on_flip(&self, ev: &FlipEvent) {
        let mut retired = Vec::new();
        {
            let mut s = self.lock();
            if s.dead {
                return;
            }
            if s.cur.is_none() {
                debug!(seq = ev.user_data, "Flip with nothing in flight");
                return;
            }
            debug!(seq = ev.user_data, sequence = ev.sequence, "Flip done");
            retired.extend(s.last.take());
            s.last = s.cur.take();
            if let Some(next) = s.next.take() {
                if let Err((e, a)) = self.try_submit(&mut s, next) {
                    error!(error = %e, "Pending commit failed; dropping it");
                    retired.push(a);
                }
            }
            self.changed.notify_all();
        }
        drop(retired);
    }

    /// Block until nothing is waiting to be submitted
    pub(crate) fn wait_pending(&self) -> Result<()> {
        let mut s = self.lock();
        while !s.dead && s.next.is_some() {
            s = self
                .changed
                .wait(s)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if s.dead {
            return Err(Error::DeviceLost("commit queue stopped".to_string()));
        }
        Ok(())
    }

    /// Stop for good, dropping every held commit
    pub(crate) fn kill(&self) {
        let (held, retry) = {
            let mut s = self.lock();
            s.dead = true;
            let held = [s.next.take(), s.cur.take(), s.last.take()];
            self.changed.notify_all();
            (held, s.retry_task.take())
        };
        if let Some(id) = retry {
            self.scheduler.remove_task(id);
        }
        let n = held.iter().flatten().count();
        drop(held);
        debug!(dropped = n, "Commit queue stopped");
    }
}
