//! Poll task scheduling
//!
//! The environment never owns a thread of its own. It arms one-shot tasks on
//! a [`PollScheduler`]: wait for an fd to become readable, a timeout to
//! expire, or both, then run a callback once. [`PollQueue`] is the real
//! scheduler, a calloop event loop on a dedicated thread. [`ManualScheduler`]
//! runs tasks only when asked to, for deterministic tests.

use calloop::channel::{self, Channel, Sender};
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopHandle, LoopSignal, Mode, PostAction, RegistrationToken};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Identifies an armed task for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Why a task ran
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revents {
    pub readable: bool,
    pub error: bool,
    pub timed_out: bool,
}

type Callback = Box<dyn FnOnce(Revents) + Send>;

/// A one-shot wait on an fd and/or a timeout
pub struct PollTask {
    pub fd: Option<RawFd>,
    pub timeout: Option<Duration>,
    callback: Callback,
}

impl fmt::Debug for PollTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollTask")
            .field("fd", &self.fd)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PollTask {
    /// Run `f` when `fd` is readable, or when `timeout` expires first
    pub fn fd(
        fd: RawFd,
        timeout: Option<Duration>,
        f: impl FnOnce(Revents) + Send + 'static,
    ) -> Self {
        Self {
            fd: Some(fd),
            timeout,
            callback: Box::new(f),
        }
    }

    /// Run `f` once after `timeout`
    pub fn timer(timeout: Duration, f: impl FnOnce(Revents) + Send + 'static) -> Self {
        Self {
            fd: None,
            timeout: Some(timeout),
            callback: Box::new(f),
        }
    }

    pub fn run(self, revents: Revents) {
        (self.callback)(revents)
    }
}

/// Something that runs [`PollTask`]s
///
/// Callbacks may arm new tasks and remove others. Removing a task that has
/// already run is a no-op.
pub trait PollScheduler: Send + Sync {
    fn add_task(&self, task: PollTask) -> TaskId;
    fn remove_task(&self, id: TaskId);
}

enum Command {
    Add(TaskId, PollTask),
    Remove(TaskId),
}

/// Raw fd wrapper so calloop can poll an fd owned elsewhere
struct PolledFd(RawFd);

impl AsFd for PolledFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the task's owner keeps the fd open until the task has run or
        // been removed, which drops this source
        unsafe { BorrowedFd::borrow_raw(self.0) }
    }
}

#[derive(Clone, Copy)]
enum Fired {
    Fd,
    Timer,
}

struct Armed {
    fd_token: Option<RegistrationToken>,
    timer_token: Option<RegistrationToken>,
    callback: Option<Callback>,
}

struct LoopState {
    handle: LoopHandle<'static, LoopState>,
    tasks: HashMap<TaskId, Armed>,
}

impl LoopState {
    fn add(&mut self, id: TaskId, task: PollTask) {
        let PollTask {
            fd,
            timeout,
            callback,
        } = task;
        let mut armed = Armed {
            fd_token: None,
            timer_token: None,
            callback: Some(callback),
        };

        if let Some(fd) = fd {
            let source = Generic::new(PolledFd(fd), Interest::READ, Mode::Level);
            let inserted = self.handle.insert_source(source, move |readiness, _, state| {
                let revents = Revents {
                    readable: readiness.readable,
                    error: readiness.error,
                    timed_out: false,
                };
                state.fire(id, Fired::Fd, revents);
                Ok(PostAction::Remove)
            });
            match inserted {
                Ok(token) => armed.fd_token = Some(token),
                Err(e) => warn!(fd, error = %e.error, "Failed to watch fd"),
            }
        }

        if let Some(timeout) = timeout {
            let inserted =
                self.handle
                    .insert_source(Timer::from_duration(timeout), move |_, _, state| {
                        let revents = Revents {
                            timed_out: true,
                            ..Default::default()
                        };
                        state.fire(id, Fired::Timer, revents);
                        TimeoutAction::Drop
                    });
            match inserted {
                Ok(token) => armed.timer_token = Some(token),
                Err(e) => warn!(error = %e.error, "Failed to arm timer"),
            }
        }

        if armed.fd_token.is_none() && armed.timer_token.is_none() {
            error!(?id, "Poll task has nothing to wait on; dropped");
            return;
        }
        self.tasks.insert(id, armed);
    }

    fn fire(&mut self, id: TaskId, which: Fired, revents: Revents) {
        let Some(mut armed) = self.tasks.remove(&id) else {
            return;
        };
        // The source that fired removes itself through its return value
        let other = match which {
            Fired::Fd => armed.timer_token.take(),
            Fired::Timer => armed.fd_token.take(),
        };
        if let Some(token) = other {
            self.handle.remove(token);
        }
        if let Some(callback) = armed.callback.take() {
            callback(revents);
        }
    }

    fn remove(&mut self, id: TaskId) {
        if let Some(armed) = self.tasks.remove(&id) {
            for token in [armed.fd_token, armed.timer_token].into_iter().flatten() {
                self.handle.remove(token);
            }
        }
    }
}

struct LoopLink {
    sender: Sender<Command>,
    signal: LoopSignal,
}

/// A calloop event loop on its own thread
pub struct PollQueue {
    link: Mutex<LoopLink>,
    next_id: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl PollQueue {
    pub fn new() -> io::Result<Self> {
        let (sender, channel) = channel::channel::<Command>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<io::Result<LoopSignal>>();

        let thread = thread::Builder::new()
            .name("kms-poll".to_string())
            .spawn(move || Self::run(channel, ready_tx))?;

        let signal = ready_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poll thread exited during startup"))??;
        debug!("Poll loop started");

        Ok(Self {
            link: Mutex::new(LoopLink { sender, signal }),
            next_id: AtomicU64::new(1),
            thread: Some(thread),
        })
    }

    fn run(channel: Channel<Command>, ready: std::sync::mpsc::Sender<io::Result<LoopSignal>>) {
        let mut event_loop: EventLoop<'static, LoopState> = match EventLoop::try_new() {
            Ok(l) => l,
            Err(e) => {
                let _ = ready.send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
                return;
            }
        };
        let handle = event_loop.handle();

        let inserted = handle.insert_source(channel, |event, _, state: &mut LoopState| {
            if let channel::Event::Msg(cmd) = event {
                match cmd {
                    Command::Add(id, task) => state.add(id, task),
                    Command::Remove(id) => state.remove(id),
                }
            }
        });
        if let Err(e) = inserted {
            let _ = ready.send(Err(io::Error::new(io::ErrorKind::Other, e.error.to_string())));
            return;
        }

        let _ = ready.send(Ok(event_loop.get_signal()));
        let mut state = LoopState {
            handle,
            tasks: HashMap::new(),
        };
        if let Err(e) = event_loop.run(None::<Duration>, &mut state, |_| {}) {
            error!(error = %e, "Poll loop failed");
        }
        debug!(abandoned = state.tasks.len(), "Poll loop exited");
    }

    fn link(&self) -> MutexGuard<'_, LoopLink> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PollScheduler for PollQueue {
    fn add_task(&self, task: PollTask) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self.link().sender.send(Command::Add(id, task)).is_err() {
            warn!(?id, "Poll loop gone; task dropped");
        }
        id
    }

    fn remove_task(&self, id: TaskId) {
        let _ = self.link().sender.send(Command::Remove(id));
    }
}

impl Drop for PollQueue {
    fn drop(&mut self) {
        {
            let link = self.link();
            link.signal.stop();
            link.signal.wakeup();
        }
        if let Some(handle) = self.thread.take() {
            // The last reference may be released by a task on the loop thread
            // itself; it then exits on its own
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Scheduler that runs tasks only when told to
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    tasks: Mutex<BTreeMap<TaskId, PollTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TaskId, PollTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Armed tasks
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Armed tasks with a timeout
    pub fn pending_timers(&self) -> usize {
        self.lock().values().filter(|t| t.timeout.is_some()).count()
    }

    /// Run every task whose fd is readable right now
    pub fn run_ready(&self) -> usize {
        let armed: Vec<(TaskId, RawFd)> = self
            .lock()
            .iter()
            .filter_map(|(id, t)| t.fd.map(|fd| (*id, fd)))
            .collect();
        if armed.is_empty() {
            return 0;
        }

        let mut fds: Vec<libc::pollfd> = armed
            .iter()
            .map(|(_, fd)| libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        // SAFETY: fds is a valid array of fds.len() pollfd structs
        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
        if r < 0 {
            warn!(error = %io::Error::last_os_error(), "poll failed");
            return 0;
        }

        let ready: Vec<(PollTask, Revents)> = {
            let mut tasks = self.lock();
            armed
                .iter()
                .zip(&fds)
                .filter(|(_, p)| p.revents != 0)
                .filter_map(|((id, _), p)| {
                    let revents = Revents {
                        readable: p.revents & libc::POLLIN != 0,
                        error: p.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
                        timed_out: false,
                    };
                    tasks.remove(id).map(|t| (t, revents))
                })
                .collect()
        };
        let n = ready.len();
        for (task, revents) in ready {
            task.run(revents);
        }
        n
    }

    /// Expire every task that has a timeout, as if its time had come
    pub fn run_timeouts(&self) -> usize {
        let expired: Vec<PollTask> = {
            let mut tasks = self.lock();
            let ids: Vec<TaskId> = tasks
                .iter()
                .filter(|(_, t)| t.timeout.is_some())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| tasks.remove(id)).collect()
        };
        let n = expired.len();
        for task in expired {
            task.run(Revents {
                timed_out: true,
                ..Default::default()
            });
        }
        n
    }
}

impl PollScheduler for ManualScheduler {
    fn add_task(&self, task: PollTask) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, task);
        id
    }

    fn remove_task(&self, id: TaskId) {
        self.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc};

    fn eventfd() -> OwnedFd {
        // SAFETY: plain syscall, result checked
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0);
        // SAFETY: fresh fd we own
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    fn signal(fd: &OwnedFd) {
        let one: u64 = 1;
        // SAFETY: 8 byte write from a local to an eventfd
        let r = unsafe { libc::write(fd.as_raw_fd(), &one as *const u64 as *const libc::c_void, 8) };
        assert_eq!(r, 8);
    }

    #[test]
    fn test_manual_runs_only_ready_fds() {
        let sched = ManualScheduler::new();
        let efd = eventfd();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        sched.add_task(PollTask::fd(efd.as_raw_fd(), None, move |r| {
            assert!(r.readable);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(sched.run_ready(), 0);
        assert_eq!(sched.pending(), 1);

        signal(&efd);
        assert_eq!(sched.run_ready(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_manual_remove_and_timeout() {
        let sched = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let gone = sched.add_task(PollTask::timer(Duration::from_secs(5), move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        }));
        let h = hits.clone();
        sched.add_task(PollTask::timer(Duration::from_secs(5), move |r| {
            assert!(r.timed_out);
            h.fetch_add(1, Ordering::SeqCst);
        }));
        sched.remove_task(gone);
        assert_eq!(sched.pending_timers(), 1);
        assert_eq!(sched.run_timeouts(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_poll_queue_fd_beats_timeout() {
        let queue = PollQueue::new().unwrap();
        let efd = eventfd();
        let (tx, rx) = mpsc::channel();

        queue.add_task(PollTask::fd(
            efd.as_raw_fd(),
            Some(Duration::from_secs(10)),
            move |r| {
                let _ = tx.send(r);
            },
        ));
        signal(&efd);
        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(r.readable);
        assert!(!r.timed_out);
    }

    #[test]
    fn test_poll_queue_timer_and_removal() {
        let queue = PollQueue::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let tx2 = tx.clone();
        let removed = queue.add_task(PollTask::timer(Duration::from_millis(20), move |_| {
            let _ = tx2.send("removed");
        }));
        queue.remove_task(removed);
        queue.add_task(PollTask::timer(Duration::from_millis(40), move |r| {
            assert!(r.timed_out);
            let _ = tx.send("fired");
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fired");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
