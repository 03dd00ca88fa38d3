//! Blocking plumbing for the pooled worker's wait loop: the wake latch, the
//! supervisor-health monitor, pending-interrupt flags, and the wait set that
//! multiplexes them with the control channel.

use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    libc,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    unistd::pipe2,
};

use crate::error::Result;

bitflags::bitflags! {
    /// Which wait-set channels fired during one wait.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct Readiness: u8 {
        /// The control channel is readable (handoff or end-of-stream).
        const HANDOFF = 1 << 0;
        /// The local wake latch was set.
        const LATCH = 1 << 1;
        /// The supervisor-health monitor reports the supervisor gone.
        const SUPERVISOR_GONE = 1 << 2;
    }
}

/// A self-pipe wake latch.
///
/// `set` is async-signal-safe (a single `write` on a non-blocking pipe), so
/// the server's signal handlers can wake the worker out of its wait loop
/// after flagging a [`PendingInterrupts`] field.
#[derive(Debug)]
pub struct WakeLatch {
    read: OwnedFd,
    write: OwnedFd,
}

impl WakeLatch {
    /// Creates the latch pipe; both ends are non-blocking.
    pub fn new() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self { read, write })
    }

    /// Sets the latch, waking any waiter. Safe to call from a signal
    /// handler. A full pipe means a wake is already pending, which is as
    /// good as another one.
    pub fn set(&self) {
        let byte = [1u8];
        // Errors are deliberately ignored: EAGAIN means a pending wake.
        unsafe {
            libc::write(
                self.write.as_raw_fd(),
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
    }

    /// Clears any pending wakes. Called once per wakeup, before the pending
    /// flags are examined, so no set is lost between check and sleep.
    pub fn clear(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                let err = io::Error::last_os_error();
                if n < 0 && err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return;
            }
        }
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

/// Supervisor-side end of the supervisor-health monitor. Created before
/// forking and simply kept alive; the kernel closes it when the supervisor
/// exits, for any reason.
#[derive(Debug)]
pub struct DeathHandle {
    _write: OwnedFd,
}

/// Worker-side end of the supervisor-health monitor.
#[derive(Debug)]
pub struct DeathWatch {
    read: OwnedFd,
}

impl DeathWatch {
    /// Creates the monitor pipe, returning `(supervisor_handle, watch)`.
    /// The supervisor holds the handle for its whole lifetime; every worker
    /// inherits the watch.
    pub fn pair() -> Result<(DeathHandle, DeathWatch)> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok((DeathHandle { _write: write }, DeathWatch { read }))
    }

    /// Whether the supervisor process is still alive.
    pub fn supervisor_alive(&self) -> bool {
        let mut buf = [0u8; 1];
        let n = unsafe {
            libc::read(
                self.read.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                1,
            )
        };
        // Nothing is ever written: EAGAIN means the write end is still open.
        n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

/// Interrupt flags set by the server's signal handlers and consumed at the
/// wait loop's wake points. There is no preemptive cancellation: a flag takes
/// effect at the next wakeup, and the 10-second wait timeout bounds how long
/// that can take.
#[derive(Debug, Default)]
pub struct PendingInterrupts {
    shutdown: AtomicBool,
    reload: AtomicBool,
    barrier: AtomicBool,
    log_memory: AtomicBool,
}

impl PendingInterrupts {
    /// Flags a shutdown request. Sticky: once set, the worker exits at its
    /// next wake point.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Whether shutdown has been requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Flags a configuration-reload request.
    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Release);
    }

    pub(crate) fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::AcqRel)
    }

    /// Flags a pending global barrier.
    pub fn request_barrier(&self) {
        self.barrier.store(true, Ordering::Release);
    }

    pub(crate) fn take_barrier(&self) -> bool {
        self.barrier.swap(false, Ordering::AcqRel)
    }

    /// Flags a memory-context log request.
    pub fn request_log_memory(&self) {
        self.log_memory.store(true, Ordering::Release);
    }

    pub(crate) fn take_log_memory(&self) -> bool {
        self.log_memory.swap(false, Ordering::AcqRel)
    }
}

/// The pooled worker's wait set: control channel, wake latch, supervisor
/// monitor.
pub(crate) struct WaitSet<'a> {
    pub(crate) channel: BorrowedFd<'a>,
    pub(crate) latch: &'a WakeLatch,
    pub(crate) death: &'a DeathWatch,
}

impl WaitSet<'_> {
    /// Blocks until any channel fires or `timeout` elapses. An empty
    /// readiness set means timeout (or a signal), after which the caller
    /// rechecks its pending flags.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<Readiness> {
        let interest = PollFlags::POLLIN;
        let mut fds = [
            PollFd::new(self.channel, interest),
            PollFd::new(self.latch.fd(), interest),
            PollFd::new(self.death.fd(), interest),
        ];
        let timeout = PollTimeout::from(u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX));

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            // A signal interrupted the wait; treat it like a timeout so the
            // caller consumes whatever flags the handler set.
            Err(Errno::EINTR) => return Ok(Readiness::empty()),
            Err(err) => return Err(err.into()),
        }

        let fired = |fd: &PollFd<'_>| {
            fd.revents().is_some_and(|revents| {
                revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            })
        };

        let mut readiness = Readiness::empty();
        if fired(&fds[0]) {
            readiness |= Readiness::HANDOFF;
        }
        if fired(&fds[1]) {
            readiness |= Readiness::LATCH;
        }
        if fired(&fds[2]) {
            readiness |= Readiness::SUPERVISOR_GONE;
        }
        Ok(readiness)
    }
}

#[cfg(test)]
mod test {
    use std::{os::fd::AsFd, time::Duration};

    use pretty_assertions::assert_eq;

    use super::{DeathWatch, PendingInterrupts, Readiness, WaitSet, WakeLatch};
    use crate::channel;

    const SHORT: Duration = Duration::from_millis(20);

    fn wait_set<'a>(
        channel: &'a std::os::fd::OwnedFd,
        latch: &'a WakeLatch,
        death: &'a DeathWatch,
    ) -> WaitSet<'a> {
        WaitSet {
            channel: channel.as_fd(),
            latch,
            death,
        }
    }

    #[test]
    fn latch_wakes_the_wait_and_clears() {
        let (_supervisor_end, worker_end) = channel::pair().unwrap();
        let (_handle, death) = DeathWatch::pair().unwrap();
        let latch = WakeLatch::new().unwrap();

        latch.set();
        latch.set();
        let readiness = wait_set(&worker_end, &latch, &death).wait(SHORT).unwrap();
        assert_eq!(readiness, Readiness::LATCH);

        latch.clear();
        let readiness = wait_set(&worker_end, &latch, &death).wait(SHORT).unwrap();
        assert_eq!(readiness, Readiness::empty());
    }

    #[test]
    fn supervisor_exit_is_observed() {
        let (_supervisor_end, worker_end) = channel::pair().unwrap();
        let (handle, death) = DeathWatch::pair().unwrap();
        let latch = WakeLatch::new().unwrap();

        assert!(death.supervisor_alive());
        drop(handle);
        assert!(!death.supervisor_alive());
        let readiness = wait_set(&worker_end, &latch, &death).wait(SHORT).unwrap();
        assert_eq!(readiness, Readiness::SUPERVISOR_GONE);
    }

    #[test]
    fn interrupt_flags_are_taken_once() {
        let interrupts = PendingInterrupts::default();
        assert!(!interrupts.take_reload());

        interrupts.request_reload();
        assert!(interrupts.take_reload());
        assert!(!interrupts.take_reload());

        interrupts.request_shutdown();
        assert!(interrupts.shutdown_requested());
        assert!(interrupts.shutdown_requested());
    }
}
