//! Shared setup for the integration tests: a virtual device driven by a
//! manual scheduler

#![allow(dead_code)]

use kms_atomic::device::{VirtualConfig, VirtualDevice};
use kms_atomic::{EnvConfig, Environment, ManualScheduler};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

pub struct Rig {
    pub dev: Arc<VirtualDevice>,
    pub sched: Arc<ManualScheduler>,
    pub env: Environment,
}

pub fn rig_with(config: EnvConfig) -> Rig {
    let dev = Arc::new(VirtualDevice::new(VirtualConfig::default()).unwrap());
    let sched = Arc::new(ManualScheduler::new());
    let env = Environment::new(dev.clone(), sched.clone(), config).unwrap();
    Rig { dev, sched, env }
}

pub fn rig() -> Rig {
    rig_with(EnvConfig::default())
}

impl Rig {
    /// Complete outstanding flips and let the event task handle them
    pub fn vblank(&self) -> usize {
        let n = self.dev.complete_flips();
        self.sched.run_ready();
        n
    }
}

/// An anonymous file standing in for a dma-buf
pub fn dmabuf(size: usize) -> OwnedFd {
    // SAFETY: NUL terminated name; result checked
    let fd = unsafe { libc::memfd_create(b"test-dmabuf\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
    assert!(fd >= 0);
    // SAFETY: fresh fd we own
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: plain syscall on our own fd
    assert_eq!(unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) }, 0);
    fd
}

pub fn raw(fd: &OwnedFd) -> RawFd {
    fd.as_raw_fd()
}
