//! Buffer objects: kernel GEM handles with shared ownership
//!
//! Imported dma-bufs are de-duplicated per device. The kernel hands back the
//! same GEM handle every time the same dma-buf is imported, and a single
//! `GEM_CLOSE` drops it no matter how many times it was imported, so two
//! independent owners of one handle would close it under each other. The
//! table below makes sure only one [`BufferObject`] exists per handle.
//!
//! Lookup, insert and removal all happen with the table locked, including
//! the `PRIME_FD_TO_HANDLE` and `GEM_CLOSE` ioctls themselves.

use crate::device::DumbBuffer;
use crate::env::{DeviceCore, Environment};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, warn};

/// Handle to BO map for one device
#[derive(Default)]
pub(crate) struct BoTable {
    map: Mutex<HashMap<u32, Weak<BoInner>>>,
}

impl BoTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Weak<BoInner>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live imported BOs
    pub(crate) fn len(&self) -> usize {
        self.lock().values().filter(|w| w.strong_count() > 0).count()
    }
}

/// Where a BO's memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoKind {
    /// Allocated by the device for CPU access
    Dumb,
    /// Imported from a dma-buf fd
    Imported,
}

struct BoInner {
    core: Arc<DeviceCore>,
    handle: u32,
    kind: BoKind,
    dumb: Option<DumbBuffer>,
}

impl Drop for BoInner {
    fn drop(&mut self) {
        let device = &self.core.device;
        match self.kind {
            BoKind::Dumb => {
                if let Err(e) = device.destroy_dumb(self.handle) {
                    warn!(handle = self.handle, error = %e, "Failed to destroy dumb buffer");
                }
            }
            BoKind::Imported => {
                let mut table = self.core.bos.lock();
                // An import racing with this drop may already have replaced
                // the entry; the handle then belongs to the new BO.
                let ours = table
                    .get(&self.handle)
                    .map_or(false, |w| std::ptr::eq(w.as_ptr(), self as *const BoInner));
                if !ours {
                    debug!(handle = self.handle, "BO handle taken over by a newer import");
                    return;
                }
                table.remove(&self.handle);
                if let Err(e) = device.gem_close(self.handle) {
                    warn!(handle = self.handle, error = %e, "GEM_CLOSE failed");
                }
            }
        }
        debug!(handle = self.handle, kind = ?self.kind, "Released BO");
    }
}

/// A reference counted kernel buffer handle
#[derive(Clone)]
pub struct BufferObject {
    inner: Arc<BoInner>,
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.inner.handle)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl BufferObject {
    /// Import a dma-buf fd, returning the existing BO if the handle is live
    ///
    /// The fd is not consumed; the caller may close it once this returns.
    pub fn import(env: &Environment, fd: RawFd) -> Result<Self> {
        Self::import_core(env.core(), fd)
    }

    pub(crate) fn import_core(core: &Arc<DeviceCore>, fd: RawFd) -> Result<Self> {
        let mut table = core.bos.lock();

        let handle = core.device.prime_fd_to_handle(fd).map_err(|source| {
            error!(fd, error = %source, "PRIME_FD_TO_HANDLE failed");
            Error::Import { fd, source }
        })?;

        if let Some(inner) = table.get(&handle).and_then(Weak::upgrade) {
            debug!(fd, handle, "Reusing imported BO");
            return Ok(Self { inner });
        }

        let inner = Arc::new(BoInner {
            core: Arc::clone(core),
            handle,
            kind: BoKind::Imported,
            dumb: None,
        });
        table.insert(handle, Arc::downgrade(&inner));
        debug!(fd, handle, "Imported BO");
        Ok(Self { inner })
    }

    /// Allocate a dumb buffer; pitch and size are whatever the kernel picked
    pub fn new_dumb(env: &Environment, width: u32, height: u32, bpp: u32) -> Result<Self> {
        Self::dumb_core(env.core(), width, height, bpp)
    }

    pub(crate) fn dumb_core(
        core: &Arc<DeviceCore>,
        width: u32,
        height: u32,
        bpp: u32,
    ) -> Result<Self> {
        let dumb = core.device.create_dumb(width, height, bpp).map_err(|e| {
            error!(width, height, bpp, error = %e, "CREATE_DUMB failed");
            Error::Alloc(format!("dumb {}x{}x{}: {}", width, height, bpp, e))
        })?;
        debug!(
            handle = dumb.handle,
            pitch = dumb.pitch,
            size = dumb.size,
            "Allocated dumb BO"
        );
        Ok(Self {
            inner: Arc::new(BoInner {
                core: Arc::clone(core),
                handle: dumb.handle,
                kind: BoKind::Dumb,
                dumb: Some(dumb),
            }),
        })
    }

    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    pub fn kind(&self) -> BoKind {
        self.inner.kind
    }

    /// Kernel chosen pitch of a dumb BO
    pub fn pitch(&self) -> Option<u32> {
        self.inner.dumb.map(|d| d.pitch)
    }

    /// Kernel chosen size of a dumb BO
    pub fn size(&self) -> Option<u64> {
        self.inner.dumb.map(|d| d.size)
    }

    /// Number of live references to this BO
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &BufferObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
