//! Framebuffer pools
//!
//! A pool hands out dumb FBs and takes them back when their last reference
//! drops, so steady-state playback never goes back to the kernel for memory.
//! Only the free list bookkeeping happens under the pool lock; allocation
//! and destruction are done outside it.

use crate::env::{DeviceCore, Environment};
use crate::fb::{Disposition, Fb, Framebuffer, PreDeleteHook};
use crate::fourcc::{fourcc_string, DRM_FORMAT_MOD_LINEAR};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Default)]
struct PoolState {
    /// Oldest first
    free: VecDeque<Framebuffer>,
    /// FBs allocated by this pool and not yet destroyed, free ones included
    live: usize,
    dead: bool,
}

pub(crate) struct PoolInner {
    core: Arc<DeviceCore>,
    max: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop recycling and destroy everything on the free list
    pub(crate) fn mark_dead(&self) {
        let free = {
            let mut st = self.lock();
            st.dead = true;
            let free = std::mem::take(&mut st.free);
            st.live -= free.len();
            free
        };
        if !free.is_empty() {
            debug!(count = free.len(), "Pool dead: freeing unused FBs");
        }
        drop(free);
    }
}

impl PreDeleteHook for PoolInner {
    fn on_would_destroy(&self, fb: Framebuffer) -> Disposition {
        let mut st = self.lock();
        if st.dead {
            st.live -= 1;
            return Disposition::Proceed(fb);
        }
        debug!(fb_id = fb.id(), "FB back to pool");
        st.free.push_back(fb);
        Disposition::Resurrected
    }
}

/// A bounded cache of dumb framebuffers
pub struct Pool {
    inner: Arc<PoolInner>,
}

fn fits(fb: &Framebuffer, width: u32, height: u32, format: u32) -> bool {
    width <= fb.width() && height <= fb.height() && format == fb.format()
}

impl Pool {
    /// Pool allowing at most `max` FBs to exist at once
    pub fn new(env: &Environment, max: usize) -> Pool {
        let inner = Arc::new(PoolInner {
            core: Arc::clone(env.core()),
            max,
            state: Mutex::new(PoolState::default()),
        });
        env.register_pool(&inner);
        if env.is_lost() {
            inner.mark_dead();
        }
        info!(max, "Created FB pool");
        Pool { inner }
    }

    /// Get an FB of at least `width` x `height` in `format`
    ///
    /// A free FB that is big enough is reused with its active area set to the
    /// request. Otherwise a new one is allocated, evicting the oldest free FB
    /// if the pool is full. With every FB in use this fails with
    /// [`Error::PoolExhausted`].
    pub fn acquire(&self, width: u32, height: u32, format: u32) -> Result<Fb> {
        let hook: Arc<dyn PreDeleteHook> = self.inner.clone();

        let (reused, evicted) = {
            let mut st = self.inner.lock();
            if st.dead {
                return Err(Error::InvalidValue("pool is dead".to_string()));
            }
            if let Some(i) = st.free.iter().position(|fb| fits(fb, width, height, format)) {
                (st.free.remove(i), None)
            } else if st.live >= self.inner.max {
                match st.free.pop_front() {
                    // The slot of the evicted FB goes to the new one
                    Some(old) => (None, Some(old)),
                    None => return Err(Error::PoolExhausted { max: self.inner.max }),
                }
            } else {
                st.live += 1;
                (None, None)
            }
        };

        if let Some(fb) = reused {
            fb.reset_active(width, height);
            debug!(fb_id = fb.id(), width, height, "Reusing pooled FB");
            return Ok(Fb::wrap(fb, Some(hook)));
        }

        if let Some(old) = evicted {
            debug!(fb_id = old.id(), "Evicting oldest free FB");
            drop(old);
        }

        match Framebuffer::dumb(&self.inner.core, width, height, format, DRM_FORMAT_MOD_LINEAR) {
            Ok(fb) => {
                debug!(
                    fb_id = fb.id(),
                    "New pooled FB {}x{} {}",
                    width,
                    height,
                    fourcc_string(format)
                );
                Ok(Fb::wrap(fb, Some(hook)))
            }
            Err(e) => {
                self.inner.lock().live -= 1;
                Err(e)
            }
        }
    }

    /// Stop reuse and free every idle FB; FBs still in use die when released
    pub fn mark_dead(&self) {
        self.inner.mark_dead();
    }

    pub fn is_dead(&self) -> bool {
        self.inner.lock().dead
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    /// FBs in existence, in use or free
    pub fn live_count(&self) -> usize {
        self.inner.lock().live
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.mark_dead();
    }
}
