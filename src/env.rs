//! The KMS environment: one open device and everything built on it
//!
//! An [`Environment`] discovers the device's planes, CRTCs and connectors,
//! owns the commit queue and arms a task on the injected [`PollScheduler`]
//! that reads completion events off the device fd and advances the queue.
//!
//! When event reading fails with an errno meaning the device is gone, the
//! environment is lost for good: pools are marked dead, queued and on-screen
//! commits are dropped, the lost handler runs once and the event task is not
//! re-armed.

use crate::atomic::{Atomic, CommitFlags};
use crate::bo::BoTable;
use crate::config::EnvConfig;
use crate::device::{Card, KmsDevice, PropertyInfo};
use crate::ioctl::*;
use crate::objects::{ClaimedPlane, Connector, Crtc, Plane, PlaneTypes};
use crate::poll::{PollScheduler, PollTask, Revents, TaskId};
use crate::pool::PoolInner;
use crate::queue::{CommitQueue, QueueState};
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per device state shared by every object made from it
pub(crate) struct DeviceCore {
    pub(crate) device: Arc<dyn KmsDevice>,
    pub(crate) bos: BoTable,
    props: Mutex<HashMap<u32, PropertyInfo>>,
}

impl DeviceCore {
    pub(crate) fn new(device: Arc<dyn KmsDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            bos: BoTable::default(),
            props: Mutex::new(HashMap::new()),
        })
    }

    /// Kernel description of a property, fetched once per id
    pub(crate) fn property_info(&self, id: u32) -> Result<PropertyInfo> {
        if let Some(info) = lock(&self.props).get(&id) {
            return Ok(info.clone());
        }
        let info = self.device.property(id)?;
        lock(&self.props).insert(id, info.clone());
        Ok(info)
    }
}

type LostHandler = Box<dyn FnOnce(Error) + Send>;

struct EnvInner {
    core: Arc<DeviceCore>,
    scheduler: Arc<dyn PollScheduler>,
    config: EnvConfig,
    planes: Vec<Arc<Plane>>,
    crtcs: Vec<Arc<Crtc>>,
    connectors: Vec<Arc<Connector>>,
    queue: Arc<CommitQueue>,
    pools: Mutex<Vec<Weak<PoolInner>>>,
    event_task: Mutex<Option<TaskId>>,
    lost: AtomicBool,
    stopped: AtomicBool,
    lost_handler: Mutex<Option<LostHandler>>,
    restore: Mutex<Option<Atomic>>,
}

impl EnvInner {
    fn arm_events(self: &Arc<Self>) {
        if self.lost.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(self);
        let task = PollTask::fd(self.core.device.event_fd(), None, move |revents| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(revents);
            }
        });
        let id = self.scheduler.add_task(task);
        *lock(&self.event_task) = Some(id);
    }

    fn on_event(self: &Arc<Self>, revents: Revents) {
        lock(&self.event_task).take();
        if revents.error {
            debug!("Error condition on event fd");
        }
        match self.dispatch() {
            Err(Error::DeviceLost(_)) => {}
            Err(e) => {
                warn!(error = %e, "Event dispatch failed");
                self.arm_events();
            }
            Ok(_) => self.arm_events(),
        }
    }

    fn dispatch(&self) -> Result<usize> {
        if self.lost.load(Ordering::Acquire) {
            return Err(Error::DeviceLost("device already lost".to_string()));
        }
        match self.core.device.read_events() {
            Ok(events) => {
                for ev in &events {
                    self.queue.on_flip(ev);
                }
                Ok(events.len())
            }
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                if Error::is_device_gone(errno) {
                    let reason = format!("reading events: {}", e);
                    self.device_lost(&reason);
                    Err(Error::DeviceLost(reason))
                } else {
                    Err(Error::Io(e))
                }
            }
        }
    }

    fn device_lost(&self, reason: &str) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(reason, "KMS device lost");

        let pools: Vec<_> = lock(&self.pools).drain(..).collect();
        for pool in pools.iter().filter_map(Weak::upgrade) {
            pool.mark_dead();
        }
        self.queue.kill();
        if let Some(id) = lock(&self.event_task).take() {
            self.scheduler.remove_task(id);
        }
        drop(lock(&self.restore).take());

        let handler = lock(&self.lost_handler).take();
        if let Some(handler) = handler {
            handler(Error::DeviceLost(reason.to_string()));
        }
    }
}

/// An open KMS device with its topology and commit queue
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    /// Build an environment on `device`, delivering events through `scheduler`
    pub fn new(
        device: Arc<dyn KmsDevice>,
        scheduler: Arc<dyn PollScheduler>,
        config: EnvConfig,
    ) -> Result<Self> {
        let core = DeviceCore::new(device);
        let res = core.device.resources()?;

        let crtcs = res
            .crtcs
            .iter()
            .enumerate()
            .map(|(i, id)| Crtc::discover(&core, *id, i as u32).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let connectors = res
            .connectors
            .iter()
            .map(|id| Connector::discover(&core, *id).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let planes = core
            .device
            .plane_ids()?
            .into_iter()
            .map(|id| Plane::discover(&core, id).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let restore = if config.restore_on_close {
            match Self::snapshot(&core, &planes, &crtcs, &connectors) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!(error = %e, "Could not snapshot display state; not restoring on close");
                    None
                }
            }
        } else {
            None
        };

        let queue = CommitQueue::new(
            Arc::clone(&scheduler),
            config.modeset_allow,
            config.commit_retry_limit,
            config.retry_delay(),
        );

        info!(
            planes = planes.len(),
            crtcs = crtcs.len(),
            connectors = connectors.len(),
            "KMS environment ready"
        );

        let inner = Arc::new(EnvInner {
            core,
            scheduler,
            config,
            planes,
            crtcs,
            connectors,
            queue,
            pools: Mutex::new(Vec::new()),
            event_task: Mutex::new(None),
            lost: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            lost_handler: Mutex::new(None),
            restore: Mutex::new(restore),
        });
        inner.arm_events();
        Ok(Self { inner })
    }

    /// Open a DRM card node
    pub fn open(
        path: impl AsRef<Path>,
        scheduler: Arc<dyn PollScheduler>,
        config: EnvConfig,
    ) -> Result<Self> {
        let card = Card::open(path)?;
        Self::new(Arc::new(card), scheduler, config)
    }

    fn snapshot(
        core: &Arc<DeviceCore>,
        planes: &[Arc<Plane>],
        crtcs: &[Arc<Crtc>],
        connectors: &[Arc<Connector>],
    ) -> Result<Atomic> {
        let mut a = Atomic::with_core(core);
        for p in planes {
            a.add_snapshot(p.id(), DRM_MODE_OBJECT_PLANE)?;
        }
        for c in crtcs {
            a.add_snapshot(c.id(), DRM_MODE_OBJECT_CRTC)?;
        }
        for c in connectors {
            a.add_snapshot(c.id(), DRM_MODE_OBJECT_CONNECTOR)?;
        }
        debug!(props = a.len(), "Saved display state");
        Ok(a)
    }

    pub(crate) fn core(&self) -> &Arc<DeviceCore> {
        &self.inner.core
    }

    pub(crate) fn register_pool(&self, pool: &Arc<PoolInner>) {
        let mut pools = lock(&self.inner.pools);
        pools.retain(|w| w.strong_count() > 0);
        pools.push(Arc::downgrade(pool));
    }

    pub fn device(&self) -> &Arc<dyn KmsDevice> {
        &self.inner.core.device
    }

    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    pub fn planes(&self) -> &[Arc<Plane>] {
        &self.inner.planes
    }

    pub fn crtcs(&self) -> &[Arc<Crtc>] {
        &self.inner.crtcs
    }

    pub fn connectors(&self) -> &[Arc<Connector>] {
        &self.inner.connectors
    }

    /// Live imported BOs
    pub fn imported_bo_count(&self) -> usize {
        self.inner.core.bos.len()
    }

    /// The CRTC driving `conn`: the one it is bound to, else the first it can use
    pub fn crtc_for_connector(&self, conn: &Connector) -> Option<Arc<Crtc>> {
        let bound = conn.props().initial("CRTC_ID").unwrap_or(0) as u32;
        self.inner
            .crtcs
            .iter()
            .find(|c| bound != 0 && c.id() == bound)
            .or_else(|| self.inner.crtcs.iter().find(|c| conn.can_use_crtc(c)))
            .cloned()
    }

    /// First connected connector and its CRTC
    pub fn first_output(&self) -> Option<(Arc<Connector>, Arc<Crtc>)> {
        self.inner
            .connectors
            .iter()
            .filter(|c| c.is_connected())
            .find_map(|c| self.crtc_for_connector(c).map(|crtc| (Arc::clone(c), crtc)))
    }

    /// Claim a free plane of one of `types` that can drive `crtc`
    pub fn claim_plane(&self, crtc: &Crtc, types: PlaneTypes) -> Result<ClaimedPlane> {
        for plane in &self.inner.planes {
            if !types.contains(plane.plane_type().as_types()) || !plane.can_use_crtc(crtc) {
                continue;
            }
            if let Ok(claimed) = plane.claim(crtc) {
                return Ok(claimed);
            }
        }
        Err(Error::Busy(format!(
            "no free {:?} plane for CRTC {}",
            types,
            crtc.id()
        )))
    }

    /// Empty transaction on this device
    pub fn atomic(&self) -> Atomic {
        Atomic::with_core(&self.inner.core)
    }

    /// Hand a transaction to the commit queue
    ///
    /// Returns once it is submitted or parked behind the one in flight. The
    /// references it holds are released after the flip that replaces it.
    pub fn queue(&self, atomic: Atomic) -> Result<()> {
        if self.is_lost() {
            return Err(Error::DeviceLost("device lost".to_string()));
        }
        self.inner.queue.queue(atomic)
    }

    /// Block until no commit is waiting behind the one in flight
    pub fn queue_wait(&self) -> Result<()> {
        self.inner.queue.wait_pending()
    }

    pub fn queue_state(&self) -> QueueState {
        self.inner.queue.state()
    }

    /// Read and handle pending device events now
    ///
    /// Normally the event task does this; calling it directly is only needed
    /// when the scheduler is not running.
    pub fn dispatch_events(&self) -> Result<usize> {
        self.inner.dispatch()
    }

    /// Called once, from the event task, if the device goes away
    pub fn set_lost_handler(&self, handler: impl FnOnce(Error) + Send + 'static) {
        *lock(&self.inner.lost_handler) = Some(Box::new(handler));
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::Release);
        if let Some(id) = lock(&inner.event_task).take() {
            inner.scheduler.remove_task(id);
        }

        let restore = lock(&inner.restore).take();
        if let Some(restore) = restore {
            if !self.is_lost() {
                match restore.commit(CommitFlags::ALLOW_MODESET) {
                    Ok(()) => info!("Restored display state"),
                    Err(e) => warn!(error = %e, "Failed to restore display state"),
                }
            }
        }

        inner.queue.kill();
        debug!("KMS environment closed");
    }
}
