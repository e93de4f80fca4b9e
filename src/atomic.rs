//! Atomic property transactions
//!
//! An [`Atomic`] accumulates (object, property, value) triples, ordered by
//! object and then property, together with the framebuffers and blobs those
//! values refer to. The references are held for as long as the transaction
//! is, so an FB cannot be destroyed while a commit that shows it is queued or
//! on screen.

use crate::device::AtomicRequest;
use crate::env::{DeviceCore, Environment};
use crate::fb::{Fb, HdrMetadata};
use crate::ioctl::*;
use crate::objects::{ClaimedPlane, Connector, Crtc, Plane};
use crate::props::{cached_blob, Blob, PropEnum, PropRange};
use crate::rect::Rect;
use crate::{Error, Result};
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{debug, error};

bitflags! {
    /// Flags of an atomic commit
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = DRM_MODE_PAGE_FLIP_EVENT;
        const TEST_ONLY = DRM_MODE_ATOMIC_TEST_ONLY;
        const NONBLOCK = DRM_MODE_ATOMIC_NONBLOCK;
        const ALLOW_MODESET = DRM_MODE_ATOMIC_ALLOW_MODESET;
    }
}

bitflags! {
    /// Values of the plane `rotation` bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rotation: u64 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

/// A resource kept alive by a property value
#[derive(Debug, Clone)]
pub enum PropRef {
    Fb(Fb),
    Blob(Blob),
}

/// Callback run when a property entry is replaced or dropped
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

pub(crate) struct PropEntry {
    value: u64,
    held: Option<PropRef>,
    on_release: Option<ReleaseFn>,
}

impl Drop for PropEntry {
    fn drop(&mut self) {
        if let Some(f) = self.on_release.take() {
            f();
        }
    }
}

/// Entries displaced by a merge, released when this is dropped
pub(crate) struct Displaced(#[allow(dead_code)] Vec<PropEntry>);

/// A set of property changes to commit together
pub struct Atomic {
    core: Arc<DeviceCore>,
    objs: BTreeMap<u32, BTreeMap<u32, PropEntry>>,
}

impl fmt::Debug for Atomic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atomic")
            .field("objects", &self.objs.len())
            .field("props", &self.len())
            .finish()
    }
}

impl Atomic {
    pub fn new(env: &Environment) -> Self {
        Self::with_core(env.core())
    }

    pub(crate) fn with_core(core: &Arc<DeviceCore>) -> Self {
        Self {
            core: Arc::clone(core),
            objs: BTreeMap::new(),
        }
    }

    /// Number of (object, property) entries
    pub fn len(&self) -> usize {
        self.objs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// Value that will be submitted for `prop` on `obj`
    pub fn value(&self, obj: u32, prop: u32) -> Option<u64> {
        self.objs.get(&obj)?.get(&prop).map(|e| e.value)
    }

    /// Resource held for `prop` on `obj`
    pub fn held(&self, obj: u32, prop: u32) -> Option<&PropRef> {
        self.objs.get(&obj)?.get(&prop)?.held.as_ref()
    }

    /// Set a property, holding `held` and calling `on_release` once the entry
    /// is replaced or the transaction is dropped
    ///
    /// A previous entry for the same property is released before the new one
    /// is stored.
    pub fn add_generic(
        &mut self,
        obj: u32,
        prop: u32,
        value: u64,
        held: Option<PropRef>,
        on_release: Option<ReleaseFn>,
    ) {
        let props = self.objs.entry(obj).or_default();
        drop(props.remove(&prop));
        props.insert(
            prop,
            PropEntry {
                value,
                held,
                on_release,
            },
        );
    }

    pub fn add_value(&mut self, obj: u32, prop: u32, value: u64) {
        self.add_generic(obj, prop, value, None, None);
    }

    /// Set an enum or bitmask property by value name
    ///
    /// A missing property is skipped; a name the property doesn't know is an
    /// error.
    pub fn add_enum(&mut self, obj: u32, prop: Option<&PropEnum>, name: &str) -> Result<()> {
        let Some(prop) = prop else {
            return Ok(());
        };
        let value = prop.value(name).ok_or_else(|| {
            let known: Vec<&str> = prop.names().collect();
            Error::InvalidValue(format!(
                "{:?} is not a value of {} (one of {})",
                name,
                prop.name(),
                known.join(", ")
            ))
        })?;
        self.add_value(obj, prop.id(), value);
        Ok(())
    }

    /// Set a range property, checking the bounds; a missing property is skipped
    pub fn add_range(&mut self, obj: u32, prop: Option<&PropRange>, value: u64) -> Result<()> {
        let Some(prop) = prop else {
            return Ok(());
        };
        if !prop.contains(value) {
            return Err(Error::InvalidValue(format!(
                "{} outside [{}, {}] of property {}",
                value,
                prop.min(),
                prop.max(),
                prop.id()
            )));
        }
        self.add_value(obj, prop.id(), value);
        Ok(())
    }

    /// Point an FB property at `fb`, holding a reference; `None` sets 0
    pub fn add_fb(&mut self, obj: u32, prop: u32, fb: Option<&Fb>) {
        match fb {
            Some(fb) => self.add_generic(obj, prop, fb.id() as u64, Some(PropRef::Fb(fb.clone())), None),
            None => self.add_value(obj, prop, 0),
        }
    }

    /// Point a blob property at `blob`, holding a reference; `None` sets 0
    pub fn add_blob(&mut self, obj: u32, prop: u32, blob: Option<&Blob>) {
        match blob {
            Some(b) => self.add_generic(obj, prop, b.id() as u64, Some(PropRef::Blob(b.clone())), None),
            None => self.add_value(obj, prop, 0),
        }
    }

    /// Move every entry of `other` into this transaction, its values winning
    pub fn merge(&mut self, other: Atomic) {
        drop(self.merge_displaced(other));
    }

    pub(crate) fn merge_displaced(&mut self, other: Atomic) -> Displaced {
        let mut displaced = Vec::new();
        for (obj, props) in other.objs {
            let dst = self.objs.entry(obj).or_default();
            for (prop, entry) in props {
                if let Some(old) = dst.insert(prop, entry) {
                    displaced.push(old);
                }
            }
        }
        Displaced(displaced)
    }

    /// Add the current value of every mutable property of an object
    pub fn add_snapshot(&mut self, obj: u32, obj_type: u32) -> Result<()> {
        let values = self.core.device.object_properties(obj, obj_type)?;
        for (prop, value) in values {
            let info = self.core.property_info(prop)?;
            if info.flags & DRM_MODE_PROP_IMMUTABLE != 0 {
                continue;
            }
            self.add_value(obj, prop, value);
        }
        Ok(())
    }

    /// The request in the shape the commit ioctl takes
    pub fn request(&self) -> AtomicRequest {
        let mut req = AtomicRequest::default();
        for (obj, props) in &self.objs {
            req.objs.push(*obj);
            req.count_props.push(props.len() as u32);
            for (prop, entry) in props {
                req.props.push(*prop);
                req.values.push(entry.value);
            }
        }
        req
    }

    pub(crate) fn submit(&self, flags: CommitFlags, user_data: u64) -> io::Result<()> {
        self.core
            .device
            .atomic_commit(flags.bits(), &self.request(), user_data)
    }

    /// Commit synchronously
    ///
    /// On failure the transaction keeps everything it holds, so it can be
    /// retried or dropped.
    pub fn commit(&self, flags: CommitFlags) -> Result<()> {
        if self.is_empty() {
            debug!("Empty atomic commit skipped");
            return Ok(());
        }
        self.submit(flags, 0).map_err(|e| {
            error!(flags = flags.bits(), error = %e, "Atomic commit failed");
            self.dump();
            Error::commit(e)
        })
    }

    /// Ask the kernel whether this would commit, without applying anything
    pub fn commit_test(&self, flags: CommitFlags) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.submit(flags | CommitFlags::TEST_ONLY, 0)
            .map_err(Error::commit)
    }

    /// Log every triple
    pub fn dump(&self) {
        for (obj, props) in &self.objs {
            for (prop, entry) in props {
                let name = self
                    .core
                    .property_info(*prop)
                    .map(|i| i.name)
                    .unwrap_or_default();
                debug!(obj, prop, value = entry.value, "  {}", name);
            }
        }
    }

    /// Show `fb` on `plane` at `pos` on the CRTC, or disable it with `None`
    ///
    /// The source rect is the FB's crop. COLOR_ENCODING, COLOR_RANGE and
    /// pixel blend mode follow the FB when the plane has them.
    pub fn plane_fb_set(&mut self, plane: &ClaimedPlane, fb: Option<&Fb>, pos: Rect) -> Result<()> {
        let props = plane.props();
        let obj = plane.id();
        let fb_prop = props
            .id("FB_ID")
            .ok_or_else(|| Error::PropertyMissing("FB_ID".to_string()))?;
        let crtc_prop = props
            .id("CRTC_ID")
            .ok_or_else(|| Error::PropertyMissing("CRTC_ID".to_string()))?;

        let Some(fb) = fb else {
            self.add_fb(obj, fb_prop, None);
            self.add_value(obj, crtc_prop, 0);
            return Ok(());
        };

        if !plane.format_check(fb.format(), fb.modifier()) {
            return Err(Error::format(
                fb.format(),
                fb.modifier(),
                format!("not supported by plane {}", obj),
            ));
        }

        self.add_fb(obj, fb_prop, Some(fb));
        self.add_value(obj, crtc_prop, plane.crtc_id() as u64);

        let src = fb.src_rect();
        let geometry = [
            ("SRC_X", src.x as u32 as u64),
            ("SRC_Y", src.y as u32 as u64),
            ("SRC_W", src.w as u64),
            ("SRC_H", src.h as u64),
            ("CRTC_X", pos.x as i64 as u64),
            ("CRTC_Y", pos.y as i64 as u64),
            ("CRTC_W", pos.w as u64),
            ("CRTC_H", pos.h as u64),
        ];
        for (name, value) in geometry {
            if let Some(id) = props.id(name) {
                self.add_value(obj, id, value);
            }
        }

        if fb.is_yuv() {
            let color = fb.color_info();
            if let Some(enc) = &color.encoding {
                self.add_enum(obj, props.enum_prop("COLOR_ENCODING"), enc)?;
            }
            if let Some(range) = &color.range {
                self.add_enum(obj, props.enum_prop("COLOR_RANGE"), range)?;
            }
        }
        if let Some(mode) = fb.blend_mode() {
            self.add_enum(obj, props.enum_prop("pixel blend mode"), &mode)?;
        }
        Ok(())
    }

    /// Plane alpha, 0 transparent to 0xffff opaque
    pub fn plane_alpha(&mut self, plane: &Plane, alpha: u16) -> Result<()> {
        self.add_range(plane.id(), plane.props().range("alpha"), alpha as u64)
    }

    pub fn plane_rotation(&mut self, plane: &Plane, rotation: Rotation) -> Result<()> {
        let Some(prop) = plane.props().enum_prop("rotation") else {
            if rotation == Rotation::ROTATE_0 {
                return Ok(());
            }
            return Err(Error::PropertyMissing("rotation".to_string()));
        };
        if rotation.bits() & !prop.mask() != 0 {
            return Err(Error::InvalidValue(format!(
                "rotation {:?} not supported by plane {}",
                rotation,
                plane.id()
            )));
        }
        self.add_value(plane.id(), prop.id(), rotation.bits());
        Ok(())
    }

    pub fn plane_zpos(&mut self, plane: &Plane, zpos: u64) -> Result<()> {
        self.add_range(plane.id(), plane.props().range("zpos"), zpos)
    }

    /// Set the CRTC mode; the blob is reused while the mode is unchanged
    pub fn crtc_mode_id_set(&mut self, crtc: &Crtc, mode: Option<&DrmModeModeinfo>) -> Result<()> {
        let Some(prop) = crtc.props().id("MODE_ID") else {
            return Ok(());
        };
        let bytes = mode.map(DrmModeModeinfo::to_bytes);
        let blob = {
            let mut slot = crtc.mode_blob();
            cached_blob(&self.core, &mut slot, bytes.as_deref())?
        };
        self.add_blob(crtc.id(), prop, blob.as_ref());
        Ok(())
    }

    pub fn crtc_active_set(&mut self, crtc: &Crtc, active: bool) -> Result<()> {
        self.add_range(crtc.id(), crtc.props().range("ACTIVE"), active as u64)
    }

    /// Route a connector to a CRTC, 0 to disconnect it
    pub fn conn_crtc_id_set(&mut self, conn: &Connector, crtc_id: u32) {
        if let Some(prop) = conn.props().id("CRTC_ID") {
            self.add_value(conn.id(), prop, crtc_id as u64);
        }
    }

    /// Static HDR metadata; the blob is reused while the bytes are unchanged
    pub fn conn_hdr_metadata_set(
        &mut self,
        conn: &Connector,
        metadata: Option<&HdrMetadata>,
    ) -> Result<()> {
        let Some(prop) = conn.props().id("HDR_OUTPUT_METADATA") else {
            return Ok(());
        };
        let bytes = metadata.map(HdrMetadata::to_bytes);
        let blob = {
            let mut slot = conn.hdr_blob();
            cached_blob(&self.core, &mut slot, bytes.as_deref())?
        };
        self.add_blob(conn.id(), prop, blob.as_ref());
        Ok(())
    }

    pub fn conn_colorspace_set(&mut self, conn: &Connector, name: &str) -> Result<()> {
        self.add_enum(conn.id(), conn.props().enum_prop("Colorspace"), name)
    }

    pub fn conn_broadcast_rgb_set(&mut self, conn: &Connector, name: &str) -> Result<()> {
        self.add_enum(conn.id(), conn.props().enum_prop("Broadcast RGB"), name)
    }

    pub fn conn_max_bpc_set(&mut self, conn: &Connector, bpc: u32) -> Result<()> {
        self.add_range(conn.id(), conn.props().range("max bpc"), bpc as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{VirtualConfig, VirtualDevice};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core() -> Arc<DeviceCore> {
        let dev = VirtualDevice::new(VirtualConfig::default()).unwrap();
        DeviceCore::new(Arc::new(dev))
    }

    fn counter(n: &Arc<AtomicUsize>) -> Option<ReleaseFn> {
        let n = n.clone();
        Some(Box::new(move || {
            n.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_replace_releases_previous_once() {
        let mut a = Atomic::with_core(&core());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        a.add_generic(20, 1001, 7, None, counter(&first));
        a.add_generic(20, 1001, 9, None, counter(&second));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(a.value(20, 1001), Some(9));
        assert_eq!(a.len(), 1);

        drop(a);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_is_ordered_by_object() {
        let mut a = Atomic::with_core(&core());
        a.add_value(21, 1003, 3);
        a.add_value(10, 1018, 1);
        a.add_value(21, 1001, 5);
        let req = a.request();
        assert_eq!(req.objs, vec![10, 21]);
        assert_eq!(req.count_props, vec![1, 2]);
        assert_eq!(req.props, vec![1018, 1001, 1003]);
        assert_eq!(req.values, vec![1, 5, 3]);
    }

    #[test]
    fn test_merge_prefers_newer() {
        let c = core();
        let released = Arc::new(AtomicUsize::new(0));
        let mut a = Atomic::with_core(&c);
        a.add_generic(20, 1001, 1, None, counter(&released));
        a.add_value(20, 1002, 2);
        let mut b = Atomic::with_core(&c);
        b.add_value(20, 1001, 10);
        b.add_value(22, 1001, 11);

        a.merge(b);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(a.value(20, 1001), Some(10));
        assert_eq!(a.value(20, 1002), Some(2));
        assert_eq!(a.value(22, 1001), Some(11));
    }

    #[test]
    fn test_rotation_bits() {
        assert_eq!(Rotation::ROTATE_180.bits(), 4);
        assert_eq!((Rotation::ROTATE_0 | Rotation::REFLECT_Y).bits(), 33);
    }
}
