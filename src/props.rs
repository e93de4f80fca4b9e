//! Typed views of kernel object properties
//!
//! Property descriptions are fetched once, when an object is discovered, and
//! kept here so that building an atomic request by name never needs another
//! ioctl. A property the device does not expose simply isn't in the map:
//! callers get `None` and skip the feature.

use crate::device::PropertyInfo;
use crate::env::{DeviceCore, Environment};
use crate::ioctl::*;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Well known property names and enum values
pub mod names {
    pub const COLOR_ENCODING_BT601: &str = "ITU-R BT.601 YCbCr";
    pub const COLOR_ENCODING_BT709: &str = "ITU-R BT.709 YCbCr";
    pub const COLOR_ENCODING_BT2020: &str = "ITU-R BT.2020 YCbCr";

    pub const COLOR_RANGE_LIMITED: &str = "YCbCr limited range";
    pub const COLOR_RANGE_FULL: &str = "YCbCr full range";

    pub const COLORSPACE_DEFAULT: &str = "Default";
    pub const COLORSPACE_BT709_YCC: &str = "BT709_YCC";
    pub const COLORSPACE_BT2020_RGB: &str = "BT2020_RGB";
    pub const COLORSPACE_BT2020_YCC: &str = "BT2020_YCC";

    pub const BROADCAST_RGB_AUTOMATIC: &str = "Automatic";
    pub const BROADCAST_RGB_FULL: &str = "Full";
    pub const BROADCAST_RGB_LIMITED: &str = "Limited 16:235";

    pub const BLEND_NONE: &str = "None";
    pub const BLEND_PREMULTIPLIED: &str = "Pre-multiplied";
    pub const BLEND_COVERAGE: &str = "Coverage";
}

/// An enum or bitmask property
#[derive(Debug, Clone)]
pub struct PropEnum {
    id: u32,
    name: String,
    bitmask: bool,
    /// Sorted by name
    entries: Vec<(String, u64)>,
}

impl PropEnum {
    pub fn from_info(info: &PropertyInfo) -> Option<Self> {
        let bitmask = info.flags & DRM_MODE_PROP_BITMASK != 0;
        if info.flags & DRM_MODE_PROP_ENUM == 0 && !bitmask {
            return None;
        }
        let mut entries: Vec<(String, u64)> = info
            .enums
            .iter()
            .map(|e| (e.name.clone(), e.value))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Some(Self {
            id: info.id,
            name: info.name.clone(),
            bitmask,
            entries,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_bitmask(&self) -> bool {
        self.bitmask
    }

    /// Value to write for `name`; for a bitmask this is the bit, not its index
    pub fn value(&self, name: &str) -> Option<u64> {
        let i = self
            .entries
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()?;
        let v = self.entries[i].1;
        if self.bitmask {
            (v < 64).then(|| 1u64 << v)
        } else {
            Some(v)
        }
    }

    /// Every bit a bitmask property accepts
    pub fn mask(&self) -> u64 {
        self.entries
            .iter()
            .filter(|(_, v)| *v < 64)
            .fold(0, |m, (_, v)| m | (1u64 << v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }
}

/// A numeric range property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropRange {
    id: u32,
    min: u64,
    max: u64,
    signed: bool,
}

impl PropRange {
    pub fn from_info(info: &PropertyInfo) -> Option<Self> {
        let signed = info.flags & DRM_MODE_PROP_EXTENDED_TYPE == DRM_MODE_PROP_SIGNED_RANGE;
        if info.flags & DRM_MODE_PROP_RANGE == 0 && !signed {
            return None;
        }
        let (min, max) = match info.values.as_slice() {
            [min, max, ..] => (*min, *max),
            _ => return None,
        };
        Some(Self {
            id: info.id,
            min,
            max,
            signed,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn contains(&self, v: u64) -> bool {
        if self.signed {
            (v as i64) >= (self.min as i64) && (v as i64) <= (self.max as i64)
        } else {
            v >= self.min && v <= self.max
        }
    }
}

/// What kind of value a property holds
#[derive(Debug, Clone)]
pub enum PropKind {
    Range(PropRange),
    Enum(PropEnum),
    Blob,
    /// Reference to another object of the given type
    Object(u32),
    Other,
}

/// One property of one object, with its value when the object was discovered
#[derive(Debug, Clone)]
pub struct Prop {
    pub id: u32,
    pub name: String,
    pub flags: u32,
    pub initial: u64,
    pub kind: PropKind,
}

impl Prop {
    fn from_info(info: PropertyInfo, initial: u64) -> Self {
        let kind = if let Some(r) = PropRange::from_info(&info) {
            PropKind::Range(r)
        } else if let Some(e) = PropEnum::from_info(&info) {
            PropKind::Enum(e)
        } else if info.flags & DRM_MODE_PROP_BLOB != 0 {
            PropKind::Blob
        } else if info.flags & DRM_MODE_PROP_EXTENDED_TYPE == DRM_MODE_PROP_OBJECT {
            PropKind::Object(info.values.first().copied().unwrap_or(0) as u32)
        } else {
            PropKind::Other
        };
        Self {
            id: info.id,
            name: info.name,
            flags: info.flags,
            initial,
            kind,
        }
    }

    pub fn is_immutable(&self) -> bool {
        self.flags & DRM_MODE_PROP_IMMUTABLE != 0
    }
}

/// The property set of one KMS object, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ObjectProps {
    obj_id: u32,
    obj_type: u32,
    props: BTreeMap<String, Prop>,
}

impl ObjectProps {
    pub(crate) fn load(core: &DeviceCore, obj_id: u32, obj_type: u32) -> Result<Self> {
        let values = core.device.object_properties(obj_id, obj_type)?;
        let mut props = BTreeMap::new();
        for (id, value) in values {
            let info = core.property_info(id)?;
            props.insert(info.name.clone(), Prop::from_info(info, value));
        }
        debug!(obj_id, count = props.len(), "Loaded object properties");
        Ok(Self {
            obj_id,
            obj_type,
            props,
        })
    }

    pub fn obj_id(&self) -> u32 {
        self.obj_id
    }

    pub fn obj_type(&self) -> u32 {
        self.obj_type
    }

    pub fn get(&self, name: &str) -> Option<&Prop> {
        self.props.get(name)
    }

    /// Property id, or `None` when the object doesn't have it
    pub fn id(&self, name: &str) -> Option<u32> {
        self.props.get(name).map(|p| p.id)
    }

    pub fn enum_prop(&self, name: &str) -> Option<&PropEnum> {
        match &self.props.get(name)?.kind {
            PropKind::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn range(&self, name: &str) -> Option<&PropRange> {
        match &self.props.get(name)?.kind {
            PropKind::Range(r) => Some(r),
            _ => None,
        }
    }

    /// Value the property had when the object was discovered
    pub fn initial(&self, name: &str) -> Option<u64> {
        self.props.get(name).map(|p| p.initial)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prop> {
        self.props.values()
    }
}

struct BlobInner {
    core: Arc<DeviceCore>,
    id: u32,
    data: Vec<u8>,
}

impl Drop for BlobInner {
    fn drop(&mut self) {
        if let Err(e) = self.core.device.destroy_blob(self.id) {
            warn!(blob_id = self.id, error = %e, "Failed to destroy property blob");
        }
    }
}

/// A kernel property blob, destroyed when the last reference goes
#[derive(Clone)]
pub struct Blob {
    inner: Arc<BlobInner>,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.inner.id)
            .field("len", &self.inner.data.len())
            .finish()
    }
}

impl Blob {
    pub fn new(env: &Environment, data: &[u8]) -> Result<Self> {
        Self::with_core(env.core(), data)
    }

    pub(crate) fn with_core(core: &Arc<DeviceCore>, data: &[u8]) -> Result<Self> {
        let id = core
            .device
            .create_blob(data)
            .map_err(|e| Error::Alloc(format!("property blob of {} bytes: {}", data.len(), e)))?;
        debug!(blob_id = id, len = data.len(), "Created property blob");
        Ok(Self {
            inner: Arc::new(BlobInner {
                core: Arc::clone(core),
                id,
                data: data.to_vec(),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Point at a blob holding `data`, keeping the current one if the bytes match
    ///
    /// Returns true if a new kernel blob was created.
    pub fn update(&mut self, data: &[u8]) -> Result<bool> {
        if self.inner.data == data {
            return Ok(false);
        }
        *self = Self::with_core(&self.inner.core, data)?;
        Ok(true)
    }
}

/// Refresh a cached blob slot for `data` and return the id to commit
///
/// `None` clears the slot and yields 0, the "no blob" value.
pub(crate) fn cached_blob(
    core: &Arc<DeviceCore>,
    slot: &mut Option<Blob>,
    data: Option<&[u8]>,
) -> Result<Option<Blob>> {
    let Some(data) = data else {
        *slot = None;
        return Ok(None);
    };
    if let Some(b) = slot.as_mut() {
        b.update(data)?;
        return Ok(Some(b.clone()));
    }
    let b = Blob::with_core(core, data)?;
    *slot = Some(b.clone());
    Ok(Some(b))
}
