//! Planes, CRTCs and connectors discovered at startup
//!
//! Each object carries its property table, resolved once, so atomic helpers
//! can look property ids up by name without touching the kernel.

use crate::env::DeviceCore;
use crate::fourcc::{fourcc_string, DRM_FORMAT_MOD_INVALID, DRM_FORMAT_MOD_LINEAR};
use crate::ioctl::*;
use crate::props::{Blob, ObjectProps};
use crate::{Error, Result};
use bitflags::bitflags;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Overlay,
    Primary,
    Cursor,
}

bitflags! {
    /// Set of plane types acceptable to [`Environment::claim_plane`](crate::Environment::claim_plane)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PlaneTypes: u32 {
        const OVERLAY = 1 << 0;
        const PRIMARY = 1 << 1;
        const CURSOR = 1 << 2;
    }
}

impl PlaneType {
    pub fn as_types(self) -> PlaneTypes {
        match self {
            PlaneType::Overlay => PlaneTypes::OVERLAY,
            PlaneType::Primary => PlaneTypes::PRIMARY,
            PlaneType::Cursor => PlaneTypes::CURSOR,
        }
    }
}

fn lock_slot(slot: &Mutex<Option<Blob>>) -> MutexGuard<'_, Option<Blob>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Plane {
    id: u32,
    plane_type: PlaneType,
    possible_crtcs: u32,
    formats: Vec<u32>,
    /// (format, modifier) pairs from IN_FORMATS; empty if the plane lacks it
    format_mods: Vec<(u32, u64)>,
    props: ObjectProps,
    claimed: AtomicBool,
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("id", &self.id)
            .field("type", &self.plane_type)
            .field("possible_crtcs", &format_args!("{:#x}", self.possible_crtcs))
            .field("formats", &self.formats.len())
            .finish()
    }
}

impl Plane {
    pub(crate) fn discover(core: &DeviceCore, id: u32) -> Result<Self> {
        let info = core.device.plane(id)?;
        let props = ObjectProps::load(core, id, DRM_MODE_OBJECT_PLANE)?;

        let plane_type = match (props.enum_prop("type"), props.initial("type")) {
            (Some(e), Some(v)) if e.value("Primary") == Some(v) => PlaneType::Primary,
            (Some(e), Some(v)) if e.value("Cursor") == Some(v) => PlaneType::Cursor,
            _ => PlaneType::Overlay,
        };

        let format_mods = match props.initial("IN_FORMATS") {
            Some(blob_id) if blob_id != 0 => match core.device.blob_data(blob_id as u32) {
                Ok(data) => parse_in_formats(&data),
                Err(e) => {
                    warn!(plane_id = id, error = %e, "Failed to read IN_FORMATS");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };

        debug!(
            plane_id = id,
            plane_type = ?plane_type,
            formats = info.formats.len(),
            modifiers = format_mods.len(),
            "Discovered plane"
        );

        Ok(Self {
            id,
            plane_type,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats,
            format_mods,
            props,
            claimed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn plane_type(&self) -> PlaneType {
        self.plane_type
    }

    pub fn formats(&self) -> &[u32] {
        &self.formats
    }

    pub fn props(&self) -> &ObjectProps {
        &self.props
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn can_use_crtc(&self, crtc: &Crtc) -> bool {
        crtc.index < 32 && self.possible_crtcs & (1 << crtc.index) != 0
    }

    /// Whether the plane can scan out `format` with `modifier`
    ///
    /// `DRM_FORMAT_MOD_INVALID` is taken to mean linear.
    pub fn format_check(&self, format: u32, modifier: u64) -> bool {
        let modifier = if modifier == DRM_FORMAT_MOD_INVALID {
            DRM_FORMAT_MOD_LINEAR
        } else {
            modifier
        };
        if self.format_mods.is_empty() {
            return modifier == DRM_FORMAT_MOD_LINEAR && self.formats.contains(&format);
        }
        self.format_mods.contains(&(format, modifier))
    }

    pub(crate) fn claim(self: &Arc<Self>, crtc: &Crtc) -> Result<ClaimedPlane> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy(format!("plane {} already claimed", self.id)));
        }
        debug!(plane_id = self.id, crtc_id = crtc.id, "Claimed plane");
        Ok(ClaimedPlane {
            plane: Arc::clone(self),
            crtc_id: crtc.id,
        })
    }
}

/// Exclusive use of a plane on one CRTC, released on drop
#[derive(Debug)]
pub struct ClaimedPlane {
    plane: Arc<Plane>,
    crtc_id: u32,
}

impl ClaimedPlane {
    pub fn crtc_id(&self) -> u32 {
        self.crtc_id
    }
}

impl Deref for ClaimedPlane {
    type Target = Plane;

    fn deref(&self) -> &Plane {
        &self.plane
    }
}

impl Drop for ClaimedPlane {
    fn drop(&mut self) {
        self.plane.claimed.store(false, Ordering::Release);
        debug!(plane_id = self.plane.id, "Released plane");
    }
}

#[derive(Debug)]
pub struct Crtc {
    id: u32,
    index: u32,
    mode: Option<DrmModeModeinfo>,
    props: ObjectProps,
    mode_blob: Mutex<Option<Blob>>,
}

impl Crtc {
    pub(crate) fn discover(core: &DeviceCore, id: u32, index: u32) -> Result<Self> {
        let info = core.device.crtc(id)?;
        let props = ObjectProps::load(core, id, DRM_MODE_OBJECT_CRTC)?;
        debug!(
            crtc_id = id,
            index,
            mode = %info.mode.map(|m| m.name()).unwrap_or_default(),
            "Discovered CRTC"
        );
        Ok(Self {
            id,
            index,
            mode: info.mode,
            props,
            mode_blob: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Position in the resource list, the bit used by `possible_crtcs`
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Mode active when the CRTC was discovered
    pub fn mode(&self) -> Option<&DrmModeModeinfo> {
        self.mode.as_ref()
    }

    pub fn width(&self) -> u32 {
        self.mode.map_or(0, |m| m.hdisplay as u32)
    }

    pub fn height(&self) -> u32 {
        self.mode.map_or(0, |m| m.vdisplay as u32)
    }

    pub fn props(&self) -> &ObjectProps {
        &self.props
    }

    pub(crate) fn mode_blob(&self) -> MutexGuard<'_, Option<Blob>> {
        lock_slot(&self.mode_blob)
    }
}

const CONNECTOR_TYPE_NAMES: &[&str] = &[
    "Unknown", "VGA", "DVI-I", "DVI-D", "DVI-A", "Composite", "SVIDEO", "LVDS", "Component",
    "DIN", "DP", "HDMI-A", "HDMI-B", "TV", "eDP", "Virtual", "DSI", "DPI", "Writeback", "SPI",
    "USB",
];

#[derive(Debug)]
pub struct Connector {
    id: u32,
    connector_type: u32,
    connector_type_id: u32,
    connected: bool,
    mm_width: u32,
    mm_height: u32,
    modes: Vec<DrmModeModeinfo>,
    possible_crtcs: u32,
    props: ObjectProps,
    hdr_blob: Mutex<Option<Blob>>,
}

impl Connector {
    pub(crate) fn discover(core: &DeviceCore, id: u32) -> Result<Self> {
        let info = core.device.connector(id)?;
        let props = ObjectProps::load(core, id, DRM_MODE_OBJECT_CONNECTOR)?;

        let mut possible_crtcs = 0;
        for enc in &info.encoders {
            match core.device.encoder(*enc) {
                Ok(e) => possible_crtcs |= e.possible_crtcs,
                Err(e) => warn!(encoder_id = enc, error = %e, "Failed to read encoder"),
            }
        }

        let conn = Self {
            id,
            connector_type: info.connector_type,
            connector_type_id: info.connector_type_id,
            connected: info.connected,
            mm_width: info.mm_width,
            mm_height: info.mm_height,
            modes: info.modes,
            possible_crtcs,
            props,
            hdr_blob: Mutex::new(None),
        };
        debug!(
            connector_id = id,
            name = %conn.name(),
            connected = conn.connected,
            modes = conn.modes.len(),
            "Discovered connector"
        );
        Ok(conn)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Kernel style name, e.g. `HDMI-A-1`
    pub fn name(&self) -> String {
        let kind = CONNECTOR_TYPE_NAMES
            .get(self.connector_type as usize)
            .copied()
            .unwrap_or("Unknown");
        format!("{}-{}", kind, self.connector_type_id)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Physical size in millimetres
    pub fn size_mm(&self) -> (u32, u32) {
        (self.mm_width, self.mm_height)
    }

    pub fn modes(&self) -> &[DrmModeModeinfo] {
        &self.modes
    }

    pub fn preferred_mode(&self) -> Option<&DrmModeModeinfo> {
        self.modes
            .iter()
            .find(|m| m.type_ & DRM_MODE_TYPE_PREFERRED != 0)
            .or_else(|| self.modes.first())
    }

    pub fn can_use_crtc(&self, crtc: &Crtc) -> bool {
        crtc.index < 32 && self.possible_crtcs & (1 << crtc.index) != 0
    }

    pub fn props(&self) -> &ObjectProps {
        &self.props
    }

    pub(crate) fn hdr_blob(&self) -> MutexGuard<'_, Option<Blob>> {
        lock_slot(&self.hdr_blob)
    }
}

/// Human readable list of a plane's formats, for logs
pub fn format_list(plane: &Plane) -> String {
    plane
        .formats
        .iter()
        .map(|f| fourcc_string(*f))
        .collect::<Vec<_>>()
        .join(",")
}
