//! Framebuffers
//!
//! A [`Framebuffer`] is a registered kernel FB plus everything it owns: the
//! BOs behind its planes, an optional CPU mapping and an optional upstream
//! owner object that must outlive the scanout. [`Fb`] is the shared handle
//! passed around and attached to atomic requests.
//!
//! When the last [`Fb`] goes away its pre-delete hook, if any, gets the
//! framebuffer first and may keep it alive (this is how pools recycle FBs);
//! otherwise it is removed from the kernel and its BOs released.

use crate::bo::BufferObject;
use crate::device::{FbRequest, Mapping};
use crate::env::{DeviceCore, Environment};
use crate::fourcc::*;
use crate::rect::Rect;
use crate::{Error, Result};
use std::any::Any;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/// Static HDR metadata, laid out as the kernel's `hdr_output_metadata`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrMetadata {
    pub eotf: u8,
    pub metadata_type: u8,
    /// (x, y) in units of 0.00002
    pub display_primaries: [(u16, u16); 3],
    pub white_point: (u16, u16),
    /// cd/m^2
    pub max_display_mastering_luminance: u16,
    /// units of 0.0001 cd/m^2
    pub min_display_mastering_luminance: u16,
    pub max_cll: u16,
    pub max_fall: u16,
}

/// EOTF codes of the HDMI static metadata infoframe
pub const HDMI_EOTF_TRADITIONAL_GAMMA_SDR: u8 = 0;
pub const HDMI_EOTF_SMPTE_ST2084: u8 = 2;
pub const HDMI_EOTF_BT_2100_HLG: u8 = 3;

/// Largest framebuffer side accepted, the usual `mode_config` maximum
pub const MAX_FB_DIM: u32 = 16384;

fn check_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width > MAX_FB_DIM || height > MAX_FB_DIM {
        return Err(Error::InvalidValue(format!("{}x{} framebuffer", width, height)));
    }
    Ok(())
}

impl HdrMetadata {
    /// Blob payload for `HDR_OUTPUT_METADATA`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        // metadata_type: HDMI_STATIC_METADATA_TYPE1
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.push(self.eotf);
        out.push(self.metadata_type);
        let mut push = |v: u16| out.extend_from_slice(&v.to_ne_bytes());
        for (x, y) in self.display_primaries {
            push(x);
            push(y);
        }
        push(self.white_point.0);
        push(self.white_point.1);
        push(self.max_display_mastering_luminance);
        push(self.min_display_mastering_luminance);
        push(self.max_cll);
        push(self.max_fall);
        // struct is 4 byte aligned
        out.resize(32, 0);
        out
    }
}

/// Colour tags carried to the plane and connector at commit time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorInfo {
    /// Plane `COLOR_ENCODING` enum name
    pub encoding: Option<String>,
    /// Plane `COLOR_RANGE` enum name
    pub range: Option<String>,
    /// Connector `Colorspace` enum name
    pub colorspace: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct FbMeta {
    /// 16.16, relative to `active`
    crop: Rect,
    active: Rect,
    color: ColorInfo,
    hdr: Option<HdrMetadata>,
    blend_mode: Option<String>,
}

/// Decides what happens to a framebuffer whose last reference was dropped
pub trait PreDeleteHook: Send + Sync {
    fn on_would_destroy(&self, fb: Framebuffer) -> Disposition;
}

pub enum Disposition {
    /// The hook kept the framebuffer
    Resurrected,
    /// Destroy it now
    Proceed(Framebuffer),
}

/// One memory object of an external buffer
#[derive(Debug, Clone, Copy)]
pub struct DmaBufObject {
    pub fd: RawFd,
    pub size: usize,
    pub modifier: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DmaBufPlane {
    pub object_index: usize,
    pub pitch: u32,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct DmaBufLayer {
    pub format: u32,
    pub planes: Vec<DmaBufPlane>,
}

/// Externally allocated multi-object, multi-plane buffer
#[derive(Debug, Clone)]
pub struct DmaBufDescriptor {
    pub width: u32,
    pub height: u32,
    pub objects: Vec<DmaBufObject>,
    pub layers: Vec<DmaBufLayer>,
}

/// A kernel framebuffer and the resources behind it
pub struct Framebuffer {
    core: Arc<DeviceCore>,
    id: u32,
    width: u32,
    height: u32,
    format: u32,
    modifier: u64,
    plane_count: usize,
    pitches: [u32; 4],
    offsets: [u32; 4],
    plane_bo: [usize; 4],
    meta: Mutex<FbMeta>,
    // Drop order matters: unmap, then release BOs, then the owner
    map: Option<Mutex<Mapping>>,
    bos: Vec<BufferObject>,
    owner: Option<Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &fourcc_string(self.format))
            .field("modifier", &format_args!("{:#x}", self.modifier))
            .finish()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Err(e) = self.core.device.rm_fb(self.id) {
            warn!(fb_id = self.id, error = %e, "RMFB failed");
        }
        debug!(fb_id = self.id, "Destroyed framebuffer");
    }
}

fn align64(v: u32) -> u32 {
    (v + 63) & !63
}

fn addfb_error(format: u32, modifier: u64, e: std::io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::EINVAL) | Some(libc::ERANGE) => {
            Error::format(format, modifier, format!("ADDFB2 rejected: {}", e))
        }
        _ => Error::Alloc(format!("ADDFB2: {}", e)),
    }
}

impl Framebuffer {
    fn lock_meta(&self) -> MutexGuard<'_, FbMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn meta_for(width: u32, height: u32) -> Mutex<FbMeta> {
        let active = Rect::wh(width, height);
        Mutex::new(FbMeta {
            crop: active.shl16(),
            active,
            ..Default::default()
        })
    }

    pub(crate) fn dumb(
        core: &Arc<DeviceCore>,
        width: u32,
        height: u32,
        format: u32,
        modifier: u64,
    ) -> Result<Self> {
        if modifier != DRM_FORMAT_MOD_LINEAR && modifier != DRM_FORMAT_MOD_INVALID {
            return Err(Error::format(format, modifier, "dumb buffers are linear only"));
        }
        let info = format_info(format)
            .ok_or_else(|| Error::format(format, modifier, "no plane layout known"))?;
        check_size(width, height)?;

        let aw = align64(width);
        let ah = align64(height);
        let bo = BufferObject::dumb_core(core, aw, info.total_height(ah), info.bpp)?;
        let pitch0 = bo.pitch().unwrap_or(aw * info.bpp / 8);
        let size = bo.size().unwrap_or(0) as usize;

        let map = core.device.map_dumb(bo.handle(), size).map_err(|e| {
            error!(handle = bo.handle(), size, error = %e, "Dumb buffer map failed");
            Error::Alloc(format!("map dumb: {}", e))
        })?;

        let (pitches, offsets) = info.plane_offsets(pitch0, ah);
        let n = info.plane_count();
        let mut handles = [0u32; 4];
        for h in handles.iter_mut().take(n) {
            *h = bo.handle();
        }

        let req = FbRequest {
            width: aw,
            height: ah,
            format,
            handles,
            pitches,
            offsets,
            modifiers: None,
        };
        let id = core.device.add_fb2(&req).map_err(|e| {
            error!(format = %fourcc_string(format), error = %e, "ADDFB2 of dumb buffer failed");
            addfb_error(format, modifier, e)
        })?;

        debug!(
            fb_id = id,
            "Create dumb {}x{} / {}x{} {} size: {}",
            aw,
            ah,
            width,
            height,
            fourcc_string(format),
            size
        );

        Ok(Self {
            core: Arc::clone(core),
            id,
            width: aw,
            height: ah,
            format,
            modifier: DRM_FORMAT_MOD_LINEAR,
            plane_count: n,
            pitches,
            offsets,
            plane_bo: [0; 4],
            meta: Self::meta_for(width, height),
            map: Some(Mutex::new(map)),
            bos: vec![bo],
            owner: None,
        })
    }

    pub(crate) fn imported(
        core: &Arc<DeviceCore>,
        desc: &DmaBufDescriptor,
        owner: Option<Box<dyn Any + Send + Sync>>,
    ) -> Result<Self> {
        check_size(desc.width, desc.height)?;
        if desc.objects.is_empty() || desc.objects.len() > 4 {
            return Err(Error::InvalidValue(format!(
                "{} objects in descriptor",
                desc.objects.len()
            )));
        }
        let planes: Vec<DmaBufPlane> = desc
            .layers
            .iter()
            .flat_map(|l| l.planes.iter().copied())
            .collect();
        if planes.is_empty() || planes.len() > 4 {
            return Err(Error::InvalidValue(format!("{} planes in descriptor", planes.len())));
        }
        if let Some(p) = planes.iter().find(|p| p.object_index >= desc.objects.len()) {
            return Err(Error::InvalidValue(format!(
                "plane references object {} of {}",
                p.object_index,
                desc.objects.len()
            )));
        }

        let layer_formats: Vec<u32> = desc.layers.iter().map(|l| l.format).collect();
        let modifier = desc.objects[planes[0].object_index].modifier;
        let format = format_from_layers(&layer_formats).ok_or_else(|| {
            let first = layer_formats.first().copied().unwrap_or(0);
            Error::format(first, modifier, "layer combination has no single format")
        })?;
        if let Some(info) = format_info(format) {
            if info.plane_count() != planes.len() {
                return Err(Error::format(
                    format,
                    modifier,
                    format!("{} planes given, format has {}", planes.len(), info.plane_count()),
                ));
            }
        }

        // Each object is imported exactly once; the BO table collapses
        // objects that turn out to be the same dma-buf
        let bos = desc
            .objects
            .iter()
            .map(|o| BufferObject::import_core(core, o.fd))
            .collect::<Result<Vec<_>>>()?;

        let mut req = FbRequest {
            width: desc.width,
            height: desc.height,
            format,
            ..Default::default()
        };
        let mut plane_bo = [0usize; 4];
        let mut mods = [0u64; 4];
        for (n, p) in planes.iter().enumerate() {
            req.handles[n] = bos[p.object_index].handle();
            req.pitches[n] = p.pitch;
            req.offsets[n] = p.offset;
            plane_bo[n] = p.object_index;
            mods[n] = desc.objects[p.object_index].modifier;
        }
        if mods[..planes.len()].iter().any(|m| *m != DRM_FORMAT_MOD_INVALID) {
            req.modifiers = Some(mods);
        }

        let id = core.device.add_fb2(&req).map_err(|e| {
            error!(
                format = %fourcc_string(format),
                modifier,
                error = %e,
                "ADDFB2 of imported buffer failed"
            );
            addfb_error(format, modifier, e)
        })?;

        debug!(
            fb_id = id,
            objects = bos.len(),
            planes = planes.len(),
            "Imported {}x{} {} mod {:#x}",
            desc.width,
            desc.height,
            fourcc_string(format),
            modifier
        );

        Ok(Self {
            core: Arc::clone(core),
            id,
            width: desc.width,
            height: desc.height,
            format,
            modifier,
            plane_count: planes.len(),
            pitches: req.pitches,
            offsets: req.offsets,
            plane_bo,
            meta: Self::meta_for(desc.width, desc.height),
            map: None,
            bos,
            owner,
        })
    }

    /// Kernel FB id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Allocated width, may exceed the active area
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn modifier(&self) -> u64 {
        self.modifier
    }

    pub fn is_yuv(&self) -> bool {
        format_info(self.format).map_or(false, |f| f.is_yuv)
    }

    pub fn plane_count(&self) -> usize {
        self.plane_count
    }

    pub fn pitch(&self, plane: usize) -> u32 {
        self.pitches.get(plane).copied().unwrap_or(0)
    }

    pub fn offset(&self, plane: usize) -> u32 {
        self.offsets.get(plane).copied().unwrap_or(0)
    }

    /// BO backing `plane`
    pub fn plane_bo(&self, plane: usize) -> Option<&BufferObject> {
        if plane >= self.plane_count {
            return None;
        }
        self.bos.get(self.plane_bo[plane])
    }

    /// One BO per descriptor object, in descriptor order
    ///
    /// Objects that resolve to the same dma-buf share a BO, so the same
    /// buffer can appear more than once.
    pub fn bos(&self) -> &[BufferObject] {
        &self.bos
    }

    pub fn owner(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.owner.as_deref()
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Visible region of the allocation, in pixels
    pub fn active(&self) -> Rect {
        self.lock_meta().active
    }

    /// Set the crop in pixels, relative to the active area
    pub fn crop_set(&self, crop: Rect) -> Result<()> {
        let mut meta = self.lock_meta();
        let bounds = Rect::wh(meta.active.w, meta.active.h);
        if crop.is_empty() || !bounds.contains(&crop) {
            return Err(Error::InvalidValue(format!(
                "crop {:?} outside {}x{}",
                crop, bounds.w, bounds.h
            )));
        }
        meta.crop = crop.shl16();
        Ok(())
    }

    /// Crop in pixels, relative to the active area
    pub fn crop_get(&self) -> Rect {
        self.lock_meta().crop.shr16_rnd()
    }

    /// Set the crop in 16.16 fixed point, relative to the active area
    pub fn crop_frac_set(&self, crop: Rect) -> Result<()> {
        let mut meta = self.lock_meta();
        let bounds = Rect::wh(meta.active.w, meta.active.h).shl16();
        if crop.is_empty() || !bounds.contains(&crop) {
            return Err(Error::InvalidValue(format!("crop {:?} out of range", crop)));
        }
        meta.crop = crop;
        Ok(())
    }

    pub fn crop_frac(&self) -> Rect {
        self.lock_meta().crop
    }

    /// Source rect for the plane: crop offset by the active area, 16.16
    pub fn src_rect(&self) -> Rect {
        let meta = self.lock_meta();
        meta.crop.add_xy(meta.active.shl16())
    }

    /// Shrink the active area for reuse at a new size; crop resets to all of it
    pub(crate) fn reset_active(&self, width: u32, height: u32) {
        let mut meta = self.lock_meta();
        meta.active = Rect::wh(width, height);
        meta.crop = meta.active.shl16();
    }

    /// Attach colour tags and static HDR metadata
    ///
    /// Returns true if the HDR metadata changed. Identical metadata, compared
    /// byte for byte, leaves the FB untouched so the connector blob is reused.
    pub fn color_metadata_set(&self, color: ColorInfo, hdr: Option<HdrMetadata>) -> bool {
        let mut meta = self.lock_meta();
        meta.color = color;
        let same = match (&meta.hdr, &hdr) {
            (Some(a), Some(b)) => a.to_bytes() == b.to_bytes(),
            (None, None) => true,
            _ => false,
        };
        if !same {
            meta.hdr = hdr;
        }
        !same
    }

    pub fn color_info(&self) -> ColorInfo {
        self.lock_meta().color.clone()
    }

    pub fn hdr_metadata(&self) -> Option<HdrMetadata> {
        self.lock_meta().hdr
    }

    /// `pixel blend mode` enum name applied with the FB
    pub fn blend_mode_set(&self, mode: Option<&str>) {
        self.lock_meta().blend_mode = mode.map(str::to_string);
    }

    pub fn blend_mode(&self) -> Option<String> {
        self.lock_meta().blend_mode.clone()
    }

    /// Locked CPU access to a dumb FB's memory; `None` for imported FBs
    pub fn write(&self) -> Option<FbWriter<'_>> {
        let map = self.map.as_ref()?;
        Some(FbWriter {
            fb: self,
            map: map.lock().unwrap_or_else(PoisonError::into_inner),
        })
    }
}

/// Write access to a mapped framebuffer
pub struct FbWriter<'a> {
    fb: &'a Framebuffer,
    map: MutexGuard<'a, Mapping>,
}

impl FbWriter<'_> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.map.as_mut_slice()
    }

    /// Bytes of one plane, `pitch * rows` long
    pub fn plane_mut(&mut self, plane: usize) -> Option<&mut [u8]> {
        if plane >= self.fb.plane_count {
            return None;
        }
        let info = format_info(self.fb.format)?;
        let start = self.fb.offsets[plane] as usize;
        let len = self.fb.pitches[plane] as usize * info.plane_height(plane, self.fb.height) as usize;
        self.map.as_mut_slice().get_mut(start..start + len)
    }

    /// Fill every plane with one byte value
    pub fn fill(&mut self, value: u8) {
        self.map.as_mut_slice().fill(value);
    }
}

struct FbShared {
    body: ManuallyDrop<Framebuffer>,
    hook: Option<Arc<dyn PreDeleteHook>>,
}

impl Drop for FbShared {
    fn drop(&mut self) {
        // SAFETY: body is taken exactly once, here, and never touched again
        let body = unsafe { ManuallyDrop::take(&mut self.body) };
        // The hook is consumed, so a resurrected FB never loops back here
        match self.hook.take() {
            Some(hook) => {
                if let Disposition::Proceed(body) = hook.on_would_destroy(body) {
                    drop(body);
                }
            }
            None => drop(body),
        }
    }
}

/// Shared handle to a [`Framebuffer`]
#[derive(Clone)]
pub struct Fb {
    shared: Arc<FbShared>,
}

impl fmt::Debug for Fb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.shared.body, f)
    }
}

impl Deref for Fb {
    type Target = Framebuffer;

    fn deref(&self) -> &Framebuffer {
        &self.shared.body
    }
}

impl Fb {
    /// CPU-writable FB; the allocation is rounded up to 64 pixels each way
    pub fn new_dumb(env: &Environment, width: u32, height: u32, format: u32) -> Result<Fb> {
        Self::new_dumb_mod(env, width, height, format, DRM_FORMAT_MOD_LINEAR)
    }

    pub fn new_dumb_mod(
        env: &Environment,
        width: u32,
        height: u32,
        format: u32,
        modifier: u64,
    ) -> Result<Fb> {
        let body = Framebuffer::dumb(env.core(), width, height, format, modifier)?;
        Ok(Self::wrap(body, None))
    }

    /// Wrap an external buffer; `owner` is dropped only after the FB is destroyed
    pub fn new_imported(
        env: &Environment,
        desc: &DmaBufDescriptor,
        owner: Option<Box<dyn Any + Send + Sync>>,
    ) -> Result<Fb> {
        let body = Framebuffer::imported(env.core(), desc, owner)?;
        Ok(Self::wrap(body, None))
    }

    pub(crate) fn wrap(body: Framebuffer, hook: Option<Arc<dyn PreDeleteHook>>) -> Fb {
        Fb {
            shared: Arc::new(FbShared {
                body: ManuallyDrop::new(body),
                hook,
            }),
        }
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub fn ptr_eq(&self, other: &Fb) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
