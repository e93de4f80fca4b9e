//! Raw DRM/KMS kernel ABI
//!
//! Struct layouts and request numbers from `drm.h` and `drm_mode.h`. Sizes are
//! taken from the `#[repr(C)]` definitions so the encoded request numbers
//! always match the structs passed with them.

use std::io;
use std::mem::size_of;
use std::os::raw::{c_char, c_ulong, c_void};
use std::os::unix::io::RawFd;

// DRM ioctl command numbers (from drm.h and drm_mode.h)
const DRM_IOCTL_BASE: c_ulong = 0x64; // 'd'

const fn drm_iowr(nr: c_ulong, size: usize) -> c_ulong {
    // _IOWR('d', nr, size) = _IOC(_IOC_READ|_IOC_WRITE, 'd', nr, size)
    (3 << 30) | (DRM_IOCTL_BASE << 8) | nr | ((size as c_ulong) << 16)
}

const fn drm_iow(nr: c_ulong, size: usize) -> c_ulong {
    // _IOW('d', nr, size) = _IOC(_IOC_WRITE, 'd', nr, size)
    (1 << 30) | (DRM_IOCTL_BASE << 8) | nr | ((size as c_ulong) << 16)
}

pub const DRM_IOCTL_GEM_CLOSE: c_ulong = drm_iow(0x09, size_of::<DrmGemClose>());
pub const DRM_IOCTL_GET_CAP: c_ulong = drm_iowr(0x0c, size_of::<DrmGetCap>());
pub const DRM_IOCTL_SET_CLIENT_CAP: c_ulong = drm_iow(0x0d, size_of::<DrmSetClientCap>());
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: c_ulong = drm_iowr(0x2e, size_of::<DrmPrimeHandle>());

pub const DRM_IOCTL_MODE_GETRESOURCES: c_ulong = drm_iowr(0xa0, size_of::<DrmModeCardRes>());
pub const DRM_IOCTL_MODE_GETCRTC: c_ulong = drm_iowr(0xa1, size_of::<DrmModeCrtc>());
pub const DRM_IOCTL_MODE_GETENCODER: c_ulong = drm_iowr(0xa6, size_of::<DrmModeGetEncoder>());
pub const DRM_IOCTL_MODE_GETCONNECTOR: c_ulong = drm_iowr(0xa7, size_of::<DrmModeGetConnector>());
pub const DRM_IOCTL_MODE_GETPROPERTY: c_ulong = drm_iowr(0xaa, size_of::<DrmModeGetProperty>());
pub const DRM_IOCTL_MODE_GETPROPBLOB: c_ulong = drm_iowr(0xac, size_of::<DrmModeGetBlob>());
pub const DRM_IOCTL_MODE_RMFB: c_ulong = drm_iowr(0xaf, size_of::<u32>());
pub const DRM_IOCTL_MODE_CREATE_DUMB: c_ulong = drm_iowr(0xb2, size_of::<DrmModeCreateDumb>());
pub const DRM_IOCTL_MODE_MAP_DUMB: c_ulong = drm_iowr(0xb3, size_of::<DrmModeMapDumb>());
pub const DRM_IOCTL_MODE_DESTROY_DUMB: c_ulong = drm_iowr(0xb4, size_of::<DrmModeDestroyDumb>());
pub const DRM_IOCTL_MODE_GETPLANERESOURCES: c_ulong =
    drm_iowr(0xb5, size_of::<DrmModeGetPlaneRes>());
pub const DRM_IOCTL_MODE_GETPLANE: c_ulong = drm_iowr(0xb6, size_of::<DrmModeGetPlane>());
pub const DRM_IOCTL_MODE_ADDFB2: c_ulong = drm_iowr(0xb8, size_of::<DrmModeFbCmd2>());
pub const DRM_IOCTL_MODE_OBJ_GETPROPERTIES: c_ulong =
    drm_iowr(0xb9, size_of::<DrmModeObjGetProperties>());
pub const DRM_IOCTL_MODE_ATOMIC: c_ulong = drm_iowr(0xbc, size_of::<DrmModeAtomic>());
pub const DRM_IOCTL_MODE_CREATEPROPBLOB: c_ulong = drm_iowr(0xbd, size_of::<DrmModeCreateBlob>());
pub const DRM_IOCTL_MODE_DESTROYPROPBLOB: c_ulong =
    drm_iowr(0xbe, size_of::<DrmModeDestroyBlob>());

/// Client capabilities
pub const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;
pub const DRM_CLIENT_CAP_ATOMIC: u64 = 3;

/// Device capabilities
pub const DRM_CAP_DUMB_BUFFER: u64 = 0x1;
pub const DRM_CAP_PRIME: u64 = 0x5;
pub const DRM_CAP_ADDFB2_MODIFIERS: u64 = 0x10;

/// Atomic / page flip flags
pub const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;
pub const DRM_MODE_PAGE_FLIP_ASYNC: u32 = 0x02;
pub const DRM_MODE_ATOMIC_TEST_ONLY: u32 = 0x0100;
pub const DRM_MODE_ATOMIC_NONBLOCK: u32 = 0x0200;
pub const DRM_MODE_ATOMIC_ALLOW_MODESET: u32 = 0x0400;

/// ADDFB2 flags
pub const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

/// Object types
pub const DRM_MODE_OBJECT_CRTC: u32 = 0xcccc_cccc;
pub const DRM_MODE_OBJECT_CONNECTOR: u32 = 0xc0c0_c0c0;
pub const DRM_MODE_OBJECT_ENCODER: u32 = 0xe0e0_e0e0;
pub const DRM_MODE_OBJECT_PLANE: u32 = 0xeeee_eeee;
pub const DRM_MODE_OBJECT_FB: u32 = 0xfbfb_fbfb;
pub const DRM_MODE_OBJECT_BLOB: u32 = 0xbbbb_bbbb;
pub const DRM_MODE_OBJECT_ANY: u32 = 0;

/// Property flags
pub const DRM_MODE_PROP_RANGE: u32 = 1 << 1;
pub const DRM_MODE_PROP_IMMUTABLE: u32 = 1 << 2;
pub const DRM_MODE_PROP_ENUM: u32 = 1 << 3;
pub const DRM_MODE_PROP_BLOB: u32 = 1 << 4;
pub const DRM_MODE_PROP_BITMASK: u32 = 1 << 5;
pub const DRM_MODE_PROP_EXTENDED_TYPE: u32 = 0x0000_ffc0;
pub const DRM_MODE_PROP_OBJECT: u32 = 1 << 6;
pub const DRM_MODE_PROP_SIGNED_RANGE: u32 = 2 << 6;
pub const DRM_MODE_PROP_ATOMIC: u32 = 0x8000_0000;

pub const DRM_PROP_NAME_LEN: usize = 32;
pub const DRM_DISPLAY_MODE_LEN: usize = 32;

/// Connection status
pub const DRM_MODE_CONNECTED: u32 = 1;

/// Mode type bits
pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
pub const DRM_MODE_TYPE_DRIVER: u32 = 1 << 6;

/// Event types read from the device fd
pub const DRM_EVENT_VBLANK: u32 = 0x01;
pub const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmGemClose {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmGetCap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmSetClientCap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmPrimeHandle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

// drm_mode_card_res struct (for DRM_IOCTL_MODE_GETRESOURCES)
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeCardRes {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

/// `drm_mode_modeinfo`: also the payload of a CRTC `MODE_ID` blob
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrmModeModeinfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [c_char; DRM_DISPLAY_MODE_LEN],
}

impl DrmModeModeinfo {
    /// Bytes of the struct as stored in a `MODE_ID` blob
    pub fn to_bytes(&self) -> Vec<u8> {
        // SAFETY: repr(C) with no padding (4 + 10 * 2 + 3 * 4 + 32 bytes)
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>())
        }
        .to_vec()
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked; every bit pattern is a valid modeinfo
        Some(unsafe { std::ptr::read_unaligned(b.as_ptr() as *const Self) })
    }

    pub fn name(&self) -> String {
        name_from_c(&self.name)
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeCrtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: DrmModeModeinfo,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeGetEncoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeGetConnector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug)]
pub struct DrmModeGetProperty {
    pub values_ptr: u64,
    pub enum_blob_ptr: u64,
    pub prop_id: u32,
    pub flags: u32,
    pub name: [c_char; DRM_PROP_NAME_LEN],
    pub count_values: u32,
    pub count_enum_blobs: u32,
}

impl Default for DrmModeGetProperty {
    fn default() -> Self {
        Self {
            values_ptr: 0,
            enum_blob_ptr: 0,
            prop_id: 0,
            flags: 0,
            name: [0; DRM_PROP_NAME_LEN],
            count_values: 0,
            count_enum_blobs: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DrmModePropertyEnum {
    pub value: u64,
    pub name: [c_char; DRM_PROP_NAME_LEN],
}

impl Default for DrmModePropertyEnum {
    fn default() -> Self {
        Self {
            value: 0,
            name: [0; DRM_PROP_NAME_LEN],
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeGetBlob {
    pub blob_id: u32,
    pub length: u32,
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeCreateDumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeMapDumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeDestroyDumb {
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeGetPlaneRes {
    pub plane_id_ptr: u64,
    pub count_planes: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeGetPlane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub gamma_size: u32,
    pub count_format_types: u32,
    pub format_type_ptr: u64,
}

// drm_mode_fb_cmd2 struct (for ADDFB2)
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeFbCmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeObjGetProperties {
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_props: u32,
    pub obj_id: u32,
    pub obj_type: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeAtomic {
    pub flags: u32,
    pub count_objs: u32,
    pub objs_ptr: u64,
    pub count_props_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub reserved: u64,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeCreateBlob {
    pub data: u64,
    pub length: u32,
    pub blob_id: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeDestroyBlob {
    pub blob_id: u32,
}

/// Header of every event read from the device fd
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmEvent {
    pub type_: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmEventVblank {
    pub base: DrmEvent,
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    pub crtc_id: u32,
}

/// Header of an `IN_FORMATS` plane property blob
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmFormatModifierBlob {
    pub version: u32,
    pub flags: u32,
    pub count_formats: u32,
    pub formats_offset: u32,
    pub count_modifiers: u32,
    pub modifiers_offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DrmFormatModifier {
    pub formats: u64,
    pub offset: u32,
    pub pad: u32,
    pub modifier: u64,
}

fn read_pod<T: Copy>(b: &[u8], at: usize) -> Option<T> {
    if at.checked_add(size_of::<T>())? > b.len() {
        return None;
    }
    // SAFETY: bounds checked; only used with plain integer structs
    Some(unsafe { std::ptr::read_unaligned(b[at..].as_ptr() as *const T) })
}

/// Decode an `IN_FORMATS` blob into (format, modifier) pairs
pub fn parse_in_formats(blob: &[u8]) -> Vec<(u32, u64)> {
    let mut out = Vec::new();
    let hdr: DrmFormatModifierBlob = match read_pod(blob, 0) {
        Some(h) => h,
        None => return out,
    };
    let formats: Vec<u32> = (0..hdr.count_formats as usize)
        .map_while(|i| read_pod(blob, hdr.formats_offset as usize + i * 4))
        .collect();
    for i in 0..hdr.count_modifiers as usize {
        let at = hdr.modifiers_offset as usize + i * size_of::<DrmFormatModifier>();
        let m: DrmFormatModifier = match read_pod(blob, at) {
            Some(m) => m,
            None => break,
        };
        for bit in 0..64 {
            if m.formats & (1u64 << bit) != 0 {
                if let Some(f) = formats.get(m.offset as usize + bit) {
                    out.push((*f, m.modifier));
                }
            }
        }
    }
    out
}

/// Build an `IN_FORMATS` blob; each modifier applies to the listed formats
pub fn encode_in_formats(formats: &[u32], modifiers: &[(u64, Vec<u32>)]) -> Vec<u8> {
    let hdr_len = size_of::<DrmFormatModifierBlob>();
    let fmt_len = formats.len() * 4;
    let mods_offset = (hdr_len + fmt_len + 7) & !7;
    let mut out = Vec::with_capacity(mods_offset + modifiers.len() * 24);

    let push32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_ne_bytes());
    let push64 = |out: &mut Vec<u8>, v: u64| out.extend_from_slice(&v.to_ne_bytes());

    push32(&mut out, 1);
    push32(&mut out, 0);
    push32(&mut out, formats.len() as u32);
    push32(&mut out, hdr_len as u32);
    push32(&mut out, modifiers.len() as u32);
    push32(&mut out, mods_offset as u32);
    for f in formats {
        push32(&mut out, *f);
    }
    out.resize(mods_offset, 0);

    for (modifier, applies) in modifiers {
        let mut mask = 0u64;
        for (i, f) in formats.iter().take(64).enumerate() {
            if applies.contains(f) {
                mask |= 1 << i;
            }
        }
        push64(&mut out, mask);
        push32(&mut out, 0);
        push32(&mut out, 0);
        push64(&mut out, *modifier);
    }
    out
}

/// Issue a DRM ioctl, restarting on `EINTR`/`EAGAIN` as libdrm's drmIoctl does
///
/// # Safety
/// `arg` must point to the struct type encoded in `request`, and any user
/// pointers inside it must be valid for the sizes given.
pub unsafe fn drm_ioctl<T>(fd: RawFd, request: c_ulong, arg: &mut T) -> io::Result<()> {
    loop {
        let ret = libc::ioctl(fd, request as _, arg as *mut T as *mut c_void);
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

/// Copy a NUL padded kernel name field into a `String`
pub fn name_from_c(name: &[c_char]) -> String {
    let bytes: Vec<u8> = name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Fill a fixed kernel name field from a `&str`, truncating if needed
pub fn name_to_c<const N: usize>(s: &str) -> [c_char; N] {
    let mut out = [0 as c_char; N];
    for (dst, src) in out.iter_mut().zip(s.bytes().take(N - 1)) {
        *dst = src as c_char;
    }
    out
}

/// Parse a buffer of events read from the device fd
///
/// Returns the vblank/flip events it contains; unknown event types are skipped.
pub fn parse_events(buf: &[u8]) -> Vec<(u32, DrmEventVblank)> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + size_of::<DrmEvent>() <= buf.len() {
        // SAFETY: bounds checked above; read_unaligned copes with any alignment
        let hdr: DrmEvent = unsafe { std::ptr::read_unaligned(buf[pos..].as_ptr() as *const _) };
        let len = hdr.length as usize;
        if len < size_of::<DrmEvent>() || pos + len > buf.len() {
            break;
        }
        if (hdr.type_ == DRM_EVENT_FLIP_COMPLETE || hdr.type_ == DRM_EVENT_VBLANK)
            && len >= size_of::<DrmEventVblank>()
        {
            // SAFETY: length checked against the event struct size
            let ev: DrmEventVblank =
                unsafe { std::ptr::read_unaligned(buf[pos..].as_ptr() as *const _) };
            out.push((hdr.type_, ev));
        }
        pos += len;
    }
    out
}

/// Serialise an event the way the kernel lays it out on the fd
pub fn encode_event(type_: u32, user_data: u64, sequence: u32, crtc_id: u32) -> Vec<u8> {
    let ev = DrmEventVblank {
        base: DrmEvent {
            type_,
            length: size_of::<DrmEventVblank>() as u32,
        },
        user_data,
        tv_sec: 0,
        tv_usec: 0,
        sequence,
        crtc_id,
    };
    let mut out = vec![0u8; size_of::<DrmEventVblank>()];
    // SAFETY: out is exactly the size of the event struct
    unsafe { std::ptr::write_unaligned(out.as_mut_ptr() as *mut DrmEventVblank, ev) };
    out
}
