//! The kernel KMS surface the resource manager is built on
//!
//! [`KmsDevice`] covers exactly the ioctls the core issues: GEM handle import
//! and close, dumb buffer create/map/destroy, ADDFB2/RMFB, property and blob
//! queries, atomic commit, plus reading completion events off the fd.
//! [`Card`] talks to a real `/dev/dri/cardN` node; [`VirtualDevice`] is an
//! in-memory device with the same semantics.

pub mod card;
pub mod virtual_device;

pub use card::Card;
pub use virtual_device::{VirtualConfig, VirtualDevice};

use crate::ioctl::DrmModeModeinfo;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Result of a dumb buffer allocation; pitch and size are what the kernel chose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// Arguments for ADDFB2
#[derive(Debug, Clone, Default)]
pub struct FbRequest {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    /// Per plane modifiers; `None` registers without DRM_MODE_FB_MODIFIERS
    pub modifiers: Option<[u64; 4]>,
}

/// One enum/bitmask entry of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropEnumEntry {
    pub name: String,
    pub value: u64,
}

/// Kernel description of a property (GETPROPERTY)
#[derive(Debug, Clone, Default)]
pub struct PropertyInfo {
    pub id: u32,
    pub name: String,
    pub flags: u32,
    /// Range bounds for range properties, object type for object properties
    pub values: Vec<u64>,
    pub enums: Vec<PropEnumEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PlaneInfo {
    pub id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct CrtcInfo {
    pub id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub mode: Option<DrmModeModeinfo>,
}

#[derive(Debug, Clone, Default)]
pub struct EncoderInfo {
    pub id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connected: bool,
    pub mm_width: u32,
    pub mm_height: u32,
    pub encoder_id: u32,
    pub encoders: Vec<u32>,
    pub modes: Vec<DrmModeModeinfo>,
}

/// A flattened atomic request in the shape DRM_IOCTL_MODE_ATOMIC takes
#[derive(Debug, Clone, Default)]
pub struct AtomicRequest {
    pub objs: Vec<u32>,
    pub count_props: Vec<u32>,
    pub props: Vec<u32>,
    pub values: Vec<u64>,
}

impl AtomicRequest {
    /// Iterate (object, property, value) triples in submission order
    pub fn triples(&self) -> impl Iterator<Item = (u32, u32, u64)> + '_ {
        let mut out = Vec::with_capacity(self.props.len());
        let mut n = 0usize;
        for (obj, count) in self.objs.iter().zip(&self.count_props) {
            for _ in 0..*count {
                out.push((*obj, self.props[n], self.values[n]));
                n += 1;
            }
        }
        out.into_iter()
    }
}

/// Completion event read from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc_id: u32,
    pub sequence: u32,
    pub user_data: u64,
}

/// A shared CPU mapping of device memory, unmapped on drop
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; access goes through &mut self or
// a lock held by the owner
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// mmap `len` bytes of `fd` at `offset`, read/write shared
    pub fn new(fd: RawFd, offset: u64, len: usize) -> io::Result<Self> {
        // SAFETY: a fresh mapping is requested; the kernel validates fd and offset
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr as *mut u8)
            .map(|ptr| Self { ptr, len })
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self gives exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region returned by mmap
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// The ioctl surface of a KMS device
///
/// Errors are the raw `io::Error` with the kernel errno; callers decide which
/// typed error a failure becomes.
pub trait KmsDevice: Send + Sync {
    /// fd to poll for completion events
    fn event_fd(&self) -> RawFd;

    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32>;
    fn gem_close(&self, handle: u32) -> io::Result<()>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer>;
    fn map_dumb(&self, handle: u32, size: usize) -> io::Result<Mapping>;
    fn destroy_dumb(&self, handle: u32) -> io::Result<()>;

    fn add_fb2(&self, req: &FbRequest) -> io::Result<u32>;
    fn rm_fb(&self, fb_id: u32) -> io::Result<()>;

    fn create_blob(&self, data: &[u8]) -> io::Result<u32>;
    fn destroy_blob(&self, blob_id: u32) -> io::Result<()>;
    fn blob_data(&self, blob_id: u32) -> io::Result<Vec<u8>>;

    fn resources(&self) -> io::Result<Resources>;
    fn plane_ids(&self) -> io::Result<Vec<u32>>;
    fn plane(&self, id: u32) -> io::Result<PlaneInfo>;
    fn crtc(&self, id: u32) -> io::Result<CrtcInfo>;
    fn encoder(&self, id: u32) -> io::Result<EncoderInfo>;
    fn connector(&self, id: u32) -> io::Result<ConnectorInfo>;

    /// (property id, current value) pairs of an object
    fn object_properties(&self, obj_id: u32, obj_type: u32) -> io::Result<Vec<(u32, u64)>>;
    fn property(&self, prop_id: u32) -> io::Result<PropertyInfo>;

    fn atomic_commit(&self, flags: u32, req: &AtomicRequest, user_data: u64) -> io::Result<()>;

    /// Drain pending completion events; `Ok(vec![])` when none are ready
    fn read_events(&self) -> io::Result<Vec<FlipEvent>>;
}
