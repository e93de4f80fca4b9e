//! In-memory KMS device
//!
//! Behaves like a single-output atomic driver closely enough for the
//! resource manager to be driven end to end without hardware: dumb buffers
//! are memfd backed and really mappable, dma-buf imports are de-duplicated by
//! inode the way the kernel de-duplicates GEM handles, atomic commits are
//! validated against the property table and page flips complete when the
//! test calls [`VirtualDevice::complete_flips`], which also makes the
//! event fd readable.
//!
//! # DRM Object IDs
//! - Connector: 1
//! - Encoder: 5
//! - CRTC: 10
//! - Primary Plane: 20
//! - Cursor Plane: 21
//! - Overlay Planes: 22+
//! - Framebuffers: 100+
//! - Properties: 1000+
//! - Blobs: 5000+

use super::{
    AtomicRequest, ConnectorInfo, CrtcInfo, DumbBuffer, EncoderInfo, FbRequest, FlipEvent,
    KmsDevice, Mapping, PlaneInfo, PropEnumEntry, PropertyInfo, Resources,
};
use crate::fourcc::*;
use crate::ioctl::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const CONNECTOR_ID: u32 = 1;
const ENCODER_ID: u32 = 5;
const CRTC_ID: u32 = 10;
const PRIMARY_PLANE_ID: u32 = 20;
const CURSOR_PLANE_ID: u32 = 21;
const OVERLAY_PLANE_BASE: u32 = 22;
const FB_ID_BASE: u32 = 100;
const PROP_ID_BASE: u32 = 1000;
const BLOB_ID_BASE: u32 = 5000;

const DRM_MODE_CONNECTOR_HDMIA: u32 = 11;
const DRM_MODE_ENCODER_TMDS: u32 = 2;

/// Shape of the simulated output
#[derive(Debug, Clone)]
pub struct VirtualConfig {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    pub overlay_planes: u32,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            refresh: 60,
            overlay_planes: 2,
        }
    }
}

/// Counters of destructive ioctls, for leak and double-free checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub prime_imports: usize,
    pub gem_closes: usize,
    pub dumb_creates: usize,
    pub dumb_destroys: usize,
    pub fbs_added: usize,
    pub fbs_removed: usize,
    pub blobs_created: usize,
    pub blobs_destroyed: usize,
    pub commits: usize,
    pub test_commits: usize,
}

/// One applied (non test-only) atomic commit
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub flags: u32,
    pub user_data: u64,
    pub values: Vec<(u32, u32, u64)>,
}

impl CommitRecord {
    pub fn value(&self, obj: u32, prop: u32) -> Option<u64> {
        self.values
            .iter()
            .find(|(o, p, _)| *o == obj && *p == prop)
            .map(|(_, _, v)| *v)
    }
}

#[derive(Debug)]
enum Gem {
    Dumb { memfd: OwnedFd, size: usize },
    Prime { key: (u64, u64) },
}

struct ObjectState {
    obj_type: u32,
    props: BTreeMap<u32, u64>,
}

struct State {
    next_handle: u32,
    next_fb: u32,
    next_blob: u32,
    handles: HashMap<u32, Gem>,
    prime: HashMap<(u64, u64), u32>,
    fbs: HashMap<u32, FbRequest>,
    blobs: HashMap<u32, Vec<u8>>,
    objects: HashMap<u32, ObjectState>,
    pending_flips: Vec<FlipEvent>,
    ready: VecDeque<FlipEvent>,
    sequence: u32,
    fail_next: VecDeque<i32>,
    lost: bool,
    commits: Vec<CommitRecord>,
    stats: DeviceStats,
}

/// A virtual atomic KMS device
pub struct VirtualDevice {
    config: VirtualConfig,
    event: OwnedFd,
    mode: DrmModeModeinfo,
    plane_formats: HashMap<u32, Vec<u32>>,
    props: Vec<PropertyInfo>,
    state: Mutex<State>,
}

fn enums(list: &[(&str, u64)]) -> Vec<PropEnumEntry> {
    list.iter()
        .map(|(n, v)| PropEnumEntry {
            name: n.to_string(),
            value: *v,
        })
        .collect()
}

/// Property table shared by every object of a class, as in the kernel
fn property_table(overlay_planes: u32) -> Vec<PropertyInfo> {
    let zmax = 1 + overlay_planes as u64;
    let defs: Vec<(&str, u32, Vec<u64>, Vec<PropEnumEntry>)> = vec![
        (
            "type",
            DRM_MODE_PROP_ENUM | DRM_MODE_PROP_IMMUTABLE,
            vec![0, 1, 2],
            enums(&[("Overlay", 0), ("Primary", 1), ("Cursor", 2)]),
        ),
        ("FB_ID", DRM_MODE_PROP_OBJECT | DRM_MODE_PROP_ATOMIC, vec![DRM_MODE_OBJECT_FB as u64], vec![]),
        ("CRTC_ID", DRM_MODE_PROP_OBJECT | DRM_MODE_PROP_ATOMIC, vec![DRM_MODE_OBJECT_CRTC as u64], vec![]),
        ("SRC_X", DRM_MODE_PROP_RANGE | DRM_MODE_PROP_ATOMIC, vec![0, u32::MAX as u64], vec![]),
        ("SRC_Y", DRM_MODE_PROP_RANGE | DRM_MODE_PROP_ATOMIC, vec![0, u32::MAX as u64], vec![]),
        ("SRC_W", DRM_MODE_PROP_RANGE | DRM_MODE_PROP_ATOMIC, vec![0, u32::MAX as u64], vec![]),
        ("SRC_H", DRM_MODE_PROP_RANGE | DRM_MODE_PROP_ATOMIC, vec![0, u32::MAX as u64], vec![]),
        (
            "CRTC_X",
            DRM_MODE_PROP_SIGNED_RANGE | DRM_MODE_PROP_ATOMIC,
            vec![i32::MIN as i64 as u64, i32::MAX as u64],
            vec![],
        ),
        (
            "CRTC_Y",
            DRM_MODE_PROP_SIGNED_RANGE | DRM_MODE_PROP_ATOMIC,
            vec![i32::MIN as i64 as u64, i32::MAX as u64],
            vec![],
        ),
        ("CRTC_W", DRM_MODE_PROP_RANGE | DRM_MODE_PROP_ATOMIC, vec![0, i32::MAX as u64], vec![]),
        ("CRTC_H", DRM_MODE_PROP_RANGE | DRM_MODE_PROP_ATOMIC, vec![0, i32::MAX as u64], vec![]),
        ("IN_FORMATS", DRM_MODE_PROP_BLOB | DRM_MODE_PROP_IMMUTABLE, vec![], vec![]),
        (
            "COLOR_ENCODING",
            DRM_MODE_PROP_ENUM,
            vec![0, 1, 2],
            enums(&[
                ("ITU-R BT.601 YCbCr", 0),
                ("ITU-R BT.709 YCbCr", 1),
                ("ITU-R BT.2020 YCbCr", 2),
            ]),
        ),
        (
            "COLOR_RANGE",
            DRM_MODE_PROP_ENUM,
            vec![0, 1],
            enums(&[("YCbCr limited range", 0), ("YCbCr full range", 1)]),
        ),
        (
            "rotation",
            DRM_MODE_PROP_BITMASK,
            vec![0, 2, 4, 5],
            enums(&[("rotate-0", 0), ("rotate-180", 2), ("reflect-x", 4), ("reflect-y", 5)]),
        ),
        ("alpha", DRM_MODE_PROP_RANGE, vec![0, 0xffff], vec![]),
        (
            "pixel blend mode",
            DRM_MODE_PROP_ENUM,
            vec![0, 1, 2],
            enums(&[("None", 0), ("Pre-multiplied", 1), ("Coverage", 2)]),
        ),
        ("zpos", DRM_MODE_PROP_RANGE, vec![0, zmax], vec![]),
        // CRTC
        ("ACTIVE", DRM_MODE_PROP_RANGE | DRM_MODE_PROP_ATOMIC, vec![0, 1], vec![]),
        ("MODE_ID", DRM_MODE_PROP_BLOB | DRM_MODE_PROP_ATOMIC, vec![], vec![]),
        // Connector; CRTC_ID is a distinct property from the plane one
        ("CRTC_ID", DRM_MODE_PROP_OBJECT | DRM_MODE_PROP_ATOMIC, vec![DRM_MODE_OBJECT_CRTC as u64], vec![]),
        ("HDR_OUTPUT_METADATA", DRM_MODE_PROP_BLOB, vec![], vec![]),
        (
            "Colorspace",
            DRM_MODE_PROP_ENUM,
            vec![0, 2, 9, 10],
            enums(&[("Default", 0), ("BT709_YCC", 2), ("BT2020_RGB", 9), ("BT2020_YCC", 10)]),
        ),
        (
            "Broadcast RGB",
            DRM_MODE_PROP_ENUM,
            vec![0, 1, 2],
            enums(&[("Automatic", 0), ("Full", 1), ("Limited 16:235", 2)]),
        ),
        ("max bpc", DRM_MODE_PROP_RANGE, vec![8, 12], vec![]),
    ];

    defs.into_iter()
        .enumerate()
        .map(|(i, (name, flags, values, enums))| PropertyInfo {
            id: PROP_ID_BASE + i as u32,
            name: name.to_string(),
            flags,
            values,
            enums,
        })
        .collect()
}

// Indices into property_table()
const P_TYPE: usize = 0;
const P_FB_ID: usize = 1;
const P_PLANE_CRTC_ID: usize = 2;
const P_IN_FORMATS: usize = 11;
const P_ROTATION: usize = 14;
const P_ALPHA: usize = 15;
const P_ZPOS: usize = 17;
const P_CRTC_ACTIVE: usize = 18;
const P_CRTC_MODE_ID: usize = 19;
const P_CONN_CRTC_ID: usize = 20;
const P_CONN_LAST: usize = 24;

fn errno(e: i32) -> io::Error {
    io::Error::from_raw_os_error(e)
}

fn align_up(v: u32, a: u32) -> u32 {
    (v + a - 1) / a * a
}

fn is_sand128(modifier: u64) -> bool {
    modifier >> 56 == 0x07 && modifier & 0xff == 4
}

impl VirtualDevice {
    pub fn new(config: VirtualConfig) -> io::Result<Self> {
        // SAFETY: plain syscall; the result is checked before use
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: efd is a fresh fd we exclusively own
        let event = unsafe { OwnedFd::from_raw_fd(efd) };

        let mode = Self::make_mode(&config);
        let props = property_table(config.overlay_planes);

        let primary = vec![
            DRM_FORMAT_XRGB8888,
            DRM_FORMAT_ARGB8888,
            DRM_FORMAT_XBGR8888,
            DRM_FORMAT_ABGR8888,
            DRM_FORMAT_RGB565,
        ];
        let overlay: Vec<u32> = supported_formats().map(|f| f.fourcc).collect();
        let mut plane_formats = HashMap::new();
        plane_formats.insert(PRIMARY_PLANE_ID, primary);
        plane_formats.insert(CURSOR_PLANE_ID, vec![DRM_FORMAT_ARGB8888]);
        for n in 0..config.overlay_planes {
            plane_formats.insert(OVERLAY_PLANE_BASE + n, overlay.clone());
        }

        let dev = Self {
            config,
            event,
            mode,
            plane_formats,
            props,
            state: Mutex::new(State {
                next_handle: 1,
                next_fb: FB_ID_BASE,
                next_blob: BLOB_ID_BASE,
                handles: HashMap::new(),
                prime: HashMap::new(),
                fbs: HashMap::new(),
                blobs: HashMap::new(),
                objects: HashMap::new(),
                pending_flips: Vec::new(),
                ready: VecDeque::new(),
                sequence: 0,
                fail_next: VecDeque::new(),
                lost: false,
                commits: Vec::new(),
                stats: DeviceStats::default(),
            }),
        };
        dev.build_objects();

        info!(
            width = dev.config.width,
            height = dev.config.height,
            overlays = dev.config.overlay_planes,
            "Created virtual KMS device"
        );
        Ok(dev)
    }

    fn make_mode(config: &VirtualConfig) -> DrmModeModeinfo {
        let hdisplay = config.width as u16;
        let vdisplay = config.height as u16;
        let htotal = hdisplay + 280;
        let vtotal = vdisplay + 45;
        DrmModeModeinfo {
            clock: htotal as u32 * vtotal as u32 * config.refresh / 1000,
            hdisplay,
            hsync_start: hdisplay + 88,
            hsync_end: hdisplay + 132,
            htotal,
            hskew: 0,
            vdisplay,
            vsync_start: vdisplay + 4,
            vsync_end: vdisplay + 9,
            vtotal,
            vscan: 0,
            vrefresh: config.refresh,
            flags: 0,
            type_: DRM_MODE_TYPE_PREFERRED | DRM_MODE_TYPE_DRIVER,
            name: name_to_c(&format!("{}x{}", config.width, config.height)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prop_id(&self, idx: usize) -> u32 {
        PROP_ID_BASE + idx as u32
    }

    fn plane_ids_all(&self) -> Vec<u32> {
        let mut ids = vec![PRIMARY_PLANE_ID, CURSOR_PLANE_ID];
        ids.extend((0..self.config.overlay_planes).map(|n| OVERLAY_PLANE_BASE + n));
        ids
    }

    fn build_objects(&self) {
        let mut st = self.lock();

        let mode_blob = st.next_blob;
        st.next_blob += 1;
        st.blobs.insert(mode_blob, self.mode.to_bytes());

        for (zpos, id) in self.plane_ids_all().into_iter().enumerate() {
            let plane_type = match id {
                PRIMARY_PLANE_ID => 1,
                CURSOR_PLANE_ID => 2,
                _ => 0,
            };
            let formats = self.plane_formats.get(&id).cloned().unwrap_or_default();
            let mut modifiers = vec![(DRM_FORMAT_MOD_LINEAR, formats.clone())];
            if plane_type == 0 {
                modifiers.push((DRM_FORMAT_MOD_BROADCOM_SAND128, vec![DRM_FORMAT_NV12]));
            }
            let in_formats = st.next_blob;
            st.next_blob += 1;
            st.blobs
                .insert(in_formats, encode_in_formats(&formats, &modifiers));

            let mut props = BTreeMap::new();
            for idx in P_TYPE..=P_ZPOS {
                props.insert(self.prop_id(idx), 0);
            }
            props.insert(self.prop_id(P_TYPE), plane_type);
            props.insert(self.prop_id(P_IN_FORMATS), in_formats as u64);
            props.insert(self.prop_id(P_ZPOS), zpos as u64);
            props.insert(self.prop_id(P_ALPHA), 0xffff);
            // rotate-0
            props.insert(self.prop_id(P_ROTATION), 1);
            if id == PRIMARY_PLANE_ID {
                props.insert(self.prop_id(P_PLANE_CRTC_ID), CRTC_ID as u64);
            }
            st.objects.insert(
                id,
                ObjectState {
                    obj_type: DRM_MODE_OBJECT_PLANE,
                    props,
                },
            );
        }

        let mut crtc_props = BTreeMap::new();
        crtc_props.insert(self.prop_id(P_CRTC_ACTIVE), 1);
        crtc_props.insert(self.prop_id(P_CRTC_MODE_ID), mode_blob as u64);
        st.objects.insert(
            CRTC_ID,
            ObjectState {
                obj_type: DRM_MODE_OBJECT_CRTC,
                props: crtc_props,
            },
        );

        let mut conn_props = BTreeMap::new();
        for idx in P_CONN_CRTC_ID..=P_CONN_LAST {
            conn_props.insert(self.prop_id(idx), 0);
        }
        conn_props.insert(self.prop_id(P_CONN_CRTC_ID), CRTC_ID as u64);
        conn_props.insert(self.prop_id(P_CONN_LAST), 8);
        st.objects.insert(
            CONNECTOR_ID,
            ObjectState {
                obj_type: DRM_MODE_OBJECT_CONNECTOR,
                props: conn_props,
            },
        );
    }

    pub fn config(&self) -> &VirtualConfig {
        &self.config
    }

    pub fn crtc_id(&self) -> u32 {
        CRTC_ID
    }

    pub fn connector_id(&self) -> u32 {
        CONNECTOR_ID
    }

    pub fn primary_plane_id(&self) -> u32 {
        PRIMARY_PLANE_ID
    }

    /// Property id of `name` on objects of `obj_type`
    pub fn property_id(&self, obj_type: u32, name: &str) -> Option<u32> {
        let range = match obj_type {
            DRM_MODE_OBJECT_PLANE => P_TYPE..=P_ZPOS,
            DRM_MODE_OBJECT_CRTC => P_CRTC_ACTIVE..=P_CRTC_MODE_ID,
            DRM_MODE_OBJECT_CONNECTOR => P_CONN_CRTC_ID..=P_CONN_LAST,
            _ => return None,
        };
        range
            .into_iter()
            .find(|i| self.props[*i].name == name)
            .map(|i| self.prop_id(i))
    }

    /// Current value of a named property after every applied commit
    pub fn property_value(&self, obj_id: u32, name: &str) -> Option<u64> {
        let st = self.lock();
        let obj = st.objects.get(&obj_id)?;
        let id = self.property_id(obj.obj_type, name)?;
        obj.props.get(&id).copied()
    }

    /// Deliver every outstanding flip: the event fd becomes readable
    pub fn complete_flips(&self) -> usize {
        let n = {
            let mut st = self.lock();
            let flips: Vec<_> = st.pending_flips.drain(..).collect();
            let n = flips.len();
            st.ready.extend(flips);
            n
        };
        if n > 0 {
            self.signal();
        }
        debug!(count = n, "Completed virtual flips");
        n
    }

    pub fn pending_flips(&self) -> usize {
        self.lock().pending_flips.len()
    }

    /// Make the next applied commit fail with `errno`
    pub fn fail_next_commit(&self, errno: i32) {
        self.lock().fail_next.push_back(errno);
    }

    /// Simulate unplug: every later ioctl and event read fails with ENODEV
    pub fn set_lost(&self) {
        self.lock().lost = true;
        warn!("Virtual device unplugged");
        self.signal();
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.lock().commits.clone()
    }

    pub fn stats(&self) -> DeviceStats {
        self.lock().stats
    }

    pub fn fb(&self, fb_id: u32) -> Option<FbRequest> {
        self.lock().fbs.get(&fb_id).cloned()
    }

    pub fn fb_count(&self) -> usize {
        self.lock().fbs.len()
    }

    pub fn handle_count(&self) -> usize {
        self.lock().handles.len()
    }

    /// Blobs created by clients (the ones the device made itself excluded)
    pub fn client_blob_count(&self) -> usize {
        let st = self.lock();
        st.stats.blobs_created - st.stats.blobs_destroyed
    }

    fn signal(&self) {
        let one: u64 = 1;
        // SAFETY: writing 8 bytes from a local to our own eventfd
        let r = unsafe {
            libc::write(
                self.event.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if r < 0 {
            warn!(error = %io::Error::last_os_error(), "eventfd write failed");
        }
    }

    fn drain_eventfd(&self) {
        let mut v: u64 = 0;
        // SAFETY: reading 8 bytes into a local from our own non-blocking eventfd
        unsafe {
            libc::read(
                self.event.as_raw_fd(),
                &mut v as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }

    fn check_alive(st: &State) -> io::Result<()> {
        if st.lost {
            Err(errno(libc::ENODEV))
        } else {
            Ok(())
        }
    }

    fn validate_value(&self, st: &State, info: &PropertyInfo, value: u64) -> io::Result<()> {
        if info.flags & DRM_MODE_PROP_IMMUTABLE != 0 {
            return Err(errno(libc::EINVAL));
        }
        let ok = if info.flags & DRM_MODE_PROP_RANGE != 0 {
            value >= info.values[0] && value <= info.values[1]
        } else if info.flags & DRM_MODE_PROP_EXTENDED_TYPE == DRM_MODE_PROP_SIGNED_RANGE {
            let v = value as i64;
            v >= info.values[0] as i64 && v <= info.values[1] as i64
        } else if info.flags & DRM_MODE_PROP_ENUM != 0 {
            info.values.contains(&value)
        } else if info.flags & DRM_MODE_PROP_BITMASK != 0 {
            let mask = info.values.iter().fold(0u64, |m, b| m | (1u64 << *b));
            value & !mask == 0
        } else if info.flags & DRM_MODE_PROP_BLOB != 0 {
            value == 0 || st.blobs.contains_key(&(value as u32))
        } else if info.flags & DRM_MODE_PROP_EXTENDED_TYPE == DRM_MODE_PROP_OBJECT {
            value == 0
                || match info.values.first().map(|t| *t as u32) {
                    Some(DRM_MODE_OBJECT_FB) => st.fbs.contains_key(&(value as u32)),
                    Some(DRM_MODE_OBJECT_CRTC) => value as u32 == CRTC_ID,
                    _ => false,
                }
        } else {
            true
        };
        if ok {
            Ok(())
        } else {
            Err(errno(libc::EINVAL))
        }
    }
}

impl KmsDevice for VirtualDevice {
    fn event_fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32> {
        // SAFETY: fstat only writes into the zeroed struct we pass
        let mut sb: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut sb) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let key = (sb.st_dev as u64, sb.st_ino as u64);

        let mut st = self.lock();
        Self::check_alive(&st)?;
        if let Some(h) = st.prime.get(&key) {
            return Ok(*h);
        }
        let handle = st.next_handle;
        st.next_handle += 1;
        st.prime.insert(key, handle);
        st.handles.insert(handle, Gem::Prime { key });
        st.stats.prime_imports += 1;
        debug!(fd, handle, "Imported prime fd");
        Ok(handle)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut st = self.lock();
        match st.handles.remove(&handle) {
            Some(Gem::Prime { key }) => {
                st.prime.remove(&key);
                st.stats.gem_closes += 1;
                Ok(())
            }
            Some(g) => {
                st.handles.insert(handle, g);
                Err(errno(libc::EINVAL))
            }
            None => Err(errno(libc::EINVAL)),
        }
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer> {
        if width == 0 || height == 0 || bpp == 0 {
            return Err(errno(libc::EINVAL));
        }
        let pitch = align_up(width * ((bpp + 7) / 8), 64);
        let size = pitch as usize * height as usize;

        // SAFETY: name is NUL terminated; result checked
        let fd = unsafe { libc::memfd_create(b"kms-virtual-dumb\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fresh fd we exclusively own
        let memfd = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: plain syscall on our own fd
        if unsafe { libc::ftruncate(memfd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut st = self.lock();
        Self::check_alive(&st)?;
        let handle = st.next_handle;
        st.next_handle += 1;
        st.handles.insert(handle, Gem::Dumb { memfd, size });
        st.stats.dumb_creates += 1;
        debug!(handle, width, height, bpp, pitch, "Created dumb buffer");
        Ok(DumbBuffer {
            handle,
            pitch,
            size: size as u64,
        })
    }

    fn map_dumb(&self, handle: u32, size: usize) -> io::Result<Mapping> {
        let st = self.lock();
        Self::check_alive(&st)?;
        match st.handles.get(&handle) {
            Some(Gem::Dumb { memfd, size: have }) if size <= *have => {
                Mapping::new(memfd.as_raw_fd(), 0, size)
            }
            Some(_) => Err(errno(libc::EINVAL)),
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        let mut st = self.lock();
        match st.handles.remove(&handle) {
            Some(Gem::Dumb { .. }) => {
                st.stats.dumb_destroys += 1;
                Ok(())
            }
            Some(g) => {
                st.handles.insert(handle, g);
                Err(errno(libc::EINVAL))
            }
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn add_fb2(&self, req: &FbRequest) -> io::Result<u32> {
        let mut st = self.lock();
        Self::check_alive(&st)?;

        if req.width == 0 || req.height == 0 || req.width > 8192 || req.height > 8192 {
            return Err(errno(libc::EINVAL));
        }
        let info = format_info(req.format).ok_or_else(|| errno(libc::EINVAL))?;
        let n = info.plane_count();
        for i in 0..4 {
            let used = i < n;
            if used && (req.handles[i] == 0 || req.pitches[i] == 0) {
                return Err(errno(libc::EINVAL));
            }
            if used && !st.handles.contains_key(&req.handles[i]) {
                return Err(errno(libc::ENOENT));
            }
            if !used && req.handles[i] != 0 {
                return Err(errno(libc::EINVAL));
            }
        }
        if let Some(mods) = req.modifiers {
            let m0 = mods[0];
            let known = m0 == DRM_FORMAT_MOD_LINEAR || is_sand128(m0);
            if !known || mods[..n].iter().any(|m| *m != m0) {
                return Err(errno(libc::EINVAL));
            }
            if is_sand128(m0) && req.format != DRM_FORMAT_NV12 {
                return Err(errno(libc::EINVAL));
            }
        }

        let fb_id = st.next_fb;
        st.next_fb += 1;
        st.fbs.insert(fb_id, req.clone());
        st.stats.fbs_added += 1;
        debug!(
            "Created framebuffer {}: {}x{} format={}",
            fb_id,
            req.width,
            req.height,
            fourcc_string(req.format)
        );
        Ok(fb_id)
    }

    fn rm_fb(&self, fb_id: u32) -> io::Result<()> {
        let mut st = self.lock();
        if st.fbs.remove(&fb_id).is_none() {
            return Err(errno(libc::ENOENT));
        }
        st.stats.fbs_removed += 1;
        // Removing a scanned out FB disables the planes showing it
        let fb_prop = self.prop_id(P_FB_ID);
        for obj in st.objects.values_mut() {
            if obj.props.get(&fb_prop) == Some(&(fb_id as u64)) {
                obj.props.insert(fb_prop, 0);
            }
        }
        debug!("Removed framebuffer {}", fb_id);
        Ok(())
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        if data.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        let mut st = self.lock();
        Self::check_alive(&st)?;
        let id = st.next_blob;
        st.next_blob += 1;
        st.blobs.insert(id, data.to_vec());
        st.stats.blobs_created += 1;
        Ok(id)
    }

    fn destroy_blob(&self, blob_id: u32) -> io::Result<()> {
        let mut st = self.lock();
        if st.blobs.remove(&blob_id).is_none() {
            return Err(errno(libc::ENOENT));
        }
        st.stats.blobs_destroyed += 1;
        Ok(())
    }

    fn blob_data(&self, blob_id: u32) -> io::Result<Vec<u8>> {
        self.lock()
            .blobs
            .get(&blob_id)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn resources(&self) -> io::Result<Resources> {
        Self::check_alive(&self.lock())?;
        Ok(Resources {
            crtcs: vec![CRTC_ID],
            connectors: vec![CONNECTOR_ID],
            encoders: vec![ENCODER_ID],
            min_width: 1,
            max_width: 8192,
            min_height: 1,
            max_height: 8192,
        })
    }

    fn plane_ids(&self) -> io::Result<Vec<u32>> {
        Ok(self.plane_ids_all())
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        let formats = self
            .plane_formats
            .get(&id)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))?;
        let st = self.lock();
        let obj = st.objects.get(&id).ok_or_else(|| errno(libc::ENOENT))?;
        let get = |idx: usize| obj.props.get(&self.prop_id(idx)).copied().unwrap_or(0) as u32;
        Ok(PlaneInfo {
            id,
            crtc_id: get(P_PLANE_CRTC_ID),
            fb_id: get(P_FB_ID),
            possible_crtcs: 1,
            formats,
        })
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcInfo> {
        if id != CRTC_ID {
            return Err(errno(libc::ENOENT));
        }
        let st = self.lock();
        let mode = st
            .objects
            .get(&CRTC_ID)
            .and_then(|o| o.props.get(&self.prop_id(P_CRTC_MODE_ID)))
            .and_then(|b| st.blobs.get(&(*b as u32)))
            .and_then(|b| DrmModeModeinfo::from_bytes(b));
        let fb_id = st
            .objects
            .get(&PRIMARY_PLANE_ID)
            .and_then(|o| o.props.get(&self.prop_id(P_FB_ID)))
            .copied()
            .unwrap_or(0) as u32;
        Ok(CrtcInfo {
            id,
            fb_id,
            x: 0,
            y: 0,
            mode,
        })
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        if id != ENCODER_ID {
            return Err(errno(libc::ENOENT));
        }
        Ok(EncoderInfo {
            id,
            encoder_type: DRM_MODE_ENCODER_TMDS,
            crtc_id: CRTC_ID,
            possible_crtcs: 1,
        })
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        if id != CONNECTOR_ID {
            return Err(errno(libc::ENOENT));
        }
        // Approximate a typical 24" panel
        Ok(ConnectorInfo {
            id,
            connector_type: DRM_MODE_CONNECTOR_HDMIA,
            connector_type_id: 1,
            connected: true,
            mm_width: 527,
            mm_height: 296,
            encoder_id: ENCODER_ID,
            encoders: vec![ENCODER_ID],
            modes: vec![self.mode],
        })
    }

    fn object_properties(&self, obj_id: u32, obj_type: u32) -> io::Result<Vec<(u32, u64)>> {
        let st = self.lock();
        Self::check_alive(&st)?;
        let obj = st.objects.get(&obj_id).ok_or_else(|| errno(libc::ENOENT))?;
        if obj_type != DRM_MODE_OBJECT_ANY && obj_type != obj.obj_type {
            return Err(errno(libc::ENOENT));
        }
        Ok(obj.props.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn property(&self, prop_id: u32) -> io::Result<PropertyInfo> {
        prop_id
            .checked_sub(PROP_ID_BASE)
            .and_then(|i| self.props.get(i as usize))
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn atomic_commit(&self, flags: u32, req: &AtomicRequest, user_data: u64) -> io::Result<()> {
        let mut st = self.lock();
        Self::check_alive(&st)?;

        let test_only = flags & DRM_MODE_ATOMIC_TEST_ONLY != 0;
        let want_event = flags & DRM_MODE_PAGE_FLIP_EVENT != 0;
        let values: Vec<_> = req.triples().collect();

        for (obj, prop, value) in &values {
            let state = st.objects.get(obj).ok_or_else(|| errno(libc::ENOENT))?;
            if !state.props.contains_key(prop) {
                return Err(errno(libc::EINVAL));
            }
            let info = self.property(*prop)?;
            self.validate_value(&st, &info, *value)?;

            let modeset = *prop == self.prop_id(P_CRTC_MODE_ID) || *prop == self.prop_id(P_CRTC_ACTIVE);
            if modeset
                && state.props.get(prop) != Some(value)
                && flags & DRM_MODE_ATOMIC_ALLOW_MODESET == 0
            {
                debug!(obj, prop, "Modeset needed but not allowed");
                return Err(errno(libc::EINVAL));
            }
        }

        if test_only {
            st.stats.test_commits += 1;
            return Ok(());
        }
        if want_event && !st.pending_flips.is_empty() {
            return Err(errno(libc::EBUSY));
        }
        if let Some(e) = st.fail_next.pop_front() {
            debug!(errno = e, "Injected commit failure");
            return Err(errno(e));
        }

        for (obj, prop, value) in &values {
            if let Some(state) = st.objects.get_mut(obj) {
                state.props.insert(*prop, *value);
            }
        }
        st.stats.commits += 1;
        st.commits.push(CommitRecord {
            flags,
            user_data,
            values,
        });
        if want_event {
            st.sequence += 1;
            let ev = FlipEvent {
                crtc_id: CRTC_ID,
                sequence: st.sequence,
                user_data,
            };
            st.pending_flips.push(ev);
        }
        Ok(())
    }

    fn read_events(&self) -> io::Result<Vec<FlipEvent>> {
        self.drain_eventfd();
        let mut st = self.lock();
        Self::check_alive(&st)?;
        Ok(st.ready.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_ids_by_class() {
        let dev = VirtualDevice::new(VirtualConfig::default()).unwrap();
        let plane_crtc = dev.property_id(DRM_MODE_OBJECT_PLANE, "CRTC_ID").unwrap();
        let conn_crtc = dev.property_id(DRM_MODE_OBJECT_CONNECTOR, "CRTC_ID").unwrap();
        assert_ne!(plane_crtc, conn_crtc);
        assert_eq!(dev.property(plane_crtc).unwrap().name, "CRTC_ID");
        assert_eq!(dev.property_value(PRIMARY_PLANE_ID, "type"), Some(1));
        assert_eq!(dev.property_value(CRTC_ID, "ACTIVE"), Some(1));
        assert_eq!(dev.property_value(CONNECTOR_ID, "max bpc"), Some(8));
    }

    #[test]
    fn test_dumb_buffer_is_mappable() {
        let dev = VirtualDevice::new(VirtualConfig::default()).unwrap();
        let dumb = dev.create_dumb(100, 10, 32).unwrap();
        assert_eq!(dumb.pitch, 448);
        let mut map = dev.map_dumb(dumb.handle, dumb.size as usize).unwrap();
        map.as_mut_slice()[0] = 0xab;
        assert_eq!(map.as_slice()[0], 0xab);
        drop(map);
        dev.destroy_dumb(dumb.handle).unwrap();
        assert_eq!(dev.stats().dumb_destroys, 1);
        assert!(dev.destroy_dumb(dumb.handle).is_err());
    }

    #[test]
    fn test_modeset_requires_flag() {
        let dev = VirtualDevice::new(VirtualConfig::default()).unwrap();
        let active = dev.property_id(DRM_MODE_OBJECT_CRTC, "ACTIVE").unwrap();
        let req = AtomicRequest {
            objs: vec![CRTC_ID],
            count_props: vec![1],
            props: vec![active],
            values: vec![0],
        };
        let e = dev.atomic_commit(0, &req, 0).unwrap_err();
        assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
        dev.atomic_commit(DRM_MODE_ATOMIC_ALLOW_MODESET, &req, 0).unwrap();
        assert_eq!(dev.property_value(CRTC_ID, "ACTIVE"), Some(0));
    }

    #[test]
    fn test_flip_completion_signals_event_fd() {
        let dev = VirtualDevice::new(VirtualConfig::default()).unwrap();
        let alpha = dev.property_id(DRM_MODE_OBJECT_PLANE, "alpha").unwrap();
        let req = AtomicRequest {
            objs: vec![PRIMARY_PLANE_ID],
            count_props: vec![1],
            props: vec![alpha],
            values: vec![0x8000],
        };
        let flags = DRM_MODE_ATOMIC_NONBLOCK | DRM_MODE_PAGE_FLIP_EVENT;
        dev.atomic_commit(flags, &req, 42).unwrap();
        let busy = dev.atomic_commit(flags, &req, 43).unwrap_err();
        assert_eq!(busy.raw_os_error(), Some(libc::EBUSY));
        assert!(dev.read_events().unwrap().is_empty());

        assert_eq!(dev.complete_flips(), 1);
        let evs = dev.read_events().unwrap();
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].user_data, 42);
        assert_eq!(evs[0].crtc_id, CRTC_ID);
    }
}
