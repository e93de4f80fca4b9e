//! A real DRM card node driven through raw ioctls

use super::{
    AtomicRequest, ConnectorInfo, CrtcInfo, DumbBuffer, EncoderInfo, FbRequest, FlipEvent,
    KmsDevice, Mapping, PlaneInfo, PropEnumEntry, PropertyInfo, Resources,
};
use crate::ioctl::*;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use tracing::{debug, info, warn};

/// An open `/dev/dri/cardN`
#[derive(Debug)]
pub struct Card {
    file: File,
}

fn ptr_of<T>(v: &mut [T]) -> u64 {
    v.as_mut_ptr() as u64
}

impl Card {
    /// Open a card node and enable universal planes and atomic
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
            .open(path)?;
        let card = Self { file };

        card.set_client_cap(DRM_CLIENT_CAP_UNIVERSAL_PLANES, 1)?;
        card.set_client_cap(DRM_CLIENT_CAP_ATOMIC, 1)?;
        if card.get_cap(DRM_CAP_DUMB_BUFFER).unwrap_or(0) == 0 {
            warn!(path = %path.display(), "Device does not advertise dumb buffers");
        }
        info!(path = %path.display(), fd = card.fd(), "Opened DRM card");
        Ok(card)
    }

    /// Try card0.. in turn and return the first that accepts atomic
    pub fn open_first() -> io::Result<Self> {
        let mut last = io::Error::from_raw_os_error(libc::ENOENT);
        for n in 0..8 {
            match Self::open(format!("/dev/dri/card{}", n)) {
                Ok(card) => return Ok(card),
                Err(e) => {
                    debug!(card = n, error = %e, "Card not usable");
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn ioctl<T>(&self, req: libc::c_ulong, arg: &mut T) -> io::Result<()> {
        // SAFETY: every call site pairs a request with its matching struct and
        // sizes any embedded user pointers from the counts in that struct
        unsafe { drm_ioctl(self.fd(), req, arg) }
    }

    pub fn set_client_cap(&self, capability: u64, value: u64) -> io::Result<()> {
        let mut cap = DrmSetClientCap { capability, value };
        self.ioctl(DRM_IOCTL_SET_CLIENT_CAP, &mut cap)
    }

    pub fn get_cap(&self, capability: u64) -> io::Result<u64> {
        let mut cap = DrmGetCap {
            capability,
            value: 0,
        };
        self.ioctl(DRM_IOCTL_GET_CAP, &mut cap)?;
        Ok(cap.value)
    }
}

impl KmsDevice for Card {
    fn event_fd(&self) -> RawFd {
        self.fd()
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32> {
        let mut req = DrmPrimeHandle {
            handle: 0,
            flags: 0,
            fd,
        };
        self.ioctl(DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut req)?;
        Ok(req.handle)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut req = DrmGemClose { handle, pad: 0 };
        self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut req)
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer> {
        let mut req = DrmModeCreateDumb {
            width,
            height,
            bpp,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_CREATE_DUMB, &mut req)?;
        Ok(DumbBuffer {
            handle: req.handle,
            pitch: req.pitch,
            size: req.size,
        })
    }

    fn map_dumb(&self, handle: u32, size: usize) -> io::Result<Mapping> {
        let mut req = DrmModeMapDumb {
            handle,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_MAP_DUMB, &mut req)?;
        Mapping::new(self.fd(), req.offset, size)
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        let mut req = DrmModeDestroyDumb { handle };
        self.ioctl(DRM_IOCTL_MODE_DESTROY_DUMB, &mut req)
    }

    fn add_fb2(&self, fb: &FbRequest) -> io::Result<u32> {
        let mut req = DrmModeFbCmd2 {
            width: fb.width,
            height: fb.height,
            pixel_format: fb.format,
            handles: fb.handles,
            pitches: fb.pitches,
            offsets: fb.offsets,
            ..Default::default()
        };
        if let Some(mods) = fb.modifiers {
            req.flags = DRM_MODE_FB_MODIFIERS;
            req.modifier = mods;
        }
        self.ioctl(DRM_IOCTL_MODE_ADDFB2, &mut req)?;
        Ok(req.fb_id)
    }

    fn rm_fb(&self, fb_id: u32) -> io::Result<()> {
        let mut id = fb_id;
        self.ioctl(DRM_IOCTL_MODE_RMFB, &mut id)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut req = DrmModeCreateBlob {
            data: data.as_ptr() as u64,
            length: data.len() as u32,
            blob_id: 0,
        };
        self.ioctl(DRM_IOCTL_MODE_CREATEPROPBLOB, &mut req)?;
        Ok(req.blob_id)
    }

    fn destroy_blob(&self, blob_id: u32) -> io::Result<()> {
        let mut req = DrmModeDestroyBlob { blob_id };
        self.ioctl(DRM_IOCTL_MODE_DESTROYPROPBLOB, &mut req)
    }

    fn blob_data(&self, blob_id: u32) -> io::Result<Vec<u8>> {
        let mut req = DrmModeGetBlob {
            blob_id,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETPROPBLOB, &mut req)?;
        let mut data = vec![0u8; req.length as usize];
        req.data = ptr_of(&mut data);
        self.ioctl(DRM_IOCTL_MODE_GETPROPBLOB, &mut req)?;
        data.truncate(req.length as usize);
        Ok(data)
    }

    fn resources(&self) -> io::Result<Resources> {
        // Counts can change between calls (hotplug), so loop until stable
        loop {
            let mut res = DrmModeCardRes::default();
            self.ioctl(DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;
            let (nc, nn, ne) = (res.count_crtcs, res.count_connectors, res.count_encoders);

            let mut crtcs = vec![0u32; nc as usize];
            let mut connectors = vec![0u32; nn as usize];
            let mut encoders = vec![0u32; ne as usize];
            res.count_fbs = 0;
            res.crtc_id_ptr = ptr_of(&mut crtcs);
            res.connector_id_ptr = ptr_of(&mut connectors);
            res.encoder_id_ptr = ptr_of(&mut encoders);
            self.ioctl(DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;

            if res.count_crtcs > nc || res.count_connectors > nn || res.count_encoders > ne {
                continue;
            }
            crtcs.truncate(res.count_crtcs as usize);
            connectors.truncate(res.count_connectors as usize);
            encoders.truncate(res.count_encoders as usize);
            return Ok(Resources {
                crtcs,
                connectors,
                encoders,
                min_width: res.min_width,
                max_width: res.max_width,
                min_height: res.min_height,
                max_height: res.max_height,
            });
        }
    }

    fn plane_ids(&self) -> io::Result<Vec<u32>> {
        let mut req = DrmModeGetPlaneRes::default();
        self.ioctl(DRM_IOCTL_MODE_GETPLANERESOURCES, &mut req)?;
        let mut ids = vec![0u32; req.count_planes as usize];
        req.plane_id_ptr = ptr_of(&mut ids);
        self.ioctl(DRM_IOCTL_MODE_GETPLANERESOURCES, &mut req)?;
        ids.truncate(req.count_planes as usize);
        Ok(ids)
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        let mut req = DrmModeGetPlane {
            plane_id: id,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETPLANE, &mut req)?;
        let mut formats = vec![0u32; req.count_format_types as usize];
        req.format_type_ptr = ptr_of(&mut formats);
        self.ioctl(DRM_IOCTL_MODE_GETPLANE, &mut req)?;
        formats.truncate(req.count_format_types as usize);
        Ok(PlaneInfo {
            id,
            crtc_id: req.crtc_id,
            fb_id: req.fb_id,
            possible_crtcs: req.possible_crtcs,
            formats,
        })
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcInfo> {
        let mut req = DrmModeCrtc {
            crtc_id: id,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETCRTC, &mut req)?;
        Ok(CrtcInfo {
            id,
            fb_id: req.fb_id,
            x: req.x,
            y: req.y,
            mode: (req.mode_valid != 0).then_some(req.mode),
        })
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        let mut req = DrmModeGetEncoder {
            encoder_id: id,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETENCODER, &mut req)?;
        Ok(EncoderInfo {
            id,
            encoder_type: req.encoder_type,
            crtc_id: req.crtc_id,
            possible_crtcs: req.possible_crtcs,
        })
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        loop {
            let mut req = DrmModeGetConnector {
                connector_id: id,
                ..Default::default()
            };
            self.ioctl(DRM_IOCTL_MODE_GETCONNECTOR, &mut req)?;
            let (nm, ne) = (req.count_modes, req.count_encoders);

            let mut modes = vec![DrmModeModeinfo::default(); nm as usize];
            let mut encoders = vec![0u32; ne as usize];
            req.modes_ptr = ptr_of(&mut modes);
            req.encoders_ptr = ptr_of(&mut encoders);
            req.count_props = 0;
            self.ioctl(DRM_IOCTL_MODE_GETCONNECTOR, &mut req)?;

            if req.count_modes > nm || req.count_encoders > ne {
                continue;
            }
            modes.truncate(req.count_modes as usize);
            encoders.truncate(req.count_encoders as usize);
            return Ok(ConnectorInfo {
                id,
                connector_type: req.connector_type,
                connector_type_id: req.connector_type_id,
                connected: req.connection == DRM_MODE_CONNECTED,
                mm_width: req.mm_width,
                mm_height: req.mm_height,
                encoder_id: req.encoder_id,
                encoders,
                modes,
            });
        }
    }

    fn object_properties(&self, obj_id: u32, obj_type: u32) -> io::Result<Vec<(u32, u64)>> {
        loop {
            let mut req = DrmModeObjGetProperties {
                obj_id,
                obj_type,
                ..Default::default()
            };
            self.ioctl(DRM_IOCTL_MODE_OBJ_GETPROPERTIES, &mut req)?;
            let n = req.count_props;
            let mut ids = vec![0u32; n as usize];
            let mut values = vec![0u64; n as usize];
            req.props_ptr = ptr_of(&mut ids);
            req.prop_values_ptr = ptr_of(&mut values);
            self.ioctl(DRM_IOCTL_MODE_OBJ_GETPROPERTIES, &mut req)?;
            if req.count_props > n {
                continue;
            }
            let n = req.count_props as usize;
            return Ok(ids.into_iter().zip(values).take(n).collect());
        }
    }

    fn property(&self, prop_id: u32) -> io::Result<PropertyInfo> {
        let mut req = DrmModeGetProperty {
            prop_id,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_GETPROPERTY, &mut req)?;

        let mut values = vec![0u64; req.count_values as usize];
        let is_enum = req.flags & (DRM_MODE_PROP_ENUM | DRM_MODE_PROP_BITMASK) != 0;
        let mut enums = if is_enum {
            vec![DrmModePropertyEnum::default(); req.count_enum_blobs as usize]
        } else {
            Vec::new()
        };
        req.values_ptr = ptr_of(&mut values);
        if is_enum {
            req.enum_blob_ptr = ptr_of(&mut enums);
        } else {
            // Blob properties report blob ids here; we do not want them
            req.count_enum_blobs = 0;
        }
        self.ioctl(DRM_IOCTL_MODE_GETPROPERTY, &mut req)?;

        values.truncate(req.count_values as usize);
        if is_enum {
            enums.truncate(req.count_enum_blobs as usize);
        }
        Ok(PropertyInfo {
            id: prop_id,
            name: name_from_c(&req.name),
            flags: req.flags,
            values,
            enums: enums
                .iter()
                .map(|e| PropEnumEntry {
                    name: name_from_c(&e.name),
                    value: e.value,
                })
                .collect(),
        })
    }

    fn atomic_commit(&self, flags: u32, req: &AtomicRequest, user_data: u64) -> io::Result<()> {
        let mut atomic = DrmModeAtomic {
            flags,
            count_objs: req.objs.len() as u32,
            objs_ptr: req.objs.as_ptr() as u64,
            count_props_ptr: req.count_props.as_ptr() as u64,
            props_ptr: req.props.as_ptr() as u64,
            prop_values_ptr: req.values.as_ptr() as u64,
            reserved: 0,
            user_data,
        };
        self.ioctl(DRM_IOCTL_MODE_ATOMIC, &mut atomic)
    }

    fn read_events(&self) -> io::Result<Vec<FlipEvent>> {
        let mut buf = [0u8; 1024];
        let n = match (&self.file).read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if n == 0 {
            // EOF on a DRM node only happens once the device is gone
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        Ok(parse_events(&buf[..n])
            .into_iter()
            .filter(|(t, _)| *t == DRM_EVENT_FLIP_COMPLETE)
            .map(|(_, ev)| FlipEvent {
                crtc_id: ev.crtc_id,
                sequence: ev.sequence,
                user_data: ev.user_data,
            })
            .collect())
    }
}
