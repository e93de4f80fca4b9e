//! DRM fourcc format codes, modifiers and plane layout rules

/// Build a fourcc code from its four characters
pub const fn fourcc_code(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const DRM_FORMAT_XRGB8888: u32 = fourcc_code(b'X', b'R', b'2', b'4');
pub const DRM_FORMAT_XBGR8888: u32 = fourcc_code(b'X', b'B', b'2', b'4');
pub const DRM_FORMAT_RGBX8888: u32 = fourcc_code(b'R', b'X', b'2', b'4');
pub const DRM_FORMAT_BGRX8888: u32 = fourcc_code(b'B', b'X', b'2', b'4');
pub const DRM_FORMAT_ARGB8888: u32 = fourcc_code(b'A', b'R', b'2', b'4');
pub const DRM_FORMAT_ABGR8888: u32 = fourcc_code(b'A', b'B', b'2', b'4');
pub const DRM_FORMAT_RGBA8888: u32 = fourcc_code(b'R', b'A', b'2', b'4');
pub const DRM_FORMAT_BGRA8888: u32 = fourcc_code(b'B', b'A', b'2', b'4');
pub const DRM_FORMAT_XRGB2101010: u32 = fourcc_code(b'X', b'R', b'3', b'0');
pub const DRM_FORMAT_RGB565: u32 = fourcc_code(b'R', b'G', b'1', b'6');
pub const DRM_FORMAT_BGR565: u32 = fourcc_code(b'B', b'G', b'1', b'6');
pub const DRM_FORMAT_RGB888: u32 = fourcc_code(b'R', b'G', b'2', b'4');
pub const DRM_FORMAT_AYUV: u32 = fourcc_code(b'A', b'Y', b'U', b'V');
pub const DRM_FORMAT_YUYV: u32 = fourcc_code(b'Y', b'U', b'Y', b'V');
pub const DRM_FORMAT_YVYU: u32 = fourcc_code(b'Y', b'V', b'Y', b'U');
pub const DRM_FORMAT_UYVY: u32 = fourcc_code(b'U', b'Y', b'V', b'Y');
pub const DRM_FORMAT_VYUY: u32 = fourcc_code(b'V', b'Y', b'U', b'Y');
pub const DRM_FORMAT_NV12: u32 = fourcc_code(b'N', b'V', b'1', b'2');
pub const DRM_FORMAT_NV21: u32 = fourcc_code(b'N', b'V', b'2', b'1');
pub const DRM_FORMAT_NV16: u32 = fourcc_code(b'N', b'V', b'1', b'6');
pub const DRM_FORMAT_NV61: u32 = fourcc_code(b'N', b'V', b'6', b'1');
pub const DRM_FORMAT_P010: u32 = fourcc_code(b'P', b'0', b'1', b'0');
pub const DRM_FORMAT_YUV420: u32 = fourcc_code(b'Y', b'U', b'1', b'2');
pub const DRM_FORMAT_YVU420: u32 = fourcc_code(b'Y', b'V', b'1', b'2');
pub const DRM_FORMAT_YUV422: u32 = fourcc_code(b'Y', b'U', b'1', b'6');
pub const DRM_FORMAT_YUV444: u32 = fourcc_code(b'Y', b'U', b'2', b'4');

// Single channel layer formats used by multi-layer dma-buf descriptors
pub const DRM_FORMAT_R8: u32 = fourcc_code(b'R', b'8', b' ', b' ');
pub const DRM_FORMAT_R16: u32 = fourcc_code(b'R', b'1', b'6', b' ');
pub const DRM_FORMAT_GR88: u32 = fourcc_code(b'G', b'R', b'8', b'8');
pub const DRM_FORMAT_RG88: u32 = fourcc_code(b'R', b'G', b'8', b'8');
pub const DRM_FORMAT_GR1616: u32 = fourcc_code(b'G', b'R', b'3', b'2');

/// Format modifiers
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

const DRM_FORMAT_MOD_VENDOR_BROADCOM: u64 = 0x07;

const fn fourcc_mod_code(vendor: u64, val: u64) -> u64 {
    (vendor << 56) | (val & 0x00ff_ffff_ffff_ffff)
}

/// Broadcom column ("sand") layout, column height in the parameter bits
pub const fn drm_format_mod_broadcom_sand128_col_height(v: u64) -> u64 {
    fourcc_mod_code(DRM_FORMAT_MOD_VENDOR_BROADCOM, 4 | (v << 8))
}
pub const DRM_FORMAT_MOD_BROADCOM_SAND128: u64 = drm_format_mod_broadcom_sand128_col_height(0);

/// One memory plane of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Horizontal subsampling divisor
    pub wdiv: u32,
    /// Vertical subsampling divisor
    pub hdiv: u32,
    /// Plane pitch = plane 0 pitch * pitch_num / pitch_den
    pub pitch_num: u32,
    pub pitch_den: u32,
}

const fn layout(wdiv: u32, hdiv: u32, pitch_num: u32, pitch_den: u32) -> PlaneLayout {
    PlaneLayout {
        wdiv,
        hdiv,
        pitch_num,
        pitch_den,
    }
}

const PACKED: &[PlaneLayout] = &[layout(1, 1, 1, 1)];
const SEMI_420: &[PlaneLayout] = &[layout(1, 1, 1, 1), layout(2, 2, 1, 1)];
const SEMI_422: &[PlaneLayout] = &[layout(1, 1, 1, 1), layout(2, 1, 1, 1)];
const TRI_420: &[PlaneLayout] = &[layout(1, 1, 1, 1), layout(2, 2, 1, 2), layout(2, 2, 1, 2)];
const TRI_422: &[PlaneLayout] = &[layout(1, 1, 1, 1), layout(2, 1, 1, 2), layout(2, 1, 1, 2)];
const TRI_444: &[PlaneLayout] = &[layout(1, 1, 1, 1), layout(1, 1, 1, 1), layout(1, 1, 1, 1)];

/// Layout rules for one kernel pixel format
#[derive(Debug, Clone, Copy)]
pub struct FormatInfo {
    pub fourcc: u32,
    /// Bits per pixel of plane 0 (what a dumb allocation is sized by)
    pub bpp: u32,
    pub planes: &'static [PlaneLayout],
    pub is_yuv: bool,
}

impl FormatInfo {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Horizontal chroma subsampling of plane `n`
    pub fn wdiv(&self, n: usize) -> u32 {
        self.planes.get(n).map_or(1, |p| p.wdiv)
    }

    pub fn hdiv(&self, n: usize) -> u32 {
        self.planes.get(n).map_or(1, |p| p.hdiv)
    }

    /// Pitch of plane `n` given the pitch of plane 0
    pub fn plane_pitch(&self, n: usize, pitch0: u32) -> u32 {
        self.planes
            .get(n)
            .map_or(0, |p| pitch0 * p.pitch_num / p.pitch_den)
    }

    /// Rows of plane `n` in an image `height` pixels tall
    pub fn plane_height(&self, n: usize, height: u32) -> u32 {
        let d = self.hdiv(n);
        (height + d - 1) / d
    }

    /// Height, in plane 0 rows, of a single allocation holding every plane
    ///
    /// 4:2:0 layouts come out at 1.5x, 4:2:2 at 2x.
    pub fn total_height(&self, height: u32) -> u32 {
        let mut rows_num = 0u64;
        for (n, p) in self.planes.iter().enumerate() {
            let rows = self.plane_height(n, height) as u64;
            // Each row of plane n is pitch_num/pitch_den of a plane 0 row
            rows_num += rows * p.pitch_num as u64 * 2 / p.pitch_den as u64;
        }
        ((rows_num + 1) / 2) as u32
    }

    /// Per plane (pitch, offset) for a single buffer with the given plane 0 pitch
    pub fn plane_offsets(&self, pitch0: u32, height: u32) -> ([u32; 4], [u32; 4]) {
        let mut pitches = [0u32; 4];
        let mut offsets = [0u32; 4];
        let mut offset = 0u32;
        for n in 0..self.planes.len().min(4) {
            pitches[n] = self.plane_pitch(n, pitch0);
            offsets[n] = offset;
            offset += pitches[n] * self.plane_height(n, height);
        }
        (pitches, offsets)
    }
}

const fn info(fourcc: u32, bpp: u32, planes: &'static [PlaneLayout], is_yuv: bool) -> FormatInfo {
    FormatInfo {
        fourcc,
        bpp,
        planes,
        is_yuv,
    }
}

static FORMATS: &[FormatInfo] = &[
    info(DRM_FORMAT_XRGB8888, 32, PACKED, false),
    info(DRM_FORMAT_XBGR8888, 32, PACKED, false),
    info(DRM_FORMAT_RGBX8888, 32, PACKED, false),
    info(DRM_FORMAT_BGRX8888, 32, PACKED, false),
    info(DRM_FORMAT_ARGB8888, 32, PACKED, false),
    info(DRM_FORMAT_ABGR8888, 32, PACKED, false),
    info(DRM_FORMAT_RGBA8888, 32, PACKED, false),
    info(DRM_FORMAT_BGRA8888, 32, PACKED, false),
    info(DRM_FORMAT_XRGB2101010, 32, PACKED, false),
    info(DRM_FORMAT_RGB888, 24, PACKED, false),
    info(DRM_FORMAT_RGB565, 16, PACKED, false),
    info(DRM_FORMAT_BGR565, 16, PACKED, false),
    info(DRM_FORMAT_AYUV, 32, PACKED, true),
    info(DRM_FORMAT_YUYV, 16, PACKED, true),
    info(DRM_FORMAT_YVYU, 16, PACKED, true),
    info(DRM_FORMAT_UYVY, 16, PACKED, true),
    info(DRM_FORMAT_VYUY, 16, PACKED, true),
    info(DRM_FORMAT_NV12, 8, SEMI_420, true),
    info(DRM_FORMAT_NV21, 8, SEMI_420, true),
    info(DRM_FORMAT_NV16, 8, SEMI_422, true),
    info(DRM_FORMAT_NV61, 8, SEMI_422, true),
    info(DRM_FORMAT_P010, 16, SEMI_420, true),
    info(DRM_FORMAT_YUV420, 8, TRI_420, true),
    info(DRM_FORMAT_YVU420, 8, TRI_420, true),
    info(DRM_FORMAT_YUV422, 8, TRI_422, true),
    info(DRM_FORMAT_YUV444, 8, TRI_444, true),
];

/// Look up the layout rules for a fourcc
pub fn format_info(fourcc: u32) -> Option<&'static FormatInfo> {
    FORMATS.iter().find(|f| f.fourcc == fourcc)
}

/// Every format with a known layout
pub fn supported_formats() -> impl Iterator<Item = &'static FormatInfo> {
    FORMATS.iter()
}

/// Combined pixel format for a dma-buf described as several single channel layers
pub fn format_from_layers(layers: &[u32]) -> Option<u32> {
    match layers {
        [f] => Some(*f),
        [DRM_FORMAT_R8, DRM_FORMAT_GR88] => Some(DRM_FORMAT_NV12),
        [DRM_FORMAT_R8, DRM_FORMAT_RG88] => Some(DRM_FORMAT_NV21),
        [DRM_FORMAT_R16, DRM_FORMAT_GR1616] => Some(DRM_FORMAT_P010),
        [DRM_FORMAT_R8, DRM_FORMAT_R8, DRM_FORMAT_R8] => Some(DRM_FORMAT_YUV420),
        _ => None,
    }
}

/// Printable form of a fourcc, e.g. "NV12"
pub fn fourcc_string(fourcc: u32) -> String {
    fourcc
        .to_le_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect::<String>()
        .trim_end()
        .to_string()
}
