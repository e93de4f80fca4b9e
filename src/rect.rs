//! Rectangles and fractions in display and 16.16 fixed point space

/// Rectangle: signed position, unsigned size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

fn rescale_signed(x: i32, mul: u32, div: u32) -> i32 {
    let m = x as i64 * mul as i64;
    if div == 0 {
        return m as i32;
    }
    let d2 = (div / 2) as i64;
    if m >= 0 {
        ((m + d2) / div as i64) as i32
    } else {
        -(((-m) + d2) / div as i64) as i32
    }
}

fn rescale_unsigned(x: u32, mul: u32, div: u32) -> u32 {
    let m = x as u64 * mul as u64;
    if div == 0 {
        m as u32
    } else {
        ((m + (div / 2) as u64) / div as u64) as u32
    }
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Rect at the origin
    pub const fn wh(w: u32, h: u32) -> Self {
        Self { x: 0, y: 0, w, h }
    }

    /// Map `self` from the `div` coordinate space into the `mul` space, rounding to nearest
    pub fn rescale(self, mul: Rect, div: Rect) -> Rect {
        Rect {
            x: rescale_signed(self.x - div.x, mul.w, div.w) + mul.x,
            y: rescale_signed(self.y - div.y, mul.h, div.h) + mul.y,
            w: rescale_unsigned(self.w, mul.w, div.w),
            h: rescale_unsigned(self.h, mul.h, div.h),
        }
    }

    pub fn add_xy(self, b: Rect) -> Rect {
        Rect {
            x: self.x + b.x,
            y: self.y + b.y,
            ..self
        }
    }

    /// Pixels to 16.16 fixed point
    ///
    /// Exact for x, y below 32768 and w, h below 65536, which covers every
    /// rect inside a framebuffer (sides are capped at `fb::MAX_FB_DIM`).
    /// Anything larger saturates rather than wrapping negative.
    pub fn shl16(self) -> Rect {
        const ONE: i32 = 1 << 16;
        Rect {
            x: self.x.saturating_mul(ONE),
            y: self.y.saturating_mul(ONE),
            w: self.w.saturating_mul(ONE as u32),
            h: self.h.saturating_mul(ONE as u32),
        }
    }

    /// 16.16 fixed point to pixels, rounding to nearest
    pub fn shr16_rnd(self) -> Rect {
        Rect {
            x: (self.x + 0x8000) >> 16,
            y: (self.y + 0x8000) >> 16,
            w: (self.w + 0x8000) >> 16,
            h: (self.h + 0x8000) >> 16,
        }
    }

    /// True if `inner` lies entirely within `self`
    pub fn contains(&self, inner: &Rect) -> bool {
        inner.x >= self.x
            && inner.y >= self.y
            && inner.x as i64 + inner.w as i64 <= self.x as i64 + self.w as i64
            && inner.y as i64 + inner.h as i64 <= self.y as i64 + self.h as i64
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

/// Unsigned fraction, e.g. an aspect ratio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UFrac {
    pub num: u32,
    pub den: u32,
}

impl UFrac {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Cancel small common prime factors
    pub fn reduce(self) -> UFrac {
        const PRIMES: [u32; 9] = [2, 3, 5, 7, 11, 13, 17, 19, 23];
        let mut x = self;
        if x.num == 0 || x.den == 0 {
            return x;
        }
        for p in PRIMES {
            while x.den % p == 0 && x.num % p == 0 {
                x.den /= p;
                x.num /= p;
            }
        }
        x
    }
}
