use crate::error::{PostframeError, PostframeResult};

pub use kurbo::{Affine, BezPath, Circle, Ellipse, Point, Rect, RoundedRect, Vec2};

/// Pixel dimensions of an export surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SurfaceSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> PostframeResult<Self> {
        if width == 0 || height == 0 {
            return Err(PostframeError::validation(
                "surface width/height must be > 0",
            ));
        }
        Ok(Self { width, height })
    }
}

/// Width:height ratio of a template, kept rational so derived surface
/// heights stay exact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AspectRatio {
    /// Width component.
    pub num: u32,
    /// Height component, must be non-zero.
    pub den: u32,
}

impl AspectRatio {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Derive the surface height for a target pixel width.
    ///
    /// Fails when the ratio does not divide the width exactly; fractional
    /// pixel heights are never rounded into existence.
    pub fn height_for_width(self, width: u32) -> PostframeResult<u32> {
        if self.num == 0 || self.den == 0 {
            return Err(PostframeError::validation(
                "aspect ratio components must be > 0",
            ));
        }
        let scaled = u64::from(width) * u64::from(self.den);
        if !scaled.is_multiple_of(u64::from(self.num)) {
            return Err(PostframeError::validation(format!(
                "aspect ratio {}:{} does not produce an integral height for width {width}",
                self.num, self.den
            )));
        }
        let height = scaled / u64::from(self.num);
        u32::try_from(height)
            .map_err(|_| PostframeError::validation("derived surface height exceeds u32"))
    }
}

/// Straight-alpha RGBA8 color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba8 {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Premultiply into `[r, g, b, a]` bytes.
    pub fn premul_bytes(self) -> [u8; 4] {
        fn premul(c: u8, a: u8) -> u8 {
            let c = u16::from(c);
            let a = u16::from(a);
            (((c * a) + 127) / 255) as u8
        }
        [
            premul(self.r, self.a),
            premul(self.g, self.a),
            premul(self.b, self.a),
            self.a,
        ]
    }

    /// Scale alpha by `opacity` in [0, 1].
    pub fn with_opacity(self, opacity: f64) -> Self {
        let a = (f64::from(self.a) * opacity.clamp(0.0, 1.0)).round() as u8;
        Self { a, ..self }
    }
}
