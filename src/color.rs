//! Pixel formats, the device conversion registry and the CPU reference path.
//!
//! The device understands a fixed set of six RGBA formats and converts
//! between them with compiled kernels; any pair outside that set falls back
//! to the CPU conversions in this module. Indirect conversions always route
//! through linear RGBA float.

/// Exponent of the gamma-encoded formats.
const GAMMA: f32 = 2.2;

/// A typed pixel layout.
///
/// The first six variants form the device conversion registry; [`YF32`] is
/// convertible on the CPU only and is typically used for scratch luminance
/// planes.
///
/// [`YF32`]: Self::YF32
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PixelFormat {
    /// 32-bit float RGBA, linear light, straight alpha.
    RgbaF32,

    /// 32-bit float RGBA, linear light, premultiplied alpha.
    PremulRgbaF32,

    /// 32-bit float RGBA, gamma 2.2 encoded, straight alpha.
    GammaRgbaF32,

    /// 32-bit float RGBA, gamma 2.2 encoded, premultiplied alpha.
    PremulGammaRgbaF32,

    /// 8-bit unsigned RGBA, linear light, straight alpha.
    RgbaU8,

    /// 8-bit unsigned RGBA, gamma 2.2 encoded, straight alpha.
    GammaRgbaU8,

    /// 32-bit float single-channel luminance.
    YF32,
}

impl PixelFormat {
    /// Storage size of one pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::RgbaF32
            | Self::PremulRgbaF32
            | Self::GammaRgbaF32
            | Self::PremulGammaRgbaF32 => 16,
            Self::RgbaU8 | Self::GammaRgbaU8 | Self::YF32 => 4,
        }
    }

    /// Number of channels in one pixel.
    pub const fn channels(self) -> usize {
        match self {
            Self::YF32 => 1,
            _ => 4,
        }
    }
}

/// The formats the device conversion kernels understand.
pub const REGISTRY: [PixelFormat; 6] = [
    PixelFormat::RgbaF32,
    PixelFormat::PremulRgbaF32,
    PixelFormat::GammaRgbaF32,
    PixelFormat::PremulGammaRgbaF32,
    PixelFormat::RgbaU8,
    PixelFormat::GammaRgbaU8,
];

/// `true` when both formats are in the device registry.
pub fn is_supported(in_fmt: PixelFormat, out_fmt: PixelFormat) -> bool {
    REGISTRY.contains(&in_fmt) && REGISTRY.contains(&out_fmt)
}

/// One compiled conversion pass.
///
/// Every registry format has a kernel into and out of linear RGBA float, so
/// any supported pair converts in at most two passes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConvKernel {
    PremulFromLinear,
    LinearFromPremul,
    GammaFromLinear,
    LinearFromGamma,
    PremulGammaFromLinear,
    LinearFromPremulGamma,
    U8FromLinear,
    LinearFromU8,
    GammaU8FromLinear,
    LinearFromGammaU8,
}

impl ConvKernel {
    /// Format this kernel reads.
    pub const fn input(self) -> PixelFormat {
        match self {
            Self::PremulFromLinear
            | Self::GammaFromLinear
            | Self::PremulGammaFromLinear
            | Self::U8FromLinear
            | Self::GammaU8FromLinear => PixelFormat::RgbaF32,
            Self::LinearFromPremul => PixelFormat::PremulRgbaF32,
            Self::LinearFromGamma => PixelFormat::GammaRgbaF32,
            Self::LinearFromPremulGamma => PixelFormat::PremulGammaRgbaF32,
            Self::LinearFromU8 => PixelFormat::RgbaU8,
            Self::LinearFromGammaU8 => PixelFormat::GammaRgbaU8,
        }
    }

    /// Format this kernel writes.
    pub const fn output(self) -> PixelFormat {
        match self {
            Self::PremulFromLinear => PixelFormat::PremulRgbaF32,
            Self::GammaFromLinear => PixelFormat::GammaRgbaF32,
            Self::PremulGammaFromLinear => PixelFormat::PremulGammaRgbaF32,
            Self::U8FromLinear => PixelFormat::RgbaU8,
            Self::GammaU8FromLinear => PixelFormat::GammaRgbaU8,
            Self::LinearFromPremul
            | Self::LinearFromGamma
            | Self::LinearFromPremulGamma
            | Self::LinearFromU8
            | Self::LinearFromGammaU8 => PixelFormat::RgbaF32,
        }
    }
}

/// How to turn one registry format into another on the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ColorOp {
    /// One of the formats is outside the registry; convert on the CPU.
    Unsupported,

    /// Identical formats, no work needed.
    Equal,

    /// One or two kernel passes; two-pass conversions go through linear
    /// RGBA float.
    Convert(ConvKernel, Option<ConvKernel>),
}

const fn to_linear(fmt: PixelFormat) -> Option<ConvKernel> {
    match fmt {
        PixelFormat::RgbaF32 => None,
        PixelFormat::PremulRgbaF32 => Some(ConvKernel::LinearFromPremul),
        PixelFormat::GammaRgbaF32 => Some(ConvKernel::LinearFromGamma),
        PixelFormat::PremulGammaRgbaF32 => Some(ConvKernel::LinearFromPremulGamma),
        PixelFormat::RgbaU8 => Some(ConvKernel::LinearFromU8),
        PixelFormat::GammaRgbaU8 => Some(ConvKernel::LinearFromGammaU8),
        PixelFormat::YF32 => None,
    }
}

const fn from_linear(fmt: PixelFormat) -> Option<ConvKernel> {
    match fmt {
        PixelFormat::RgbaF32 => None,
        PixelFormat::PremulRgbaF32 => Some(ConvKernel::PremulFromLinear),
        PixelFormat::GammaRgbaF32 => Some(ConvKernel::GammaFromLinear),
        PixelFormat::PremulGammaRgbaF32 => Some(ConvKernel::PremulGammaFromLinear),
        PixelFormat::RgbaU8 => Some(ConvKernel::U8FromLinear),
        PixelFormat::GammaRgbaU8 => Some(ConvKernel::GammaU8FromLinear),
        PixelFormat::YF32 => None,
    }
}

/// Resolves the conversion between two formats.
pub fn conversion(in_fmt: PixelFormat, out_fmt: PixelFormat) -> ColorOp {
    if !is_supported(in_fmt, out_fmt) {
        return ColorOp::Unsupported;
    }

    if in_fmt == out_fmt {
        return ColorOp::Equal;
    }

    match (to_linear(in_fmt), from_linear(out_fmt)) {
        (Some(decode), Some(encode)) => ColorOp::Convert(decode, Some(encode)),
        (Some(decode), None) => ColorOp::Convert(decode, None),
        (None, Some(encode)) => ColorOp::Convert(encode, None),
        // both linear and not equal cannot happen within the registry
        (None, None) => ColorOp::Equal,
    }
}

fn get_f32(bytes: &[u8], index: usize) -> f32 {
    let at = index * 4;

    f32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn put_f32(bytes: &mut [u8], index: usize, value: f32) {
    let at = index * 4;

    bytes[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn gamma_encode(c: f32) -> f32 {
    c.max(0.0).powf(1.0 / GAMMA)
}

fn gamma_decode(c: f32) -> f32 {
    c.max(0.0).powf(GAMMA)
}

/// Decodes one pixel to linear straight-alpha RGBA.
pub fn decode_px(fmt: PixelFormat, src: &[u8]) -> [f32; 4] {
    match fmt {
        PixelFormat::RgbaF32 => [
            get_f32(src, 0),
            get_f32(src, 1),
            get_f32(src, 2),
            get_f32(src, 3),
        ],
        PixelFormat::PremulRgbaF32 => {
            let a = get_f32(src, 3);
            let unmul = if a == 0.0 { 0.0 } else { 1.0 / a };

            [
                get_f32(src, 0) * unmul,
                get_f32(src, 1) * unmul,
                get_f32(src, 2) * unmul,
                a,
            ]
        }
        PixelFormat::GammaRgbaF32 => [
            gamma_decode(get_f32(src, 0)),
            gamma_decode(get_f32(src, 1)),
            gamma_decode(get_f32(src, 2)),
            get_f32(src, 3),
        ],
        PixelFormat::PremulGammaRgbaF32 => {
            let a = get_f32(src, 3);
            let unmul = if a == 0.0 { 0.0 } else { 1.0 / a };

            [
                gamma_decode(get_f32(src, 0) * unmul),
                gamma_decode(get_f32(src, 1) * unmul),
                gamma_decode(get_f32(src, 2) * unmul),
                a,
            ]
        }
        PixelFormat::RgbaU8 => [
            src[0] as f32 / 255.0,
            src[1] as f32 / 255.0,
            src[2] as f32 / 255.0,
            src[3] as f32 / 255.0,
        ],
        PixelFormat::GammaRgbaU8 => [
            gamma_decode(src[0] as f32 / 255.0),
            gamma_decode(src[1] as f32 / 255.0),
            gamma_decode(src[2] as f32 / 255.0),
            src[3] as f32 / 255.0,
        ],
        PixelFormat::YF32 => {
            let y = get_f32(src, 0);

            [y, y, y, 1.0]
        }
    }
}

/// Encodes one linear straight-alpha RGBA pixel.
pub fn encode_px(fmt: PixelFormat, px: [f32; 4], dst: &mut [u8]) {
    let [r, g, b, a] = px;

    match fmt {
        PixelFormat::RgbaF32 => {
            put_f32(dst, 0, r);
            put_f32(dst, 1, g);
            put_f32(dst, 2, b);
            put_f32(dst, 3, a);
        }
        PixelFormat::PremulRgbaF32 => {
            put_f32(dst, 0, r * a);
            put_f32(dst, 1, g * a);
            put_f32(dst, 2, b * a);
            put_f32(dst, 3, a);
        }
        PixelFormat::GammaRgbaF32 => {
            put_f32(dst, 0, gamma_encode(r));
            put_f32(dst, 1, gamma_encode(g));
            put_f32(dst, 2, gamma_encode(b));
            put_f32(dst, 3, a);
        }
        PixelFormat::PremulGammaRgbaF32 => {
            put_f32(dst, 0, gamma_encode(r) * a);
            put_f32(dst, 1, gamma_encode(g) * a);
            put_f32(dst, 2, gamma_encode(b) * a);
            put_f32(dst, 3, a);
        }
        PixelFormat::RgbaU8 => {
            dst[0] = quantize(r);
            dst[1] = quantize(g);
            dst[2] = quantize(b);
            dst[3] = quantize(a);
        }
        PixelFormat::GammaRgbaU8 => {
            dst[0] = quantize(gamma_encode(r));
            dst[1] = quantize(gamma_encode(g));
            dst[2] = quantize(gamma_encode(b));
            dst[3] = quantize(a);
        }
        PixelFormat::YF32 => {
            put_f32(dst, 0, 0.2126 * r + 0.7152 * g + 0.0722 * b);
        }
    }
}

fn quantize(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// Converts `pixels` pixels between any two supported formats.
///
/// Identical formats are copied through; everything else goes pixel by pixel
/// through linear RGBA float.
pub fn convert_span(
    src_fmt: PixelFormat,
    dst_fmt: PixelFormat,
    src: &[u8],
    dst: &mut [u8],
    pixels: usize,
) {
    let src_bpp = src_fmt.bytes_per_pixel();
    let dst_bpp = dst_fmt.bytes_per_pixel();

    debug_assert!(src.len() >= pixels * src_bpp);
    debug_assert!(dst.len() >= pixels * dst_bpp);

    if src_fmt == dst_fmt {
        dst[..pixels * dst_bpp].copy_from_slice(&src[..pixels * src_bpp]);

        return;
    }

    for px in 0..pixels {
        let decoded = decode_px(src_fmt, &src[px * src_bpp..(px + 1) * src_bpp]);

        encode_px(dst_fmt, decoded, &mut dst[px * dst_bpp..(px + 1) * dst_bpp]);
    }
}
