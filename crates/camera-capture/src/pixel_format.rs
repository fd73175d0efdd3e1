//! Pixel format registry
//!
//! Static table of the color modes the driver knows, plus per-session probing
//! of which ones the connected sensor actually accepts.

use tracing::{debug, info};

use crate::device::{Device, DeviceErrorCode};
use crate::CameraError;

const ORDER_RGB: u32 = 0x0080;
const FORMAT_PLANAR: u32 = 0x2000;

/// Bits and channels of one pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    /// Total bits across all channels
    pub bit_depth: u32,
    pub channels: u32,
}

/// A named color mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub name: &'static str,
    /// Device color mode code
    pub code: u32,
    /// `None` for compressed, planar and variable-length encodings
    pub layout: Option<PixelLayout>,
}

impl PixelFormat {
    const fn fixed(name: &'static str, code: u32, bit_depth: u32, channels: u32) -> Self {
        Self {
            name,
            code,
            layout: Some(PixelLayout {
                bit_depth,
                channels,
            }),
        }
    }

    const fn opaque(name: &'static str, code: u32) -> Self {
        Self {
            name,
            code,
            layout: None,
        }
    }

    /// Layout, or `UnsupportedFormat` for encodings without one
    pub fn layout(&self) -> Result<PixelLayout, CameraError> {
        self.layout.ok_or_else(|| {
            CameraError::UnsupportedFormat(format!("{} has no fixed pixel layout", self.name))
        })
    }

    /// Bytes per pixel (all channels)
    pub fn bytes_per_pixel(&self) -> Result<usize, CameraError> {
        let layout = self.layout()?;
        Ok(layout.bit_depth.div_ceil(8) as usize)
    }

    /// Bytes per channel element; only 1, 2 and 4 are decodable
    pub fn element_bytes(&self) -> Result<usize, CameraError> {
        let layout = self.layout()?;
        let bits = layout.bit_depth / layout.channels.max(1);
        match bits {
            8 | 16 | 32 if layout.bit_depth % layout.channels.max(1) == 0 => Ok(bits as usize / 8),
            _ => Err(CameraError::UnsupportedFormat(format!(
                "{}: {} bits over {} channels is not a whole element",
                self.name, layout.bit_depth, layout.channels
            ))),
        }
    }

    /// Size of a `width` x `height` frame without row padding
    pub fn frame_bytes(&self, width: u32, height: u32) -> Result<usize, CameraError> {
        Ok(width as usize * height as usize * self.bytes_per_pixel()?)
    }
}

/// Every color mode the driver can name.
///
/// Packed modes are treated as a single channel; no unpacking is done.
pub static PIXEL_FORMATS: &[PixelFormat] = &[
    PixelFormat::fixed("raw8", 11, 8, 1),
    PixelFormat::fixed("raw10", 33, 16, 1),
    PixelFormat::fixed("raw12", 27, 16, 1),
    PixelFormat::fixed("raw16", 29, 16, 1),
    PixelFormat::fixed("mono8", 6, 8, 1),
    PixelFormat::fixed("mono10", 34, 16, 1),
    PixelFormat::fixed("mono12", 26, 16, 1),
    PixelFormat::fixed("mono16", 28, 16, 1),
    PixelFormat::fixed("bgr5p", 3, 16, 1),
    PixelFormat::fixed("bgr565p", 2, 16, 1),
    PixelFormat::fixed("rgb8p", 1 | ORDER_RGB, 24, 3),
    PixelFormat::fixed("bgr8p", 1, 24, 3),
    PixelFormat::fixed("rgba8p", ORDER_RGB, 32, 4),
    PixelFormat::fixed("bgra8p", 0, 32, 4),
    PixelFormat::fixed("rgby8p", 24 | ORDER_RGB, 32, 4),
    PixelFormat::fixed("bgry8p", 24, 32, 4),
    PixelFormat::fixed("rgb10p", 25 | ORDER_RGB, 24, 1),
    PixelFormat::fixed("bgr10p", 25, 24, 1),
    PixelFormat::fixed("rgb10up", 35 | ORDER_RGB, 48, 3),
    PixelFormat::fixed("bgr10up", 35, 48, 3),
    PixelFormat::fixed("rgb12up", 30 | ORDER_RGB, 48, 3),
    PixelFormat::fixed("bgr12up", 30, 48, 3),
    PixelFormat::fixed("rgba12up", 31 | ORDER_RGB, 64, 4),
    PixelFormat::fixed("bgra12up", 31, 64, 4),
    PixelFormat::opaque("cbycryp", 23),
    PixelFormat::fixed("uyuvp", 12, 32, 4),
    PixelFormat::fixed("uyvy_monop", 13, 32, 4),
    PixelFormat::fixed("uyuv_bayerp", 14, 32, 4),
    PixelFormat::opaque("jpeg", 32),
    PixelFormat::opaque("rgb8plan", 1 | ORDER_RGB | FORMAT_PLANAR),
];

/// Pixel formats accepted by one device, probed once per session
#[derive(Debug, Clone, Default)]
pub struct PixelFormatRegistry {
    supported: Vec<&'static PixelFormat>,
}

impl PixelFormatRegistry {
    /// All known formats
    pub fn all() -> &'static [PixelFormat] {
        PIXEL_FORMATS
    }

    /// Look up a format by name
    pub fn by_name(name: &str) -> Option<&'static PixelFormat> {
        PIXEL_FORMATS.iter().find(|f| f.name == name)
    }

    /// Look up a format by device code.
    ///
    /// Codes carrying extra flag bits fall back to a match on the low 7 bits.
    pub fn by_code(code: u32) -> Option<&'static PixelFormat> {
        PIXEL_FORMATS
            .iter()
            .find(|f| f.code == code)
            .or_else(|| PIXEL_FORMATS.iter().find(|f| f.code == code & 0x7F))
    }

    /// Probe every known format against `device`
    pub fn probe<D: Device>(device: &mut D) -> Result<Self, CameraError> {
        Self::probe_candidates(device, PIXEL_FORMATS)
    }

    /// Probe `candidates` against `device`.
    ///
    /// A format is supported only if the device reads back exactly the code
    /// that was requested. The original color mode is restored afterwards,
    /// also when probing fails.
    pub fn probe_candidates<D: Device>(
        device: &mut D,
        candidates: &'static [PixelFormat],
    ) -> Result<Self, CameraError> {
        let original = device.color_mode()?;

        let probed: Result<Vec<_>, CameraError> = candidates
            .iter()
            .filter_map(|format| match probe_format(device, format) {
                Ok(true) => Some(Ok(format)),
                Ok(false) => None,
                Err(err) => Some(Err(err)),
            })
            .collect();

        let restored = device.set_color_mode(original);
        let supported = probed?;
        restored?;

        info!(
            "Supported color modes: {:?}",
            supported.iter().map(|f| f.name).collect::<Vec<_>>()
        );
        Ok(Self { supported })
    }

    /// Formats that passed probing, in table order
    pub fn supported(&self) -> &[&'static PixelFormat] {
        &self.supported
    }

    /// Names of the formats that passed probing
    pub fn supported_names(&self) -> Vec<&'static str> {
        self.supported.iter().map(|f| f.name).collect()
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.supported.iter().any(|f| f.name == name)
    }
}

/// Apply `format` and check the readback
fn probe_format<D: Device>(device: &mut D, format: &PixelFormat) -> Result<bool, CameraError> {
    match device.set_color_mode(format.code) {
        Ok(()) => {
            let applied = device.color_mode()?;
            debug!("Probe {}: requested {}, got {}", format.name, format.code, applied);
            Ok(applied == format.code)
        }
        Err(err) if err.kind == DeviceErrorCode::InvalidColorFormat => {
            debug!("Probe {}: rejected", format.name);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_code() {
        let mono16 = PixelFormatRegistry::by_name("mono16").unwrap();
        assert_eq!(mono16.code, 28);
        assert_eq!(PixelFormatRegistry::by_code(28), Some(mono16));

        let rgb8p = PixelFormatRegistry::by_name("rgb8p").unwrap();
        assert_eq!(PixelFormatRegistry::by_code(rgb8p.code).unwrap().name, "rgb8p");

        // Unknown flag bits resolve through the low bits
        assert_eq!(PixelFormatRegistry::by_code(0x4000 | 6).unwrap().name, "mono8");
        assert!(PixelFormatRegistry::by_name("nv12").is_none());
    }

    #[test]
    fn test_codes_and_names_are_unique() {
        for (i, a) in PIXEL_FORMATS.iter().enumerate() {
            for b in &PIXEL_FORMATS[i + 1..] {
                assert_ne!(a.name, b.name);
                assert_ne!(a.code, b.code, "{} and {}", a.name, b.name);
            }
        }
    }

    #[test]
    fn test_element_bytes() {
        let element = |name| PixelFormatRegistry::by_name(name).unwrap().element_bytes();
        assert_eq!(element("mono8").unwrap(), 1);
        assert_eq!(element("mono16").unwrap(), 2);
        assert_eq!(element("rgb8p").unwrap(), 1);
        assert_eq!(element("rgba12up").unwrap(), 2);
        assert!(matches!(element("rgb10p"), Err(CameraError::UnsupportedFormat(_))));
        assert!(matches!(element("jpeg"), Err(CameraError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_frame_bytes() {
        let mono16 = PixelFormatRegistry::by_name("mono16").unwrap();
        assert_eq!(mono16.frame_bytes(64, 48).unwrap(), 64 * 48 * 2);

        let bgr8p = PixelFormatRegistry::by_name("bgr8p").unwrap();
        assert_eq!(bgr8p.frame_bytes(10, 10).unwrap(), 300);
    }
}
