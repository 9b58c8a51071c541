//! Pixel formats and usage bits
//!
//! Numeric values match the Android HAL codes carried in serialized handles.

use crate::error::{Error, Result};
use bitflags::bitflags;

/// Pixel formats known to the allocator
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8888 = 0x1,
    Rgbx8888 = 0x2,
    Rgb888 = 0x3,
    Rgb565 = 0x4,
    Bgra8888 = 0x5,
    YCbCr422Sp = 0x10,
    YCrCb420Sp = 0x11,
    YCbCr422I = 0x14,
    Raw16 = 0x20,
    Blob = 0x21,
    ImplementationDefined = 0x22,
    YCbCr420Flexible = 0x23,
    Yv12 = 0x3231_5659,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 13] = [
        PixelFormat::Rgba8888,
        PixelFormat::Rgbx8888,
        PixelFormat::Rgb888,
        PixelFormat::Rgb565,
        PixelFormat::Bgra8888,
        PixelFormat::YCbCr422Sp,
        PixelFormat::YCrCb420Sp,
        PixelFormat::YCbCr422I,
        PixelFormat::Raw16,
        PixelFormat::Blob,
        PixelFormat::ImplementationDefined,
        PixelFormat::YCbCr420Flexible,
        PixelFormat::Yv12,
    ];

    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.code() == code)
            .ok_or(Error::UnsupportedFormat(code))
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Bytes per pixel of the first plane, 0 when the allocator cannot size it
    ///
    /// Planar formats only count the luma plane.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => 4,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 | PixelFormat::YCbCr422I => 2,
            PixelFormat::Yv12 | PixelFormat::YCbCr422Sp | PixelFormat::YCrCb420Sp => 1,
            PixelFormat::Raw16
            | PixelFormat::Blob
            | PixelFormat::ImplementationDefined
            | PixelFormat::YCbCr420Flexible => 0,
        }
    }

    pub fn is_supported(self) -> bool {
        self.bytes_per_pixel() > 0
    }

    /// Bytes per pixel, rejecting formats this allocation path cannot size
    pub fn checked_bytes_per_pixel(self) -> Result<u32> {
        match self.bytes_per_pixel() {
            0 => Err(Error::UnsupportedFormat(self.code())),
            bpp => Ok(bpp),
        }
    }

    /// Stride-sized rows needed to hold every plane of a `height`-row image
    pub fn total_rows(self, height: u32) -> u64 {
        let height = u64::from(height);
        match self {
            PixelFormat::Yv12 | PixelFormat::YCrCb420Sp => height + height.div_ceil(2),
            PixelFormat::YCbCr422Sp => height * 2,
            _ => height,
        }
    }
}

bitflags! {
    /// Buffer usage bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const SW_READ_RARELY    = 0x0000_0002;
        const SW_READ_OFTEN     = 0x0000_0003;
        const SW_READ_MASK      = 0x0000_000f;
        const SW_WRITE_RARELY   = 0x0000_0020;
        const SW_WRITE_OFTEN    = 0x0000_0030;
        const SW_WRITE_MASK     = 0x0000_00f0;
        const HW_TEXTURE        = 0x0000_0100;
        const HW_RENDER         = 0x0000_0200;
        const HW_2D             = 0x0000_0400;
        const HW_COMPOSER       = 0x0000_0800;
        const HW_FB             = 0x0000_1000;
        const HW_VIDEO_ENCODER  = 0x0001_0000;
        const HW_CAMERA_WRITE   = 0x0002_0000;
        const HW_CAMERA_READ    = 0x0004_0000;

        // Vendor bits pass through untouched
        const _ = !0;
    }
}

impl BufferUsage {
    /// Whether any CPU read or write access is requested
    pub fn wants_cpu(self) -> bool {
        self.intersects(Self::SW_READ_MASK | Self::SW_WRITE_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_formats_have_positive_bpp() {
        for format in PixelFormat::ALL {
            if format.is_supported() {
                assert!(format.checked_bytes_per_pixel().unwrap() > 0);
            } else {
                assert!(matches!(
                    format.checked_bytes_per_pixel(),
                    Err(Error::UnsupportedFormat(code)) if code == format.code()
                ));
            }
        }
    }

    #[test]
    fn test_codes_round_trip() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_code(format.code()).unwrap(), format);
        }
        assert!(matches!(
            PixelFormat::from_code(0x7777),
            Err(Error::UnsupportedFormat(0x7777))
        ));
    }

    #[test]
    fn test_planar_formats_reserve_chroma_rows() {
        assert_eq!(PixelFormat::Rgba8888.total_rows(1280), 1280);
        assert_eq!(PixelFormat::Yv12.total_rows(1280), 1920);
        assert_eq!(PixelFormat::YCrCb420Sp.total_rows(5), 8);
        assert_eq!(PixelFormat::YCbCr422Sp.total_rows(10), 20);
    }

    #[test]
    fn test_cpu_usage_detection() {
        assert!(BufferUsage::SW_READ_RARELY.wants_cpu());
        assert!(BufferUsage::SW_WRITE_OFTEN.wants_cpu());
        assert!(!(BufferUsage::HW_TEXTURE | BufferUsage::HW_FB).wants_cpu());
        assert!(!BufferUsage::empty().wants_cpu());
    }
}
