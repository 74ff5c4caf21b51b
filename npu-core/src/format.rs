//! Buffer formats
//!
//! Each queue target carries one format, resolved against a static
//! colorspace table.

use crate::buffer::Direction;
use crate::error::{Error, Result};
use crate::MAX_PLANES;

/// Build a little-endian fourcc code
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Known colorspace codes
pub mod colorspace {
    use super::fourcc;

    pub const RGB: u32 = fourcc(b'R', b'G', b'B', b'3');
    pub const U8: u32 = fourcc(b'U', b'0', b'0', b'8');
    pub const U16: u32 = fourcc(b'U', b'0', b'1', b'6');
    pub const U32: u32 = fourcc(b'U', b'0', b'3', b'2');
    pub const S16: u32 = fourcc(b'S', b'0', b'1', b'6');
    pub const S32: u32 = fourcc(b'S', b'0', b'3', b'2');
    pub const F32: u32 = fourcc(b'F', b'0', b'3', b'2');
    pub const YUYV: u32 = fourcc(b'Y', b'U', b'Y', b'V');
    pub const NV12: u32 = fourcc(b'N', b'V', b'1', b'2');
    pub const NV21: u32 = fourcc(b'N', b'V', b'2', b'1');
    pub const YV12: u32 = fourcc(b'Y', b'V', b'1', b'2');
    pub const I420: u32 = fourcc(b'Y', b'U', b'1', b'2');
    pub const I422: u32 = fourcc(b'Y', b'U', b'1', b'6');
    pub const NPU: u32 = fourcc(b'N', b'P', b'U', b'0');
}

/// Format table entry
#[derive(Debug)]
pub struct FormatDesc {
    pub name: &'static str,
    pub colorspace: u32,
    pub planes: usize,
    pub bitsperpixel: [u32; MAX_PLANES],
}

static FORMAT_TABLE: &[FormatDesc] = &[
    FormatDesc {
        name: "RGB",
        colorspace: colorspace::RGB,
        planes: 1,
        bitsperpixel: [24, 0, 0],
    },
    FormatDesc {
        name: "U8",
        colorspace: colorspace::U8,
        planes: 1,
        bitsperpixel: [8, 0, 0],
    },
    FormatDesc {
        name: "U16",
        colorspace: colorspace::U16,
        planes: 1,
        bitsperpixel: [16, 0, 0],
    },
    FormatDesc {
        name: "U32",
        colorspace: colorspace::U32,
        planes: 1,
        bitsperpixel: [32, 0, 0],
    },
    FormatDesc {
        name: "S16",
        colorspace: colorspace::S16,
        planes: 1,
        bitsperpixel: [16, 0, 0],
    },
    FormatDesc {
        name: "S32",
        colorspace: colorspace::S32,
        planes: 1,
        bitsperpixel: [32, 0, 0],
    },
    FormatDesc {
        name: "F32",
        colorspace: colorspace::F32,
        planes: 1,
        bitsperpixel: [32, 0, 0],
    },
    FormatDesc {
        name: "YUYV",
        colorspace: colorspace::YUYV,
        planes: 1,
        bitsperpixel: [16, 0, 0],
    },
    FormatDesc {
        name: "NV12",
        colorspace: colorspace::NV12,
        planes: 2,
        bitsperpixel: [8, 4, 0],
    },
    FormatDesc {
        name: "NV21",
        colorspace: colorspace::NV21,
        planes: 2,
        bitsperpixel: [8, 4, 0],
    },
    FormatDesc {
        name: "YV12",
        colorspace: colorspace::YV12,
        planes: 3,
        bitsperpixel: [8, 2, 2],
    },
    FormatDesc {
        name: "I420",
        colorspace: colorspace::I420,
        planes: 3,
        bitsperpixel: [8, 2, 2],
    },
    FormatDesc {
        name: "I422",
        colorspace: colorspace::I422,
        planes: 3,
        bitsperpixel: [8, 4, 4],
    },
    FormatDesc {
        name: "NPU",
        colorspace: colorspace::NPU,
        planes: 1,
        bitsperpixel: [8, 0, 0],
    },
];

/// Resolve a colorspace code against the format table
pub fn find_format(colorspace: u32) -> Result<&'static FormatDesc> {
    FORMAT_TABLE
        .iter()
        .find(|desc| desc.colorspace == colorspace)
        .ok_or(Error::InvalidFormat(colorspace))
}

/// Requested format for one target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatRequest {
    /// Address-vector target this format applies to
    pub target: u32,
    pub colorspace: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub cstride: u32,
    /// Channel count, only meaningful for the NPU colorspace
    pub channels: u32,
}

/// Format list handed to S_FORMAT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatList {
    pub direction: Direction,
    pub formats: Vec<FormatRequest>,
}

/// Resolved format with per-plane byte sizes
#[derive(Debug, Clone)]
pub struct Format {
    pub target: u32,
    pub desc: &'static FormatDesc,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub cstride: u32,
    pub channels: u32,
    pub size: [usize; MAX_PLANES],
}

impl Format {
    pub fn resolve(req: &FormatRequest) -> Result<Self> {
        let desc = find_format(req.colorspace)?;

        if req.width == 0 || req.height == 0 {
            return Err(Error::InvalidArgument(format!(
                "target {}: zero-sized format {}x{}",
                req.target, req.width, req.height
            )));
        }

        let channels = req.channels.max(1);
        let too_large = || {
            Error::InvalidArgument(format!(
                "target {}: format {}x{}x{} too large",
                req.target, channels, req.height, req.width
            ))
        };
        let pixels = (req.width as usize)
            .checked_mul(req.height as usize)
            .ok_or_else(too_large)?;

        let mut size = [0usize; MAX_PLANES];
        for (plane, bits) in desc.bitsperpixel.iter().take(desc.planes).enumerate() {
            let mut bytes = pixels.checked_mul(*bits as usize).ok_or_else(too_large)? / 8;
            if desc.colorspace == colorspace::NPU {
                bytes = bytes.checked_mul(channels as usize).ok_or_else(too_large)?;
            }
            size[plane] = bytes;
        }
        size.iter()
            .try_fold(0usize, |total, s| total.checked_add(*s))
            .ok_or_else(too_large)?;

        Ok(Self {
            target: req.target,
            desc,
            width: req.width,
            height: req.height,
            stride: req.stride,
            cstride: req.cstride,
            channels,
            size,
        })
    }

    pub fn planes(&self) -> usize {
        self.desc.planes
    }

    /// Bytes needed by one buffer of this format
    pub fn total_size(&self) -> usize {
        self.size.iter().sum()
    }

    /// Declared (channel, height, width) shape
    pub fn dims(&self) -> (usize, usize, usize) {
        (
            self.channels as usize,
            self.height as usize,
            self.width as usize,
        )
    }
}
