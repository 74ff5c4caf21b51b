//! Golden compare strategies
//!
//! Golden files are always in raster order. A strategy decides where each
//! golden element lives in the device dump.

use std::fmt::Write;

use super::report::ReportBuffer;

/// Tensor shape of a compared buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim {
    pub channel: usize,
    pub height: usize,
    pub width: usize,
}

impl Dim {
    pub fn len(&self) -> usize {
        self.channel
            .saturating_mul(self.height)
            .saturating_mul(self.width)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a golden buffer is walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Declared dims did not multiply out to the golden size
    Flat(usize),
    Tensor(Dim),
}

impl Layout {
    pub fn len(&self) -> usize {
        match self {
            Layout::Flat(len) => *len,
            Layout::Tensor(dim) => dim.len(),
        }
    }
}

pub trait Comparator: Sync {
    fn name(&self) -> &'static str;

    /// Bytes the device dump must hold
    fn target_len(&self, layout: Layout) -> usize;

    /// Offset in the device dump of raster element (c, row, col)
    fn target_index(&self, dim: Dim, c: usize, row: usize, col: usize) -> usize;

    /// Compare and report every differing element; returns the mismatch count
    fn compare(
        &self,
        golden: &[u8],
        target: &[u8],
        layout: Layout,
        report: &mut ReportBuffer,
    ) -> usize {
        let mut mismatches = 0;
        let mut check = |report: &mut ReportBuffer, c: usize, row: usize, col: usize, g: u8, t: u8| {
            if g != t {
                mismatches += 1;
                let _ = writeln!(report, "({} {} {} 0x{:02x} 0x{:02x})", c, row, col, g, t);
            }
        };

        match layout {
            Layout::Flat(len) => {
                for i in 0..len {
                    check(report, 0, 0, i, golden[i], target[i]);
                }
            }
            Layout::Tensor(dim) => {
                for c in 0..dim.channel {
                    for row in 0..dim.height {
                        for col in 0..dim.width {
                            let g = golden[(c * dim.height + row) * dim.width + col];
                            let t = target[self.target_index(dim, c, row, col)];
                            check(report, c, row, col, g, t);
                        }
                    }
                }
            }
        }
        mismatches
    }
}

/// Byte-for-byte raster compare
pub struct SimpleComparator;

impl Comparator for SimpleComparator {
    fn name(&self) -> &'static str {
        "SIMPLE"
    }

    fn target_len(&self, layout: Layout) -> usize {
        layout.len()
    }

    fn target_index(&self, dim: Dim, c: usize, row: usize, col: usize) -> usize {
        (c * dim.height + row) * dim.width + col
    }
}

/// Compare against a dump stored in 4x4 tiles
///
/// Rows and columns are padded to multiples of four; each channel is a
/// row-major grid of 16-byte tiles. Flat layouts fall back to raster order.
pub struct ReorderedComparator;

const TILE: usize = 4;

fn align4(v: usize) -> usize {
    v.div_ceil(TILE) * TILE
}

impl Comparator for ReorderedComparator {
    fn name(&self) -> &'static str {
        "REORDERED"
    }

    fn target_len(&self, layout: Layout) -> usize {
        match layout {
            Layout::Flat(len) => len,
            Layout::Tensor(dim) => dim
                .channel
                .saturating_mul(align4(dim.height))
                .saturating_mul(align4(dim.width)),
        }
    }

    fn target_index(&self, dim: Dim, c: usize, row: usize, col: usize) -> usize {
        let w4 = align4(dim.width);
        let h4 = align4(dim.height);
        c * h4 * w4
            + (row / TILE) * w4 * TILE
            + (col / TILE) * TILE * TILE
            + (row % TILE) * TILE
            + col % TILE
    }
}

/// Selectable strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparatorKind {
    #[default]
    Simple,
    Reordered,
}

static SIMPLE: SimpleComparator = SimpleComparator;
static REORDERED: ReorderedComparator = ReorderedComparator;

static COMPARATORS: &[(&str, ComparatorKind)] = &[
    ("SIMPLE", ComparatorKind::Simple),
    ("REORDERED", ComparatorKind::Reordered),
];

impl ComparatorKind {
    /// Case-insensitive lookup
    pub fn from_name(name: &str) -> Option<Self> {
        COMPARATORS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, kind)| *kind)
    }

    pub fn comparator(&self) -> &'static dyn Comparator {
        match self {
            ComparatorKind::Simple => &SIMPLE,
            ComparatorKind::Reordered => &REORDERED,
        }
    }

    pub fn name(&self) -> &'static str {
        self.comparator().name()
    }
}
