//! Golden reference matcher
//!
//! A description of reference files is streamed in through
//! `open_desc`/`write_desc`/`close_desc`; closing loads every file.
//! Completed frames are then compared against the references and the
//! differences collected into a bounded text report.
//!
//! ```text
//! NOT_INITIALIZED ─► OPENED ─► ADDING_FILES ─► CONFIGURED ◄─► COMPARING
//!                      ▲            │
//!                      └── failure ─┘
//! ```

pub mod comparator;
pub mod parser;
pub mod report;

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::buffer::AvBuffer;
use crate::config::GoldenConfig;
use crate::error::{Error, Result};
use crate::memory::{DmaDirection, MemoryBackend};

pub use comparator::{Comparator, ComparatorKind, Dim, Layout};
pub use parser::{Description, GoldenEntry, ParseState, Parser};
pub use report::ReportBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    NotInitialized,
    Opened,
    AddingFiles,
    Configured,
    Comparing,
}

/// Loaded reference for one address vector
#[derive(Debug)]
pub struct GoldenFile {
    pub av_index: u32,
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// Identity of a frame offered for comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: u32,
    pub net_id: u32,
}

struct GoldenContext {
    state: MatchState,
    parser: Option<Parser>,
    frame_id: Option<u32>,
    net_id: Option<u32>,
    comparator: ComparatorKind,
    files: Vec<GoldenFile>,
    report: ReportBuffer,
}

impl GoldenContext {
    fn reset(&mut self) {
        self.parser = None;
        self.frame_id = None;
        self.net_id = None;
        self.comparator = ComparatorKind::default();
        self.files.clear();
        self.report.clear();
    }
}

pub struct GoldenMatcher {
    enabled: bool,
    ctx: Mutex<GoldenContext>,
    loaded: AtomicBool,
    compared: AtomicU64,
}

impl GoldenMatcher {
    pub fn new(config: &GoldenConfig) -> Self {
        Self {
            enabled: config.enabled,
            ctx: Mutex::new(GoldenContext {
                state: MatchState::NotInitialized,
                parser: None,
                frame_id: None,
                net_id: None,
                comparator: ComparatorKind::default(),
                files: Vec::new(),
                report: ReportBuffer::new(config.result_capacity),
            }),
            loaded: AtomicBool::new(false),
            compared: AtomicU64::new(0),
        }
    }

    /// Driver probe hook
    pub fn init(&self) {
        let mut ctx = self.ctx.lock();
        if ctx.state == MatchState::NotInitialized {
            ctx.state = MatchState::Opened;
        }
    }

    pub fn state(&self) -> MatchState {
        self.ctx.lock().state
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Frames compared since probe
    pub fn compared(&self) -> u64 {
        self.compared.load(Ordering::Relaxed)
    }

    /// Start a new description, dropping the previous configuration
    pub fn open_desc(&self) -> Result<()> {
        if !self.enabled {
            return Err(Error::InvalidState("golden matching disabled"));
        }

        let mut ctx = self.ctx.lock();
        match ctx.state {
            MatchState::NotInitialized => {
                return Err(Error::InvalidState("golden matcher not initialized"))
            }
            MatchState::AddingFiles => return Err(Error::Busy),
            _ => {}
        }

        self.loaded.store(false, Ordering::Release);
        ctx.reset();
        ctx.parser = Some(Parser::new());
        ctx.state = MatchState::AddingFiles;
        debug!("golden: description opened");
        Ok(())
    }

    /// Feed description text; the whole write fails on the first bad byte
    pub fn write_desc(&self, buf: &[u8]) -> Result<usize> {
        let mut ctx = self.ctx.lock();
        if ctx.state != MatchState::AddingFiles {
            return Err(Error::InvalidState("description not open"));
        }
        let parser = ctx
            .parser
            .as_mut()
            .ok_or(Error::InvalidState("description not open"))?;
        parser.feed(buf)?;
        Ok(buf.len())
    }

    /// Finish the description and load every referenced file
    pub fn close_desc(&self) -> Result<()> {
        let mut ctx = self.ctx.lock();
        if ctx.state != MatchState::AddingFiles {
            return Err(Error::InvalidState("description not open"));
        }
        let parser = ctx
            .parser
            .take()
            .ok_or(Error::InvalidState("description not open"))?;

        // Anything below leaves the matcher unconfigured
        ctx.state = MatchState::Opened;
        let desc = parser.finish()?;

        let mut files = Vec::with_capacity(desc.entries.len());
        for entry in desc.entries {
            let data = load_file(&entry.path)?;
            debug!(
                "golden: av {} <- {} ({} bytes)",
                entry.av_index,
                entry.path.display(),
                data.len()
            );
            files.push(GoldenFile {
                av_index: entry.av_index,
                path: entry.path,
                data,
            });
        }

        info!(
            "golden: configured {} files, comparator {}, frame {:?}, net {:?}",
            files.len(),
            desc.comparator.name(),
            desc.frame_id,
            desc.net_id
        );
        ctx.frame_id = desc.frame_id;
        ctx.net_id = desc.net_id;
        ctx.comparator = desc.comparator;
        ctx.files = files;
        ctx.state = MatchState::Configured;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Compare a completed frame; returns the number of differing bytes
    ///
    /// Frames that do not pass the configured filters are skipped without
    /// touching their buffers.
    pub fn compare(
        &self,
        frame: &FrameInfo,
        avs: &[AvBuffer],
        backend: &dyn MemoryBackend,
    ) -> Result<usize> {
        if !self.is_loaded() {
            return Ok(0);
        }

        let mut ctx = self.ctx.lock();
        if ctx.state != MatchState::Configured {
            return Ok(0);
        }
        if ctx.frame_id.is_some_and(|id| id != frame.frame_id)
            || ctx.net_id.is_some_and(|id| id != frame.net_id)
        {
            debug!(
                "golden: frame {} net {} filtered out",
                frame.frame_id, frame.net_id
            );
            return Ok(0);
        }

        ctx.state = MatchState::Comparing;
        let result = run_compare(&mut ctx, frame, avs, backend);
        ctx.state = MatchState::Configured;
        self.compared.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Reader over the compare report with its own position
    pub fn open_result(&self) -> ResultReader<'_> {
        ResultReader {
            matcher: self,
            pos: 0,
        }
    }

    pub fn result_text(&self) -> String {
        self.ctx.lock().report.as_str().to_string()
    }
}

fn run_compare(
    ctx: &mut GoldenContext,
    frame: &FrameInfo,
    avs: &[AvBuffer],
    backend: &dyn MemoryBackend,
) -> Result<usize> {
    let GoldenContext {
        files,
        report,
        comparator,
        ..
    } = ctx;
    let comparator = comparator.comparator();

    let _ = writeln!(
        report,
        "frame {} net {} ({}):",
        frame.frame_id,
        frame.net_id,
        comparator.name()
    );

    let mut total = 0;
    for file in files.iter() {
        let Some(av) = avs.iter().find(|av| av.index == file.av_index && av.batch == 0) else {
            let _ = writeln!(report, "  av {}: no live buffer", file.av_index);
            return Err(Error::NotFound(format!("address vector {}", file.av_index)));
        };

        let golden_len = file.data.len();
        let (c, h, w) = av.dims;
        let tensor_len = c.checked_mul(h).and_then(|n| n.checked_mul(w));
        let layout = if tensor_len == Some(golden_len) {
            Layout::Tensor(Dim {
                channel: c,
                height: h,
                width: w,
            })
        } else {
            Layout::Flat(golden_len)
        };

        let need = comparator.target_len(layout);
        // Tiled dumps are padded past the format size, so use the mapping
        let have = av.memory.read().len();
        if have < need {
            let _ = writeln!(
                report,
                "  av {}: live buffer holds {} bytes, {} required",
                file.av_index, have, need
            );
            return Err(Error::InvalidArgument(format!(
                "address vector {} too small for golden {}",
                file.av_index,
                file.path.display()
            )));
        }

        backend.sync_for_cpu(&av.memory, DmaDirection::FromDevice);
        let target = av.memory.read();
        let mismatches = comparator.compare(&file.data, &target[..need], layout, report);
        let _ = writeln!(
            report,
            "  av {} ({}): {} of {} bytes mismatch",
            file.av_index,
            file.path.display(),
            mismatches,
            golden_len
        );
        total += mismatches;
    }

    if total > 0 {
        warn!("golden: frame {} mismatched {} bytes", frame.frame_id, total);
    } else {
        info!("golden: frame {} matched", frame.frame_id);
    }
    Ok(total)
}

fn load_file(path: &Path) -> Result<Vec<u8>> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(Error::InvalidArgument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(Error::InvalidArgument(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(fs::read(path)?)
}

/// `result-golden-match` reader
pub struct ResultReader<'a> {
    matcher: &'a GoldenMatcher,
    pos: usize,
}

impl io::Read for ResultReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let ctx = self.matcher.ctx.lock();
        let text = ctx.report.as_str().as_bytes();
        if self.pos >= text.len() {
            return Ok(0);
        }
        let n = buf.len().min(text.len() - self.pos);
        buf[..n].copy_from_slice(&text[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{shared, DmaBufHeap};
    use std::fmt::Write;
    use std::io::Read;

    fn matcher() -> GoldenMatcher {
        let m = GoldenMatcher::new(&GoldenConfig::default());
        m.init();
        m
    }

    #[test]
    fn test_open_before_init() {
        let m = GoldenMatcher::new(&GoldenConfig::default());
        assert!(matches!(m.open_desc(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_single_writer() {
        let m = matcher();
        m.open_desc().unwrap();
        assert!(matches!(m.open_desc(), Err(Error::Busy)));
    }

    #[test]
    fn test_disabled() {
        let m = GoldenMatcher::new(&GoldenConfig {
            enabled: false,
            ..Default::default()
        });
        m.init();
        assert!(m.open_desc().is_err());
    }

    #[test]
    fn test_parse_error_fails_write_and_close() {
        let m = matcher();
        m.open_desc().unwrap();
        assert!(m.write_desc(b"BOGUS 1\n").is_err());
        assert!(m.close_desc().is_err());
        assert_eq!(m.state(), MatchState::Opened);
        assert!(!m.is_loaded());
    }

    #[test]
    fn test_missing_file_fails_close() {
        let m = matcher();
        m.open_desc().unwrap();
        m.write_desc(b"0 /nonexistent/golden.bin\n").unwrap();
        assert!(matches!(m.close_desc(), Err(Error::Io(_))));
        assert_eq!(m.state(), MatchState::Opened);
    }

    #[test]
    fn test_unloaded_compare_is_noop() {
        let m = matcher();
        let heap = DmaBufHeap::new();
        let av = AvBuffer {
            index: 0,
            batch: 0,
            memory: shared(vec![0; 4]),
            size: 4,
            dims: (1, 1, 4),
        };
        let info = FrameInfo {
            frame_id: 0,
            net_id: 0,
        };
        assert_eq!(m.compare(&info, &[av], &heap).unwrap(), 0);
        assert_eq!(heap.stats().cpu_syncs, 0);
        assert_eq!(m.compared(), 0);
    }

    #[test]
    fn test_result_reader_position() {
        let m = matcher();
        m.ctx.lock().report.write_str("hello golden\n").unwrap();

        let mut reader = m.open_result();
        let mut head = [0u8; 5];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"hello");
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, " golden\n");

        let mut again = String::new();
        m.open_result().read_to_string(&mut again).unwrap();
        assert_eq!(again, "hello golden\n");
    }
}
