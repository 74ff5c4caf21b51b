//! Compute engine interface
//!
//! The session dispatches matched input/output bundles as [`Frame`]s to a
//! [`ComputeEngine`]. The engine reports back through [`Frame::complete`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::buffer::AvBuffer;
use crate::error::{Error, Result};
use crate::graph::{Control, ParamList};
use crate::session::Session;

/// Firmware result code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const NO_ERROR: ResultCode = ResultCode(0);

    pub fn is_ok(&self) -> bool {
        *self == Self::NO_ERROR
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::Device(self.0))
        }
    }
}

/// A matched input/output pair on its way through the device
#[derive(Debug)]
pub struct Frame {
    pub uid: u32,
    pub frame_id: u32,
    pub input_index: u32,
    pub output_index: u32,
    pub inputs: Vec<AvBuffer>,
    pub outputs: Vec<AvBuffer>,
    pub(crate) session: Weak<Session>,
}

impl Frame {
    /// Report the frame result to its session
    pub fn complete(self, result: ResultCode) {
        match self.session.upgrade() {
            Some(session) => session.frame_done(&self, result),
            None => warn!(
                "npu: frame {} of closed session {} dropped",
                self.frame_id, self.uid
            ),
        }
    }
}

/// Device-side collaborator of the session layer
pub trait ComputeEngine: Send + Sync {
    /// Device-level power up, done by the first streaming session
    fn power_on(&self) -> Result<()>;

    /// Device-level power down, done by the last streaming session
    fn power_off(&self);

    fn stream_on(&self, uid: u32) -> ResultCode;

    /// Stop a session's stream; returns once its frames have completed
    fn stream_off(&self, uid: u32) -> ResultCode;

    fn submit(&self, frame: Frame) -> Result<()>;

    fn update_param(&self, uid: u32, params: &ParamList) -> Result<()>;

    fn control(&self, uid: u32, ctrl: Control) -> Result<()>;

    /// Device hit an unrecoverable error
    fn is_emergency(&self) -> bool;
}

/// Loopback engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub completed: u64,
    pub power_cycles: u64,
}

struct LoopbackState {
    frames: VecDeque<Frame>,
    in_flight: usize,
    shutdown: bool,
}

struct LoopbackShared {
    state: Mutex<LoopbackState>,
    /// Frame queued or shutdown requested
    work: Condvar,
    /// Worker finished a frame
    idle: Condvar,
    frame_result: AtomicU32,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl LoopbackShared {
    fn execute(&self, frame: Frame) {
        for (out, inp) in frame.outputs.iter().zip(frame.inputs.iter()) {
            if Arc::ptr_eq(&out.memory, &inp.memory) {
                continue;
            }
            let src = inp.memory.read();
            let mut dst = out.memory.write();
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }

        let result = ResultCode(self.frame_result.load(Ordering::Relaxed));
        self.completed.fetch_add(1, Ordering::Relaxed);
        frame.complete(result);
    }
}

/// Software engine that copies each input vector into the output vector
/// of the same ordinal
///
/// Built with [`LoopbackEngine::new`] a worker thread completes frames as
/// they arrive; [`LoopbackEngine::manual`] parks them until
/// [`LoopbackEngine::run_pending`] or a stream-off.
pub struct LoopbackEngine {
    shared: Arc<LoopbackShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    powered: AtomicBool,
    emergency: AtomicBool,
    stream_on_result: AtomicU32,
    power_cycles: AtomicU64,
    params: Mutex<Vec<(u32, ParamList)>>,
    controls: Mutex<Vec<(u32, Control)>>,
}

impl LoopbackEngine {
    pub fn new() -> Arc<Self> {
        let engine = Arc::new(Self::build());
        let shared = engine.shared.clone();
        let handle = thread::Builder::new()
            .name("npu-loopback".to_string())
            .spawn(move || worker(shared));
        match handle {
            Ok(handle) => *engine.worker.lock() = Some(handle),
            Err(e) => warn!("npu: loopback worker unavailable ({}), running manual", e),
        }
        engine
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self::build())
    }

    fn build() -> Self {
        Self {
            shared: Arc::new(LoopbackShared {
                state: Mutex::new(LoopbackState {
                    frames: VecDeque::new(),
                    in_flight: 0,
                    shutdown: false,
                }),
                work: Condvar::new(),
                idle: Condvar::new(),
                frame_result: AtomicU32::new(0),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            powered: AtomicBool::new(false),
            emergency: AtomicBool::new(false),
            stream_on_result: AtomicU32::new(0),
            power_cycles: AtomicU64::new(0),
            params: Mutex::new(Vec::new()),
            controls: Mutex::new(Vec::new()),
        }
    }

    /// Complete every parked frame on the calling thread
    pub fn run_pending(&self) -> usize {
        let frames: Vec<Frame> = self.shared.state.lock().frames.drain(..).collect();
        let count = frames.len();
        for frame in frames {
            self.shared.execute(frame);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    /// Result code returned by the next stream-on commands
    pub fn set_stream_on_result(&self, code: ResultCode) {
        self.stream_on_result.store(code.0, Ordering::Relaxed);
    }

    /// Result code reported for completed frames
    pub fn set_frame_result(&self, code: ResultCode) {
        self.shared.frame_result.store(code.0, Ordering::Relaxed);
    }

    pub fn set_emergency(&self, emergency: bool) {
        self.emergency.store(emergency, Ordering::Relaxed);
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Relaxed)
    }

    pub fn params(&self) -> Vec<(u32, ParamList)> {
        self.params.lock().clone()
    }

    pub fn controls(&self) -> Vec<(u32, Control)> {
        self.controls.lock().clone()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            power_cycles: self.power_cycles.load(Ordering::Relaxed),
        }
    }
}

impl ComputeEngine for LoopbackEngine {
    fn power_on(&self) -> Result<()> {
        if self.powered.swap(true, Ordering::AcqRel) {
            warn!("npu: loopback already powered");
        }
        self.power_cycles.fetch_add(1, Ordering::Relaxed);
        info!("npu: loopback engine powered on");
        Ok(())
    }

    fn power_off(&self) {
        self.powered.store(false, Ordering::Release);
        info!("npu: loopback engine powered off");
    }

    fn stream_on(&self, uid: u32) -> ResultCode {
        debug!("npu: loopback stream on {}", uid);
        ResultCode(self.stream_on_result.load(Ordering::Relaxed))
    }

    fn stream_off(&self, uid: u32) -> ResultCode {
        // Flush the session's parked frames, then wait for the worker
        let mine: Vec<Frame> = {
            let mut state = self.shared.state.lock();
            let (mine, rest): (VecDeque<Frame>, VecDeque<Frame>) =
                state.frames.drain(..).partition(|f| f.uid == uid);
            state.frames = rest;
            mine.into_iter().collect()
        };
        for frame in mine {
            self.shared.execute(frame);
        }

        let mut state = self.shared.state.lock();
        while state.in_flight > 0 {
            self.shared.idle.wait(&mut state);
        }
        debug!("npu: loopback stream off {}", uid);
        ResultCode::NO_ERROR
    }

    fn submit(&self, frame: Frame) -> Result<()> {
        if !self.is_powered() {
            return Err(Error::InvalidState("engine powered off"));
        }
        let mut state = self.shared.state.lock();
        state.frames.push_back(frame);
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.work.notify_one();
        Ok(())
    }

    fn update_param(&self, uid: u32, params: &ParamList) -> Result<()> {
        self.params.lock().push((uid, params.clone()));
        Ok(())
    }

    fn control(&self, uid: u32, ctrl: Control) -> Result<()> {
        self.controls.lock().push((uid, ctrl));
        Ok(())
    }

    fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::Relaxed)
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker(shared: Arc<LoopbackShared>) {
    loop {
        let frame = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(frame) = state.frames.pop_front() {
                    state.in_flight += 1;
                    break frame;
                }
                shared.work.wait(&mut state);
            }
        };

        shared.execute(frame);

        let mut state = shared.state.lock();
        state.in_flight -= 1;
        shared.idle.notify_all();
    }
}
