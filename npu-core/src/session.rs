//! NPU session
//!
//! A session owns one input and one output [`BufferQueue`] and walks a
//! state bitmask from OPEN to CLOSE. Every operation checks the bits it
//! depends on and fails with `InvalidState` without touching them.
//!
//! ```text
//!  OPEN ─► REGISTER ─► GRAPH ─► FORMAT_IN ┐
//!                              FORMAT_OT ┴─► START ◄─► STOP ─► CLOSE
//! ```
//!
//! Frames are only dispatched once both queues hold a QUEUED bundle; the
//! pair travels to the engine together and comes back through
//! [`Session::frame_done`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use bitflags::bitflags;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::buffer::{ContainerListDesc, Direction};
use crate::device::NpuDevice;
use crate::engine::{Frame, ResultCode};
use crate::error::{Error, Result};
use crate::format::FormatList;
use crate::golden::FrameInfo;
use crate::graph::{Control, GraphDesc, Param, ParamList};
use crate::queue::BufferQueue;

bitflags! {
    /// Session lifecycle bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionState: u32 {
        const OPEN = 1 << 0;
        const REGISTER = 1 << 1;
        const GRAPH = 1 << 2;
        /// Feature-map tables allocated for the graph
        const IOFM_ALLOC = 1 << 3;
        const FORMAT_IN = 1 << 4;
        const FORMAT_OT = 1 << 5;
        const START = 1 << 6;
        const STOP = 1 << 7;
        const CLOSE = 1 << 8;
    }
}

bitflags! {
    /// poll() readiness
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u32 {
        /// Input done list non-empty
        const IN = 1 << 0;
        /// Output done list non-empty
        const OUT = 1 << 1;
        /// Session is not streaming
        const ERR = 1 << 2;
    }
}

const UNREGISTERED: u32 = u32::MAX;

fn format_bit(direction: Direction) -> SessionState {
    match direction {
        Direction::Input => SessionState::FORMAT_IN,
        Direction::Output => SessionState::FORMAT_OT,
    }
}

fn require(state: SessionState, bits: SessionState, what: &'static str) -> Result<()> {
    if state.contains(SessionState::CLOSE) {
        return Err(Error::InvalidState("session closed"));
    }
    if !state.contains(bits) {
        debug!("npu: {} (state {:?})", what, state);
        return Err(Error::InvalidState(what));
    }
    Ok(())
}

struct SessionInner {
    state: SessionState,
    graph: Option<GraphDesc>,
    params: Vec<Param>,
    controls: Vec<Control>,
}

impl SessionInner {
    fn graph(&self) -> Result<&GraphDesc> {
        self.graph
            .as_ref()
            .ok_or(Error::InvalidState("no graph set"))
    }
}

pub struct Session {
    me: Weak<Session>,
    device: Arc<NpuDevice>,
    uid: AtomicU32,
    /// Held for the whole of every control operation
    inner: Mutex<SessionInner>,
    inq: BufferQueue,
    otq: BufferQueue,
}

impl Session {
    /// Create a session and register it with the device
    pub fn open(device: &Arc<NpuDevice>) -> Result<Arc<Self>> {
        let max_buffer = device.config().max_buffer;
        let session = Arc::new_cyclic(|me| Session {
            me: me.clone(),
            device: device.clone(),
            uid: AtomicU32::new(UNREGISTERED),
            inner: Mutex::new(SessionInner {
                state: SessionState::OPEN,
                graph: None,
                params: Vec::new(),
                controls: Vec::new(),
            }),
            inq: BufferQueue::new(Direction::Input, max_buffer, device.memory().clone()),
            otq: BufferQueue::new(Direction::Output, max_buffer, device.memory().clone()),
        });
        session.inq.init();
        session.otq.init();

        let uid = device.sessions().reg_id(Arc::downgrade(&session))?;
        session.uid.store(uid, Ordering::Release);
        session.inner.lock().state.insert(SessionState::REGISTER);

        info!("npu: session {} opened", uid);
        Ok(session)
    }

    pub fn uid(&self) -> u32 {
        self.uid.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn graph(&self) -> Option<GraphDesc> {
        self.inner.lock().graph.clone()
    }

    pub fn params(&self) -> Vec<Param> {
        self.inner.lock().params.clone()
    }

    pub fn controls(&self) -> Vec<Control> {
        self.inner.lock().controls.clone()
    }

    pub fn queue(&self, direction: Direction) -> &BufferQueue {
        match direction {
            Direction::Input => &self.inq,
            Direction::Output => &self.otq,
        }
    }

    pub fn s_graph(&self, graph: GraphDesc) -> Result<()> {
        let mut inner = self.inner.lock();
        require(inner.state, SessionState::OPEN, "s_graph on unopened session")?;
        if inner.state.contains(SessionState::START) {
            return Err(Error::InvalidState("s_graph while streaming"));
        }

        inner.state.insert(SessionState::GRAPH);
        if let Err(e) = graph.validate() {
            inner.state.remove(SessionState::GRAPH);
            return Err(e);
        }

        // Formats were checked against the previous graph
        if inner.graph.is_some() {
            self.inq.init();
            self.otq.init();
            inner
                .state
                .remove(SessionState::FORMAT_IN | SessionState::FORMAT_OT);
        }

        info!(
            "npu: session {} graph {} ({} address vectors)",
            self.uid(),
            graph.id,
            graph.address_vectors.len()
        );
        inner.graph = Some(graph);
        inner.params.clear();
        inner.state.insert(SessionState::IOFM_ALLOC);
        Ok(())
    }

    pub fn s_format(&self, list: &FormatList) -> Result<()> {
        let mut inner = self.inner.lock();
        require(inner.state, SessionState::GRAPH, "s_format before s_graph")?;
        if inner.state.contains(SessionState::START) {
            return Err(Error::InvalidState("s_format while streaming"));
        }

        let graph = inner.graph()?;
        for req in &list.formats {
            graph.check_target(req.target, list.direction)?;
        }

        self.queue(list.direction).s_format(list)?;
        inner.state.insert(format_bit(list.direction));
        Ok(())
    }

    pub fn s_param(&self, params: ParamList) -> Result<()> {
        let mut inner = self.inner.lock();
        require(inner.state, SessionState::GRAPH, "s_param before s_graph")?;

        let graph = inner.graph()?;
        for p in &params.params {
            if graph.find(p.target).is_none() {
                return Err(Error::InvalidArgument(format!(
                    "param target {} is not in the graph",
                    p.target
                )));
            }
        }

        self.device.engine().update_param(self.uid(), &params)?;

        for p in params.params {
            inner
                .params
                .retain(|old| !(old.target == p.target && old.offset == p.offset));
            inner.params.push(p);
        }
        Ok(())
    }

    pub fn s_ctrl(&self, ctrl: Control) -> Result<()> {
        let mut inner = self.inner.lock();
        require(inner.state, SessionState::OPEN, "s_ctrl on unopened session")?;
        self.device.engine().control(self.uid(), ctrl)?;
        inner.controls.push(ctrl);
        Ok(())
    }

    pub fn streamon(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        require(
            inner.state,
            SessionState::GRAPH | SessionState::FORMAT_IN | SessionState::FORMAT_OT,
            "streamon before graph and formats",
        )?;
        if inner.state.contains(SessionState::START) {
            return Err(Error::InvalidState("session already streaming"));
        }

        let uid = self.uid();
        self.device.acquire_start()?;

        if let Err(e) = self.inq.start() {
            self.device.release_start();
            return Err(e);
        }
        if let Err(e) = self.otq.start() {
            self.stop_queues();
            self.device.release_start();
            return Err(e);
        }

        let code = self.device.engine().stream_on(uid);
        if !code.is_ok() {
            error!("npu: session {} streamon failed (code {})", uid, code.0);
            self.stop_queues();
            self.device.release_start();
            return Err(Error::Device(code.0));
        }

        inner.state.insert(SessionState::START);
        inner.state.remove(SessionState::STOP);
        info!("npu: session {} streaming", uid);
        Ok(())
    }

    /// Stop streaming; every bundle must have been dequeued
    pub fn streamoff(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        require(inner.state, SessionState::START, "streamoff while not streaming")?;

        if !self.inq.is_idle() || !self.otq.is_idle() {
            warn!("npu: session {} streamoff with bundles in flight", self.uid());
            return Err(Error::Busy);
        }

        let uid = self.uid();
        self.device.engine().stream_off(uid).into_result()?;
        self.inq.stop(false)?;
        self.otq.stop(false)?;
        self.device.release_start();

        inner.state.remove(SessionState::START);
        inner.state.insert(SessionState::STOP);
        info!("npu: session {} stopped", uid);
        Ok(())
    }

    pub fn qbuf(&self, desc: &ContainerListDesc) -> Result<()> {
        let inner = self.inner.lock();
        require(inner.state, SessionState::START, "qbuf while not streaming")?;

        let graph = inner.graph()?;
        for c in &desc.containers {
            graph.check_target(c.target, desc.direction)?;
        }

        self.queue(desc.direction).qbuf(desc)?;
        self.dispatch();
        Ok(())
    }

    /// Dequeue a finished bundle
    ///
    /// The wait happens on the queue's own lock, so completions and
    /// streamoff are not held up by a blocked caller.
    pub fn dqbuf(&self, desc: &mut ContainerListDesc, nonblocking: bool) -> Result<()> {
        {
            let inner = self.inner.lock();
            require(inner.state, SessionState::START, "dqbuf while not streaming")?;
        }
        self.queue(desc.direction).dqbuf(desc, nonblocking)
    }

    pub fn prepare(&self, desc: &ContainerListDesc) -> Result<()> {
        let inner = self.inner.lock();
        require(
            inner.state,
            format_bit(desc.direction),
            "prepare before s_format",
        )?;

        let graph = inner.graph()?;
        for c in &desc.containers {
            graph.check_target(c.target, desc.direction)?;
        }
        self.queue(desc.direction).prepare(desc)
    }

    pub fn unprepare(&self, desc: &ContainerListDesc) -> Result<()> {
        let inner = self.inner.lock();
        require(
            inner.state,
            format_bit(desc.direction),
            "unprepare before s_format",
        )?;
        self.queue(desc.direction).unprepare(desc)
    }

    pub fn poll(&self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if !self.inner.lock().state.contains(SessionState::START) {
            flags.insert(PollFlags::ERR);
        }
        if self.inq.poll() {
            flags.insert(PollFlags::IN);
        }
        if self.otq.poll() {
            flags.insert(PollFlags::OUT);
        }
        flags
    }

    /// Completion path of a dispatched frame; never takes the session lock
    pub fn frame_done(&self, frame: &Frame, result: ResultCode) {
        let invalid = !result.is_ok();
        if invalid {
            warn!(
                "npu: session {} frame {} failed (code {})",
                frame.uid, frame.frame_id, result.0
            );
        } else {
            let info = FrameInfo {
                frame_id: frame.frame_id,
                net_id: frame.uid,
            };
            let golden = self.device.golden();
            match golden.compare(&info, &frame.outputs, self.device.memory().as_ref()) {
                Ok(0) => {}
                Ok(n) => warn!(
                    "npu: session {} frame {} differs from golden in {} bytes",
                    frame.uid, frame.frame_id, n
                ),
                Err(e) => warn!(
                    "npu: session {} frame {} golden compare failed: {}",
                    frame.uid, frame.frame_id, e
                ),
            }
        }

        if let Err(e) = self.inq.done(frame.input_index, invalid) {
            error!("npu: session {} input done: {}", frame.uid, e);
        }
        if let Err(e) = self.otq.done(frame.output_index, invalid) {
            error!("npu: session {} output done: {}", frame.uid, e);
        }
        trace!("npu: session {} frame {} done", frame.uid, frame.frame_id);
    }

    /// Tear the session down, stopping the stream if still running
    pub fn close(&self) -> Result<()> {
        self.teardown(true)
    }

    /// Close path shared with drop
    ///
    /// A session can be dropped from inside its own frame completion, on
    /// the engine's thread. Waiting for the engine to go idle there would
    /// wait on the frame being completed, so drop only tears down the
    /// queues and the registry slot.
    fn teardown(&self, wait_engine: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state.contains(SessionState::CLOSE) {
            return Err(Error::InvalidState("session already closed"));
        }

        if inner.state.contains(SessionState::START) {
            self.streamoff_forced(&mut inner, wait_engine);
        }
        self.inq.init();
        self.otq.init();

        let uid = self.uid();
        if inner.state.contains(SessionState::REGISTER) {
            if let Err(e) = self.device.sessions().unreg_id(uid) {
                warn!("npu: session {} unregister: {}", uid, e);
            }
        }
        inner.state.insert(SessionState::CLOSE);
        info!("npu: session {} closed", uid);
        Ok(())
    }

    /// Best-effort streamoff used on close; always completes
    fn streamoff_forced(&self, inner: &mut SessionInner, wait_engine: bool) {
        let uid = self.uid();
        let engine = self.device.engine();

        if !wait_engine {
            debug!("npu: session {} dropped while streaming", uid);
        } else if engine.is_emergency() {
            let delay = self.device.config().streamoff_delay();
            warn!(
                "npu: session {} emergency streamoff, waiting {:?}",
                uid, delay
            );
            thread::sleep(delay);
        } else {
            let code = engine.stream_off(uid);
            if !code.is_ok() {
                warn!("npu: session {} forced streamoff code {}", uid, code.0);
            }
        }

        self.stop_queues();
        self.device.release_start();
        inner.state.remove(SessionState::START);
        inner.state.insert(SessionState::STOP);
    }

    fn stop_queues(&self) {
        for queue in [&self.inq, &self.otq] {
            if let Err(e) = queue.stop(true) {
                warn!(
                    "npu: session {} {} queue stop: {}",
                    self.uid(),
                    queue.direction().name(),
                    e
                );
            }
        }
    }

    /// Hand every matched input/output pair to the engine
    fn dispatch(&self) {
        while let (Some(input), Some(output)) = (self.inq.front_queued(), self.otq.front_queued())
        {
            let result = self
                .build_frame(input, output)
                .and_then(|frame| self.device.engine().submit(frame));

            if let Err(e) = result {
                error!(
                    "npu: session {} dispatch ({}, {}) failed: {}",
                    self.uid(),
                    input,
                    output,
                    e
                );
                if let Err(e) = self.inq.done(input, true) {
                    error!("npu: session {} input {} done: {}", self.uid(), input, e);
                }
                if let Err(e) = self.otq.done(output, true) {
                    error!("npu: session {} output {} done: {}", self.uid(), output, e);
                }
                break;
            }
        }
    }

    fn build_frame(&self, input: u32, output: u32) -> Result<Frame> {
        self.inq.process(input)?;
        self.otq.process(output)?;

        let frame = Frame {
            uid: self.uid(),
            frame_id: self.inq.bundle_id(input)?,
            input_index: input,
            output_index: output,
            inputs: self.inq.address_vectors(input)?,
            outputs: self.otq.address_vectors(output)?,
            session: self.me.clone(),
        };
        trace!(
            "npu: session {} dispatch frame {} ({}, {})",
            frame.uid,
            frame.frame_id,
            input,
            output
        );
        Ok(frame)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.inner.get_mut().state.contains(SessionState::CLOSE) {
            let _ = self.teardown(false);
        }
    }
}
