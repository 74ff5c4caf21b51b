//! Vision buffer queue
//!
//! One queue per direction per session. Every slot owns at most one
//! [`Bundle`], which cycles DEQUEUED -> QUEUED -> PROCESS -> DONE -> DEQUEUED.
//!
//! ```text
//!  qbuf ──► queued_list ──► process_list ──► done_list ──► dqbuf
//!              (owned by the driver until dqbuf)
//! ```
//!
//! A bundle stays on `queued_list` from qbuf until dqbuf; `process_list`
//! and `done_list` track the subset that is on the device or finished.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::buffer::{AvBuffer, Bundle, BundleFlags, BundleState, ContainerListDesc, Direction};
use crate::error::{Error, Result};
use crate::format::{Format, FormatList};
use crate::memory::MemoryBackend;

bitflags! {
    /// Queue setup state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueState: u32 {
        const FORMAT = 1 << 0;
        const START = 1 << 1;
    }
}

/// Snapshot of the list counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: usize,
    pub process: usize,
    pub done: usize,
}

struct QueueInner {
    state: QueueState,
    streaming: bool,
    formats: Vec<Format>,
    bundles: Vec<Option<Bundle>>,
    queued_list: VecDeque<u32>,
    process_list: VecDeque<u32>,
    done_list: VecDeque<u32>,
}

impl QueueInner {
    fn bundle(&self, index: u32) -> Result<&Bundle> {
        self.bundles
            .get(index as usize)
            .and_then(|b| b.as_ref())
            .ok_or_else(|| Error::NotFound(format!("bundle {}", index)))
    }

    fn bundle_mut(&mut self, index: u32) -> Result<&mut Bundle> {
        self.bundles
            .get_mut(index as usize)
            .and_then(|b| b.as_mut())
            .ok_or_else(|| Error::NotFound(format!("bundle {}", index)))
    }

    fn lists_empty(&self) -> bool {
        self.queued_list.is_empty() && self.process_list.is_empty() && self.done_list.is_empty()
    }
}

/// Per-direction bundle queue with blocking dequeue
pub struct BufferQueue {
    direction: Direction,
    max_buffer: usize,
    backend: Arc<dyn MemoryBackend>,
    inner: Mutex<QueueInner>,
    /// Woken when a bundle reaches the done list or the queue stops
    done_wq: Condvar,
    queued_count: AtomicUsize,
    process_count: AtomicUsize,
    done_count: AtomicUsize,
    /// Mapped buffers across all bundles
    live_buffers: AtomicUsize,
}

impl BufferQueue {
    pub fn new(direction: Direction, max_buffer: usize, backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            direction,
            max_buffer,
            backend,
            inner: Mutex::new(QueueInner {
                state: QueueState::empty(),
                streaming: false,
                formats: Vec::new(),
                bundles: (0..max_buffer).map(|_| None).collect(),
                queued_list: VecDeque::with_capacity(max_buffer),
                process_list: VecDeque::with_capacity(max_buffer),
                done_list: VecDeque::with_capacity(max_buffer),
            }),
            done_wq: Condvar::new(),
            queued_count: AtomicUsize::new(0),
            process_count: AtomicUsize::new(0),
            done_count: AtomicUsize::new(0),
            live_buffers: AtomicUsize::new(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Reset lists, counters and setup state
    pub fn init(&self) {
        let mut inner = self.inner.lock();
        self.free_bundles(&mut inner);
        inner.queued_list.clear();
        inner.process_list.clear();
        inner.done_list.clear();
        inner.formats.clear();
        inner.state = QueueState::empty();
        inner.streaming = false;
        self.sync_counts(&inner);
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    /// Set the per-target formats; only allowed before streaming
    pub fn s_format(&self, list: &FormatList) -> Result<()> {
        if list.direction != self.direction {
            return Err(Error::InvalidArgument(format!(
                "format list direction {} on {} queue",
                list.direction.name(),
                self.direction.name()
            )));
        }
        if list.formats.is_empty() {
            return Err(Error::InvalidArgument("empty format list".into()));
        }
        if list.formats.len() > self.max_buffer {
            return Err(Error::ResourceExhausted {
                what: "formats",
                limit: self.max_buffer,
            });
        }

        let mut inner = self.inner.lock();
        if inner.state.contains(QueueState::START) {
            return Err(Error::InvalidState("s_format while streaming"));
        }

        let mut formats: Vec<Format> = Vec::with_capacity(list.formats.len());
        for req in &list.formats {
            if formats.iter().any(|f| f.target == req.target) {
                return Err(Error::InvalidArgument(format!(
                    "target {} formatted twice",
                    req.target
                )));
            }
            let format = Format::resolve(req)?;
            debug!(
                "npu: {} target {} format {} {}x{}x{} ({} bytes)",
                self.direction.name(),
                format.target,
                format.desc.name,
                format.channels,
                format.height,
                format.width,
                format.total_size()
            );
            formats.push(format);
        }

        // Bundles built against the old formats are stale
        self.free_bundles(&mut inner);
        inner.formats = formats;
        inner.state.insert(QueueState::FORMAT);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.state.contains(QueueState::FORMAT) {
            return Err(Error::InvalidState("start without format"));
        }
        if inner.state.contains(QueueState::START) {
            return Err(Error::InvalidState("queue already started"));
        }
        inner.streaming = true;
        inner.state.insert(QueueState::START);
        Ok(())
    }

    /// Queue a bundle, creating it on the first request for its slot
    pub fn qbuf(&self, desc: &ContainerListDesc) -> Result<()> {
        self.check_request(desc)?;

        let mut inner = self.inner.lock();
        if !inner.state.contains(QueueState::START) {
            return Err(Error::InvalidState("qbuf on stopped queue"));
        }

        let slot = desc.index as usize;
        let (mut bundle, existed) = match inner.bundles[slot].take() {
            Some(bundle) => (bundle, true),
            None => (Bundle::from_desc(desc, &inner.formats)?, false),
        };

        if let Err(e) = self.refresh(&mut bundle, desc) {
            // A slot is only populated once its first request went through
            if existed {
                inner.bundles[slot] = Some(bundle);
            }
            return Err(e);
        }

        bundle.sync_for_device(self.backend.as_ref());
        if bundle.clist.flags.contains(BundleFlags::TIMESTAMP) {
            bundle.clist.timestamps.queued = Some(Instant::now());
        }
        bundle.state = BundleState::Queued;
        inner.bundles[slot] = Some(bundle);
        inner.queued_list.push_back(desc.index);
        self.queued_count.fetch_add(1, Ordering::AcqRel);

        trace!(
            "npu: {} qbuf index {} id {}",
            self.direction.name(),
            desc.index,
            desc.id
        );
        Ok(())
    }

    /// Map a bundle's memory ahead of its first qbuf
    pub fn prepare(&self, desc: &ContainerListDesc) -> Result<()> {
        self.check_request(desc)?;

        let mut inner = self.inner.lock();
        if !inner.state.contains(QueueState::FORMAT) {
            return Err(Error::InvalidState("prepare without format"));
        }

        let slot = desc.index as usize;
        let (mut bundle, existed) = match inner.bundles[slot].take() {
            Some(bundle) => (bundle, true),
            None => (Bundle::from_desc(desc, &inner.formats)?, false),
        };

        let result = self.refresh(&mut bundle, desc);
        if result.is_ok() || existed {
            inner.bundles[slot] = Some(bundle);
        }
        result
    }

    /// Release the mapping of a dequeued bundle
    pub fn unprepare(&self, desc: &ContainerListDesc) -> Result<()> {
        self.check_request(desc)?;

        let mut inner = self.inner.lock();
        let bundle = inner.bundle_mut(desc.index)?;
        if bundle.state != BundleState::Dequeued {
            return Err(Error::AlreadyQueued(desc.index));
        }
        bundle.unprepare(self.backend.as_ref(), &self.live_buffers);
        Ok(())
    }

    /// Dequeue the oldest finished bundle into `desc`
    pub fn dqbuf(&self, desc: &mut ContainerListDesc, nonblocking: bool) -> Result<()> {
        if desc.direction != self.direction {
            return Err(Error::InvalidArgument(format!(
                "dqbuf direction {} on {} queue",
                desc.direction.name(),
                self.direction.name()
            )));
        }

        let mut inner = self.inner.lock();
        loop {
            if !inner.streaming {
                return Err(Error::InvalidState("dqbuf on stopped queue"));
            }
            if !inner.done_list.is_empty() {
                break;
            }
            if nonblocking {
                return Err(Error::WouldBlock);
            }
            self.done_wq.wait(&mut inner);
        }

        let index = match inner.done_list.pop_front() {
            Some(index) => index,
            None => return Err(Error::WouldBlock),
        };
        self.done_count.fetch_sub(1, Ordering::AcqRel);

        if let Some(pos) = inner.queued_list.iter().position(|&i| i == index) {
            inner.queued_list.remove(pos);
            self.queued_count.fetch_sub(1, Ordering::AcqRel);
        } else {
            error!("npu: bundle {} done but not on queued list", index);
        }

        let bundle = inner.bundle_mut(index)?;
        bundle.state = BundleState::Dequeued;
        if bundle.clist.flags.contains(BundleFlags::TIMESTAMP) {
            bundle.clist.timestamps.dequeued = Some(Instant::now());
        }

        desc.index = index;
        desc.id = bundle.clist.id;
        desc.flags = bundle.clist.flags;
        desc.timestamps = bundle.clist.timestamps;

        trace!(
            "npu: {} dqbuf index {} id {} flags {:?}",
            self.direction.name(),
            index,
            desc.id,
            desc.flags
        );
        Ok(())
    }

    /// Oldest bundle on the queued list that has not been dispatched yet
    pub fn front_queued(&self) -> Option<u32> {
        let inner = self.inner.lock();
        inner.queued_list.iter().copied().find(|&i| {
            inner
                .bundle(i)
                .map(|b| b.state == BundleState::Queued)
                .unwrap_or(false)
        })
    }

    /// QUEUED -> PROCESS
    pub fn process(&self, index: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let bundle = inner.bundle_mut(index)?;
        if bundle.state != BundleState::Queued {
            return Err(Error::InvalidState("process of a bundle that is not queued"));
        }
        bundle.state = BundleState::Process;
        if bundle.clist.flags.contains(BundleFlags::TIMESTAMP) {
            bundle.clist.timestamps.process = Some(Instant::now());
        }
        inner.process_list.push_back(index);
        self.process_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// PROCESS -> DONE; wakes one waiter
    pub fn done(&self, index: u32, invalid: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        {
            let bundle = inner.bundle(index)?;
            if bundle.state != BundleState::Process {
                return Err(Error::InvalidState("done of a bundle that is not processing"));
            }
        }

        if let Some(pos) = inner.process_list.iter().position(|&i| i == index) {
            inner.process_list.remove(pos);
            self.process_count.fetch_sub(1, Ordering::AcqRel);
        }

        let bundle = inner.bundle_mut(index)?;
        bundle.sync_for_cpu(self.backend.as_ref());
        bundle.state = BundleState::Done;
        bundle.clist.flags.insert(BundleFlags::DONE);
        if invalid {
            bundle.clist.flags.insert(BundleFlags::INVALID);
        }
        if bundle.clist.flags.contains(BundleFlags::TIMESTAMP) {
            bundle.clist.timestamps.done = Some(Instant::now());
        }

        inner.done_list.push_back(index);
        self.done_count.fetch_add(1, Ordering::AcqRel);
        self.done_wq.notify_one();
        Ok(())
    }

    /// Live buffers of a bundle, as the engine addresses them
    pub fn address_vectors(&self, index: u32) -> Result<Vec<AvBuffer>> {
        Ok(self.inner.lock().bundle(index)?.address_vectors())
    }

    /// Frame id recorded on a bundle
    pub fn bundle_id(&self, index: u32) -> Result<u32> {
        Ok(self.inner.lock().bundle(index)?.clist.id)
    }

    pub fn bundle_state(&self, index: u32) -> Option<BundleState> {
        self.inner.lock().bundle(index).ok().map(|b| b.state)
    }

    /// Stop streaming and release every bundle
    ///
    /// A non-forced stop refuses while any bundle is still owned by the
    /// driver. A forced stop discards in-flight work.
    pub fn stop(&self, forced: bool) -> Result<()> {
        let mut inner = self.inner.lock();

        if !forced && !inner.lists_empty() {
            warn!(
                "npu: {} queue busy (queued {}, process {}, done {})",
                self.direction.name(),
                inner.queued_list.len(),
                inner.process_list.len(),
                inner.done_list.len()
            );
            return Err(Error::Busy);
        }

        inner.streaming = false;
        inner.state.remove(QueueState::START);
        inner.queued_list.clear();
        inner.process_list.clear();
        inner.done_list.clear();
        self.sync_counts(&inner);
        self.free_bundles(&mut inner);
        self.done_wq.notify_all();

        let live = self.live_buffers.load(Ordering::Acquire);
        if live != 0 {
            if forced {
                warn!(
                    "npu: {} queue forced stop left {} buffers mapped",
                    self.direction.name(),
                    live
                );
            } else {
                panic!(
                    "npu: {} queue leaked {} mapped buffers",
                    self.direction.name(),
                    live
                );
            }
        }
        Ok(())
    }

    /// True when a dequeue would not block
    pub fn poll(&self) -> bool {
        !self.inner.lock().done_list.is_empty()
    }

    /// No bundle is owned by the driver
    pub fn is_idle(&self) -> bool {
        self.inner.lock().lists_empty()
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            queued: self.queued_count.load(Ordering::Acquire),
            process: self.process_count.load(Ordering::Acquire),
            done: self.done_count.load(Ordering::Acquire),
        }
    }

    /// Actual list lengths, for checking against the counters
    pub fn list_lengths(&self) -> QueueCounts {
        let inner = self.inner.lock();
        QueueCounts {
            queued: inner.queued_list.len(),
            process: inner.process_list.len(),
            done: inner.done_list.len(),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Acquire)
    }

    fn check_request(&self, desc: &ContainerListDesc) -> Result<()> {
        if desc.direction != self.direction {
            return Err(Error::InvalidArgument(format!(
                "request direction {} on {} queue",
                desc.direction.name(),
                self.direction.name()
            )));
        }
        if desc.index as usize >= self.max_buffer {
            return Err(Error::ResourceExhausted {
                what: "bundle index",
                limit: self.max_buffer,
            });
        }
        Ok(())
    }

    /// Validate a request against an existing or new bundle and map it
    fn refresh(&self, bundle: &mut Bundle, desc: &ContainerListDesc) -> Result<()> {
        if bundle.state != BundleState::Dequeued {
            return Err(Error::AlreadyQueued(desc.index));
        }
        bundle.check_shape(desc)?;
        bundle.update(desc);
        bundle.prepare(self.backend.as_ref(), &self.live_buffers)
    }

    fn free_bundles(&self, inner: &mut QueueInner) {
        for slot in inner.bundles.iter_mut() {
            if let Some(mut bundle) = slot.take() {
                bundle.unprepare(self.backend.as_ref(), &self.live_buffers);
            }
        }
    }

    fn sync_counts(&self, inner: &QueueInner) {
        self.queued_count
            .store(inner.queued_list.len(), Ordering::Release);
        self.process_count
            .store(inner.process_list.len(), Ordering::Release);
        self.done_count.store(inner.done_list.len(), Ordering::Release);
    }
}
