//! Bundles, containers and buffers
//!
//! A [`ContainerListDesc`] is what the client hands to QBUF/DQBUF. The queue
//! turns the first request for a slot into a [`Bundle`] and reuses it for
//! every later cycle of that slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::format::Format;
use crate::memory::{shared, DmaDirection, MemoryBackend, SharedMemory};
use crate::{MAX_ADDR_VECTOR, MAX_BUFFER};

/// Queue direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// DMA direction used for cache maintenance
    pub fn dma(&self) -> DmaDirection {
        match self {
            Direction::Input => DmaDirection::ToDevice,
            Direction::Output => DmaDirection::FromDevice,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

/// Container layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    List,
    Roi,
    Pyramid,
}

/// Memory type of every buffer in a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    UserPtr,
    DmaBuf,
}

/// Region of interest inside a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Client memory reference
#[derive(Debug, Clone)]
pub enum BufferHandle {
    /// Exported DMA-buf file descriptor
    Fd(i32),
    /// Client-owned memory, copied through a scratch allocation
    UserPtr(SharedMemory),
}

impl BufferHandle {
    pub fn memory_type(&self) -> MemoryType {
        match self {
            BufferHandle::Fd(_) => MemoryType::DmaBuf,
            BufferHandle::UserPtr(_) => MemoryType::UserPtr,
        }
    }

    fn same_as(&self, other: &BufferHandle) -> bool {
        match (self, other) {
            (BufferHandle::Fd(a), BufferHandle::Fd(b)) => a == b,
            (BufferHandle::UserPtr(a), BufferHandle::UserPtr(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// One buffer of a container request
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub roi: Roi,
    pub handle: BufferHandle,
}

/// One container of a request
#[derive(Debug, Clone)]
pub struct ContainerDesc {
    pub kind: ContainerKind,
    /// Address-vector index this container feeds
    pub target: u32,
    pub memory: MemoryType,
    pub buffers: Vec<BufferDesc>,
}

bitflags! {
    /// Client-visible bundle flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BundleFlags: u32 {
        /// Record per-stage timestamps
        const TIMESTAMP = 1 << 0;
        /// Backing memory is mapped
        const PREPARED = 1 << 1;
        /// Frame failed; contents are undefined
        const INVALID = 1 << 2;
        /// Bundle reached the done list
        const DONE = 1 << 3;
    }
}

/// Per-stage timestamps, filled when TIMESTAMP is requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub queued: Option<Instant>,
    pub process: Option<Instant>,
    pub done: Option<Instant>,
    pub dequeued: Option<Instant>,
}

/// QBUF/DQBUF request
#[derive(Debug, Clone)]
pub struct ContainerListDesc {
    pub direction: Direction,
    /// Client frame id
    pub id: u32,
    /// Bundle slot
    pub index: u32,
    pub flags: BundleFlags,
    pub timestamps: Timestamps,
    pub containers: Vec<ContainerDesc>,
}

impl ContainerListDesc {
    pub fn new(direction: Direction, index: u32) -> Self {
        Self {
            direction,
            id: 0,
            index,
            flags: BundleFlags::empty(),
            timestamps: Timestamps::default(),
            containers: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Append a single-buffer list container
    pub fn with_buffer(mut self, target: u32, handle: BufferHandle) -> Self {
        self.containers.push(ContainerDesc {
            kind: ContainerKind::List,
            target,
            memory: handle.memory_type(),
            buffers: vec![BufferDesc {
                roi: Roi::default(),
                handle,
            }],
        });
        self
    }
}

/// Live address-vector buffer handed to the engine and the golden matcher
#[derive(Debug, Clone)]
pub struct AvBuffer {
    /// Address-vector index (container target)
    pub index: u32,
    /// Position inside a batched container
    pub batch: usize,
    pub memory: SharedMemory,
    pub size: usize,
    /// Declared (channel, height, width) shape
    pub dims: (usize, usize, usize),
}

/// Mapped memory of a prepared buffer
#[derive(Debug)]
pub enum Backing {
    DmaBuf { fd: i32, mem: SharedMemory },
    Scratch { user: SharedMemory, scratch: SharedMemory },
}

impl Backing {
    /// Memory the device works on
    pub fn memory(&self) -> &SharedMemory {
        match self {
            Backing::DmaBuf { mem, .. } => mem,
            Backing::Scratch { scratch, .. } => scratch,
        }
    }
}

#[derive(Debug)]
pub struct Buffer {
    pub roi: Roi,
    pub handle: BufferHandle,
    pub size: usize,
    pub backing: Option<Backing>,
}

#[derive(Debug)]
pub struct Container {
    pub kind: ContainerKind,
    pub target: u32,
    pub memory: MemoryType,
    pub format: Format,
    pub buffers: Vec<Buffer>,
}

#[derive(Debug)]
pub struct ContainerList {
    pub direction: Direction,
    pub id: u32,
    pub index: u32,
    pub flags: BundleFlags,
    pub timestamps: Timestamps,
    pub containers: Vec<Container>,
}

/// Bundle lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Dequeued,
    Queued,
    Process,
    Done,
}

/// One queue slot's I/O state
#[derive(Debug)]
pub struct Bundle {
    pub state: BundleState,
    pub clist: ContainerList,
}

impl Bundle {
    /// Build a bundle from its first request
    pub fn from_desc(desc: &ContainerListDesc, formats: &[Format]) -> Result<Self> {
        if desc.containers.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "bundle {}: no containers",
                desc.index
            )));
        }
        if desc.containers.len() > MAX_ADDR_VECTOR {
            return Err(Error::ResourceExhausted {
                what: "containers",
                limit: MAX_ADDR_VECTOR,
            });
        }

        let mut containers = Vec::with_capacity(desc.containers.len());
        for c in &desc.containers {
            if c.buffers.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "target {}: container without buffers",
                    c.target
                )));
            }
            if c.buffers.len() > MAX_BUFFER {
                return Err(Error::ResourceExhausted {
                    what: "container buffers",
                    limit: MAX_BUFFER,
                });
            }

            let format = formats
                .iter()
                .find(|f| f.target == c.target)
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("target {}: no format set", c.target))
                })?;

            let mut buffers = Vec::with_capacity(c.buffers.len());
            for b in &c.buffers {
                if b.handle.memory_type() != c.memory {
                    return Err(Error::InvalidArgument(format!(
                        "target {}: buffer memory does not match container type {:?}",
                        c.target, c.memory
                    )));
                }
                buffers.push(Buffer {
                    roi: b.roi,
                    handle: b.handle.clone(),
                    size: format.total_size(),
                    backing: None,
                });
            }

            containers.push(Container {
                kind: c.kind,
                target: c.target,
                memory: c.memory,
                format,
                buffers,
            });
        }

        Ok(Self {
            state: BundleState::Dequeued,
            clist: ContainerList {
                direction: desc.direction,
                id: desc.id,
                index: desc.index,
                flags: desc.flags & BundleFlags::TIMESTAMP,
                timestamps: Timestamps::default(),
                containers,
            },
        })
    }

    /// Reject a re-queue whose shape differs from the first declaration
    pub fn check_shape(&self, desc: &ContainerListDesc) -> Result<()> {
        let index = self.clist.index;
        if desc.containers.len() != self.clist.containers.len() {
            return Err(Error::Conflict(format!(
                "bundle {}: container count {} != {}",
                index,
                desc.containers.len(),
                self.clist.containers.len()
            )));
        }

        for (c, d) in self.clist.containers.iter().zip(&desc.containers) {
            if c.target != d.target {
                return Err(Error::Conflict(format!(
                    "bundle {}: target {} != {}",
                    index, d.target, c.target
                )));
            }
            if c.kind != d.kind || c.memory != d.memory {
                return Err(Error::Conflict(format!(
                    "bundle {}: target {} layout or memory type changed",
                    index, c.target
                )));
            }
            if c.buffers.len() != d.buffers.len() {
                return Err(Error::Conflict(format!(
                    "bundle {}: target {} buffer count {} != {}",
                    index,
                    c.target,
                    d.buffers.len(),
                    c.buffers.len()
                )));
            }
            for (i, (b, db)) in c.buffers.iter().zip(&d.buffers).enumerate() {
                if !b.handle.same_as(&db.handle) {
                    return Err(Error::Conflict(format!(
                        "bundle {}: target {} buffer {} memory handle changed",
                        index, c.target, i
                    )));
                }
            }
        }
        Ok(())
    }

    /// Take over the per-cycle fields of a validated re-queue
    pub fn update(&mut self, desc: &ContainerListDesc) {
        self.clist.id = desc.id;
        self.clist.flags.remove(BundleFlags::TIMESTAMP | BundleFlags::INVALID | BundleFlags::DONE);
        self.clist.flags |= desc.flags & BundleFlags::TIMESTAMP;
        self.clist.timestamps = Timestamps::default();

        for (c, d) in self.clist.containers.iter_mut().zip(&desc.containers) {
            for (b, db) in c.buffers.iter_mut().zip(&d.buffers) {
                b.roi = db.roi;
            }
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.clist.flags.contains(BundleFlags::PREPARED)
    }

    /// Map every buffer; on failure everything mapped so far is released
    pub fn prepare(&mut self, backend: &dyn MemoryBackend, live: &AtomicUsize) -> Result<()> {
        if self.is_prepared() {
            return Ok(());
        }

        let mut failure = None;
        'outer: for c in self.clist.containers.iter_mut() {
            for b in c.buffers.iter_mut() {
                match map_buffer(b, backend) {
                    Ok(backing) => {
                        b.backing = Some(backing);
                        live.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break 'outer;
                    }
                }
            }
        }

        if let Some(e) = failure {
            log::error!(
                "npu: bundle {} prepare failed: {}",
                self.clist.index,
                e
            );
            self.release(backend, live);
            return Err(e);
        }

        self.clist.flags.insert(BundleFlags::PREPARED);
        Ok(())
    }

    /// Release every mapping
    pub fn unprepare(&mut self, backend: &dyn MemoryBackend, live: &AtomicUsize) {
        self.release(backend, live);
        self.clist.flags.remove(BundleFlags::PREPARED);
    }

    fn release(&mut self, backend: &dyn MemoryBackend, live: &AtomicUsize) {
        for c in self.clist.containers.iter_mut().rev() {
            for b in c.buffers.iter_mut().rev() {
                if let Some(backing) = b.backing.take() {
                    if let Backing::DmaBuf { fd, .. } = backing {
                        backend.detach(fd);
                    }
                    live.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    /// Cache maintenance before the device touches the bundle
    pub fn sync_for_device(&self, backend: &dyn MemoryBackend) {
        let dir = self.clist.direction;
        for b in self.buffers() {
            if let Some(backing) = &b.backing {
                if let (Backing::Scratch { user, scratch }, Direction::Input) = (backing, dir) {
                    let src = user.read();
                    let mut dst = scratch.write();
                    let n = dst.len().min(src.len());
                    dst[..n].copy_from_slice(&src[..n]);
                }
                backend.sync_for_device(backing.memory(), dir.dma());
            }
        }
    }

    /// Cache maintenance once the device is finished with the bundle
    pub fn sync_for_cpu(&self, backend: &dyn MemoryBackend) {
        let dir = self.clist.direction;
        for b in self.buffers() {
            if let Some(backing) = &b.backing {
                backend.sync_for_cpu(backing.memory(), dir.dma());
                if let (Backing::Scratch { user, scratch }, Direction::Output) = (backing, dir) {
                    let src = scratch.read();
                    let mut dst = user.write();
                    let n = dst.len().min(src.len());
                    dst[..n].copy_from_slice(&src[..n]);
                }
            }
        }
    }

    /// Address-vector view of the mapped buffers
    pub fn address_vectors(&self) -> Vec<AvBuffer> {
        let mut avs = Vec::new();
        for c in &self.clist.containers {
            for (batch, b) in c.buffers.iter().enumerate() {
                if let Some(backing) = &b.backing {
                    avs.push(AvBuffer {
                        index: c.target,
                        batch,
                        memory: backing.memory().clone(),
                        size: b.size,
                        dims: c.format.dims(),
                    });
                }
            }
        }
        avs
    }

    fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.clist.containers.iter().flat_map(|c| c.buffers.iter())
    }
}

fn map_buffer(b: &Buffer, backend: &dyn MemoryBackend) -> Result<Backing> {
    match &b.handle {
        BufferHandle::Fd(fd) => {
            let mem = backend.attach(*fd, b.size)?;
            Ok(Backing::DmaBuf { fd: *fd, mem })
        }
        BufferHandle::UserPtr(user) => {
            let len = user.read().len();
            if len < b.size {
                return Err(Error::Mapping(format!(
                    "user buffer holds {} bytes, {} required",
                    len, b.size
                )));
            }
            Ok(Backing::Scratch {
                user: user.clone(),
                scratch: shared(vec![0; len]),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{colorspace, FormatRequest};
    use crate::memory::DmaBufHeap;

    fn formats() -> Vec<Format> {
        vec![Format::resolve(&FormatRequest {
            target: 1,
            colorspace: colorspace::U8,
            width: 4,
            height: 2,
            ..Default::default()
        })
        .unwrap()]
    }

    #[test]
    fn test_missing_format_rejected() {
        let desc = ContainerListDesc::new(Direction::Input, 0).with_buffer(7, BufferHandle::Fd(3));
        assert!(matches!(
            Bundle::from_desc(&desc, &formats()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_shape_conflict() {
        let desc = ContainerListDesc::new(Direction::Input, 0).with_buffer(1, BufferHandle::Fd(3));
        let bundle = Bundle::from_desc(&desc, &formats()).unwrap();

        assert!(bundle.check_shape(&desc).is_ok());

        let other_fd =
            ContainerListDesc::new(Direction::Input, 0).with_buffer(1, BufferHandle::Fd(4));
        assert!(matches!(
            bundle.check_shape(&other_fd),
            Err(Error::Conflict(_))
        ));

        let user = ContainerListDesc::new(Direction::Input, 0)
            .with_buffer(1, BufferHandle::UserPtr(shared(vec![0; 8])));
        assert!(matches!(bundle.check_shape(&user), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_prepare_unwinds_on_failure() {
        let heap = DmaBufHeap::new();
        let good = heap.alloc(8);
        let short = heap.alloc(2);
        let live = AtomicUsize::new(0);

        let mut desc = ContainerListDesc::new(Direction::Input, 0);
        desc.containers.push(ContainerDesc {
            kind: ContainerKind::List,
            target: 1,
            memory: MemoryType::DmaBuf,
            buffers: vec![
                BufferDesc {
                    roi: Roi::default(),
                    handle: BufferHandle::Fd(good),
                },
                BufferDesc {
                    roi: Roi::default(),
                    handle: BufferHandle::Fd(short),
                },
            ],
        });

        let mut bundle = Bundle::from_desc(&desc, &formats()).unwrap();
        assert!(matches!(
            bundle.prepare(&heap, &live),
            Err(Error::Mapping(_))
        ));
        assert_eq!(live.load(Ordering::Acquire), 0);
        assert_eq!(heap.attach_count(good), 0);
        assert!(!bundle.is_prepared());
    }

    #[test]
    fn test_user_memory_round_trip() {
        let heap = DmaBufHeap::new();
        let live = AtomicUsize::new(0);
        let user = shared(vec![9; 8]);

        let desc = ContainerListDesc::new(Direction::Output, 0)
            .with_buffer(1, BufferHandle::UserPtr(user.clone()));
        let mut bundle = Bundle::from_desc(&desc, &formats()).unwrap();
        bundle.prepare(&heap, &live).unwrap();
        assert_eq!(live.load(Ordering::Acquire), 1);

        let avs = bundle.address_vectors();
        assert_eq!(avs.len(), 1);
        avs[0].memory.write().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        bundle.sync_for_cpu(&heap);
        assert_eq!(&user.read()[..], &[1, 2, 3, 4, 5, 6, 7, 8]);

        bundle.unprepare(&heap, &live);
        assert_eq!(live.load(Ordering::Acquire), 0);
    }
}
