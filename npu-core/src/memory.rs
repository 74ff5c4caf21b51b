//! NPU Memory Management
//!
//! Buffer memory is shared between the client, the queue and the compute
//! engine. DMA-buf style imports and cache maintenance go through a
//! [`MemoryBackend`] so the queue logic never touches coherency details.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Byte storage shared between client, queue and engine
pub type SharedMemory = Arc<RwLock<Vec<u8>>>;

/// Wrap bytes into shared memory
pub fn shared(bytes: Vec<u8>) -> SharedMemory {
    Arc::new(RwLock::new(bytes))
}

/// DMA transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// CPU writes, device reads (input feature maps)
    ToDevice,
    /// Device writes, CPU reads (output feature maps)
    FromDevice,
    Bidirectional,
}

/// Memory ownership and coherency capability
pub trait MemoryBackend: Send + Sync {
    /// Import and map a DMA-buf; the mapping must cover at least `size` bytes
    fn attach(&self, fd: i32, size: usize) -> Result<SharedMemory>;

    /// Release a mapping obtained from `attach`
    fn detach(&self, fd: i32);

    /// Make CPU writes visible to the device (clean)
    fn sync_for_device(&self, mem: &SharedMemory, dir: DmaDirection);

    /// Make device writes visible to the CPU (invalidate)
    fn sync_for_cpu(&self, mem: &SharedMemory, dir: DmaDirection);
}

/// Memory pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub exported: u64,
    pub attached: u64,
    pub device_syncs: u64,
    pub cpu_syncs: u64,
}

/// In-process DMA-buf exporter
///
/// Hands out file-descriptor-like handles for byte buffers and counts every
/// attach and cache maintenance call.
pub struct DmaBufHeap {
    buffers: RwLock<BTreeMap<i32, SharedMemory>>,
    attachments: Mutex<BTreeMap<i32, u32>>,
    next_fd: AtomicI32,
    exported: AtomicU64,
    attached: AtomicU64,
    device_syncs: AtomicU64,
    cpu_syncs: AtomicU64,
}

impl DmaBufHeap {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(BTreeMap::new()),
            attachments: Mutex::new(BTreeMap::new()),
            next_fd: AtomicI32::new(3),
            exported: AtomicU64::new(0),
            attached: AtomicU64::new(0),
            device_syncs: AtomicU64::new(0),
            cpu_syncs: AtomicU64::new(0),
        }
    }

    /// Export bytes as a new DMA-buf and return its fd
    pub fn export(&self, bytes: Vec<u8>) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.buffers.write().insert(fd, shared(bytes));
        self.exported.fetch_add(1, Ordering::Relaxed);
        fd
    }

    /// Allocate a zeroed DMA-buf
    pub fn alloc(&self, size: usize) -> i32 {
        self.export(vec![0; size])
    }

    /// Look up the memory behind an exported fd
    pub fn memory(&self, fd: i32) -> Option<SharedMemory> {
        self.buffers.read().get(&fd).cloned()
    }

    /// Drop an exported buffer; live attachments keep their mapping
    pub fn close(&self, fd: i32) -> bool {
        self.buffers.write().remove(&fd).is_some()
    }

    /// Number of outstanding attachments of one fd
    pub fn attach_count(&self, fd: i32) -> u32 {
        self.attachments.lock().get(&fd).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            exported: self.exported.load(Ordering::Relaxed),
            attached: self.attached.load(Ordering::Relaxed),
            device_syncs: self.device_syncs.load(Ordering::Relaxed),
            cpu_syncs: self.cpu_syncs.load(Ordering::Relaxed),
        }
    }
}

impl Default for DmaBufHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for DmaBufHeap {
    fn attach(&self, fd: i32, size: usize) -> Result<SharedMemory> {
        let mem = self
            .memory(fd)
            .ok_or_else(|| Error::Mapping(format!("fd {} is not a dma-buf", fd)))?;

        let len = mem.read().len();
        if len < size {
            return Err(Error::Mapping(format!(
                "fd {} holds {} bytes, {} required",
                fd, len, size
            )));
        }

        *self.attachments.lock().entry(fd).or_insert(0) += 1;
        self.attached.fetch_add(1, Ordering::Relaxed);
        Ok(mem)
    }

    fn detach(&self, fd: i32) {
        let mut attachments = self.attachments.lock();
        if let Some(count) = attachments.get_mut(&fd) {
            *count -= 1;
            if *count == 0 {
                attachments.remove(&fd);
            }
        } else {
            log::warn!("npu: detach of unattached fd {}", fd);
        }
    }

    fn sync_for_device(&self, _mem: &SharedMemory, _dir: DmaDirection) {
        self.device_syncs.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_for_cpu(&self, _mem: &SharedMemory, _dir: DmaDirection) {
        self.cpu_syncs.fetch_add(1, Ordering::Relaxed);
    }
}
