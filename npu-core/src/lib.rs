//! Vision NPU core
//!
//! Buffer queues, the session state machine and the golden-reference
//! matcher of the vision accelerator driver.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Client (ioctl on a vertex file)                                │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │
//! ┌───────────────────────────▼─────────────────────────────────────┐
//! │  Vertex ─► Session (state bits, session lock)                   │
//! │  ┌──────────────────────┐        ┌──────────────────────┐       │
//! │  │  BufferQueue (IN)    │        │  BufferQueue (OUT)   │       │
//! │  │  queued/process/done │        │  queued/process/done │       │
//! │  └──────────┬───────────┘        └───────────┬──────────┘       │
//! │             └──────── matched pair ──────────┘                  │
//! │                           │ Frame                               │
//! │  ┌────────────────────────▼──────────────────────────────────┐  │
//! │  │  ComputeEngine  ──complete──►  GoldenMatcher ─► done      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod format;
pub mod golden;
pub mod graph;
pub mod memory;
pub mod queue;
pub mod session;
pub mod sessionmgr;
pub mod vertex;

/// Bundle slots per queue
pub const MAX_BUFFER: usize = 16;
/// Planes per buffer format
pub const MAX_PLANES: usize = 3;
/// Hardware session limit
pub const NPU_MAX_SESSION: usize = 32;
/// Address vectors per compiled graph
pub const MAX_ADDR_VECTOR: usize = 64;

pub use buffer::{BufferHandle, BundleFlags, BundleState, ContainerListDesc, Direction};
pub use config::{GoldenConfig, NpuConfig};
pub use device::NpuDevice;
pub use engine::{ComputeEngine, Frame, LoopbackEngine, ResultCode};
pub use error::{Error, Result};
pub use format::{colorspace, FormatList, FormatRequest};
pub use golden::{FrameInfo, GoldenMatcher, MatchState};
pub use graph::{AddressVector, Control, GraphDesc, MemoryKind, Param, ParamList};
pub use memory::{DmaBufHeap, DmaDirection, MemoryBackend, SharedMemory};
pub use queue::{BufferQueue, QueueCounts};
pub use session::{PollFlags, Session, SessionState};
pub use sessionmgr::SessionManager;
pub use vertex::{IoctlReply, Vertex, VertexFile, VertexIoctl};
