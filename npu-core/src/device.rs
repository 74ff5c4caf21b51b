//! NPU device context
//!
//! Everything that is process-wide for one accelerator: the engine, the
//! memory backend, the session table, the golden matcher and the stream
//! reference count.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::NpuConfig;
use crate::engine::ComputeEngine;
use crate::error::Result;
use crate::golden::GoldenMatcher;
use crate::memory::MemoryBackend;
use crate::session::Session;
use crate::sessionmgr::SessionManager;

pub struct NpuDevice {
    config: NpuConfig,
    engine: Arc<dyn ComputeEngine>,
    memory: Arc<dyn MemoryBackend>,
    sessions: SessionManager,
    golden: GoldenMatcher,
    /// Streaming sessions
    start_refs: Mutex<u32>,
}

impl NpuDevice {
    pub fn probe(
        config: NpuConfig,
        engine: Arc<dyn ComputeEngine>,
        memory: Arc<dyn MemoryBackend>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let golden = GoldenMatcher::new(&config.golden);
        golden.init();

        info!(
            "npu: device probed ({} sessions, {} buffers per queue, golden {})",
            config.max_session,
            config.max_buffer,
            if config.golden.enabled { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            sessions: SessionManager::new(config.max_session),
            config,
            engine,
            memory,
            golden,
            start_refs: Mutex::new(0),
        }))
    }

    pub fn config(&self) -> &NpuConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ComputeEngine> {
        &self.engine
    }

    pub fn memory(&self) -> &Arc<dyn MemoryBackend> {
        &self.memory
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn golden(&self) -> &GoldenMatcher {
        &self.golden
    }

    pub fn open_session(self: &Arc<Self>) -> Result<Arc<Session>> {
        Session::open(self)
    }

    pub fn start_refs(&self) -> u32 {
        *self.start_refs.lock()
    }

    /// Take a stream reference; the first one powers the engine on
    pub(crate) fn acquire_start(&self) -> Result<()> {
        let mut refs = self.start_refs.lock();
        if *refs == 0 {
            self.engine.power_on()?;
        }
        *refs += 1;
        debug!("npu: start refs {}", *refs);
        Ok(())
    }

    /// Drop a stream reference; the last one powers the engine off
    pub(crate) fn release_start(&self) {
        let mut refs = self.start_refs.lock();
        match *refs {
            0 => warn!("npu: start ref released without holder"),
            1 => {
                *refs = 0;
                self.engine.power_off();
            }
            _ => *refs -= 1,
        }
        debug!("npu: start refs {}", *refs);
    }
}
