//! Vertex device
//!
//! Character-device front end: each open file is one session, and every
//! request arrives as an ioctl that is routed to that session.

use std::sync::Arc;

use log::{debug, error};

use crate::buffer::{ContainerListDesc, Direction};
use crate::device::NpuDevice;
use crate::error::Result;
use crate::format::FormatList;
use crate::graph::{Control, GraphDesc, ParamList};
use crate::session::{PollFlags, Session};

#[derive(Debug, Clone)]
pub enum VertexIoctl {
    SGraph(GraphDesc),
    SFormat(FormatList),
    SParam(ParamList),
    SCtrl(Control),
    StreamOn,
    StreamOff,
    Qbuf(ContainerListDesc),
    Dqbuf { direction: Direction, nonblocking: bool },
    Prepare(ContainerListDesc),
    Unprepare(ContainerListDesc),
}

impl VertexIoctl {
    pub fn name(&self) -> &'static str {
        match self {
            VertexIoctl::SGraph(_) => "S_GRAPH",
            VertexIoctl::SFormat(_) => "S_FORMAT",
            VertexIoctl::SParam(_) => "S_PARAM",
            VertexIoctl::SCtrl(_) => "S_CTRL",
            VertexIoctl::StreamOn => "STREAM_ON",
            VertexIoctl::StreamOff => "STREAM_OFF",
            VertexIoctl::Qbuf(_) => "QBUF",
            VertexIoctl::Dqbuf { .. } => "DQBUF",
            VertexIoctl::Prepare(_) => "PREPARE",
            VertexIoctl::Unprepare(_) => "UNPREPARE",
        }
    }
}

#[derive(Debug)]
pub enum IoctlReply {
    Done,
    Dequeued(ContainerListDesc),
}

/// ioctl status word: 0 or a negative errno
pub fn status(result: &Result<IoctlReply>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.errno(),
    }
}

pub struct Vertex {
    device: Arc<NpuDevice>,
}

impl Vertex {
    pub fn new(device: Arc<NpuDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<NpuDevice> {
        &self.device
    }

    pub fn open(&self) -> Result<VertexFile> {
        let session = self.device.open_session()?;
        Ok(VertexFile {
            session,
            closed: false,
        })
    }
}

/// One open vertex file
pub struct VertexFile {
    session: Arc<Session>,
    closed: bool,
}

impl VertexFile {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn ioctl(&self, cmd: VertexIoctl) -> Result<IoctlReply> {
        let name = cmd.name();
        let uid = self.session.uid();
        debug!("npu: session {} {}", uid, name);

        let result = self.dispatch(cmd);
        if let Err(e) = &result {
            if !e.is_would_block() {
                error!("npu: session {} {} failed: {}", uid, name, e);
            }
        }
        result
    }

    fn dispatch(&self, cmd: VertexIoctl) -> Result<IoctlReply> {
        let session = &self.session;
        match cmd {
            VertexIoctl::SGraph(graph) => session.s_graph(graph)?,
            VertexIoctl::SFormat(list) => session.s_format(&list)?,
            VertexIoctl::SParam(params) => session.s_param(params)?,
            VertexIoctl::SCtrl(ctrl) => session.s_ctrl(ctrl)?,
            VertexIoctl::StreamOn => session.streamon()?,
            VertexIoctl::StreamOff => session.streamoff()?,
            VertexIoctl::Qbuf(desc) => session.qbuf(&desc)?,
            VertexIoctl::Dqbuf {
                direction,
                nonblocking,
            } => {
                let mut desc = ContainerListDesc::new(direction, 0);
                session.dqbuf(&mut desc, nonblocking)?;
                return Ok(IoctlReply::Dequeued(desc));
            }
            VertexIoctl::Prepare(desc) => session.prepare(&desc)?,
            VertexIoctl::Unprepare(desc) => session.unprepare(&desc)?,
        }
        Ok(IoctlReply::Done)
    }

    pub fn poll(&self) -> PollFlags {
        self.session.poll()
    }

    /// Release the file; streams still running are forced off
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.session.close()
    }
}

impl Drop for VertexFile {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.session.close() {
                error!("npu: session {} close: {}", self.session.uid(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NpuConfig;
    use crate::engine::LoopbackEngine;
    use crate::error::{errno, Error};
    use crate::memory::DmaBufHeap;

    fn vertex(max_session: usize) -> Vertex {
        let config = NpuConfig {
            max_session,
            ..Default::default()
        };
        let device = NpuDevice::probe(
            config,
            LoopbackEngine::manual(),
            Arc::new(DmaBufHeap::new()),
        )
        .unwrap();
        Vertex::new(device)
    }

    #[test]
    fn test_status_codes() {
        let v = vertex(2);
        let file = v.open().unwrap();

        assert_eq!(status(&file.ioctl(VertexIoctl::StreamOn)), -errno::EINVAL);
        assert_eq!(
            status(&file.ioctl(VertexIoctl::SCtrl(Control { id: 1, value: 2 }))),
            0
        );
    }

    #[test]
    fn test_open_limit_and_drop_releases() {
        let v = vertex(1);
        let file = v.open().unwrap();
        assert!(matches!(
            v.open(),
            Err(Error::ResourceExhausted { .. })
        ));

        drop(file);
        assert_eq!(v.device().sessions().count(), 0);
        let file = v.open().unwrap();
        assert_eq!(file.session().uid(), 0);
        file.close().unwrap();
    }
}
