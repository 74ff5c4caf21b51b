//! Loopback self-test
//!
//! Drives one session through the full ioctl sequence and checks that
//! every output frame carries the bytes of its input.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};

use npu_core::{
    colorspace, AddressVector, BufferHandle, BundleFlags, ContainerListDesc, Direction,
    DmaBufHeap, FormatList, FormatRequest, GraphDesc, MemoryKind, Vertex, VertexFile, VertexIoctl,
};
use npu_core::vertex::IoctlReply;

const INPUT_AV: u32 = 0;
const OUTPUT_AV: u32 = 1;
/// Largest feature map the self-test will allocate
const MAX_FRAME_BYTES: usize = 64 << 20;

#[derive(Debug, Clone)]
pub struct SelfTestConfig {
    pub frames: u32,
    /// Edge length of the square U8 feature maps
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct SelfTestReport {
    pub frames: u32,
    pub bytes: usize,
    pub elapsed: Duration,
}

impl fmt::Display for SelfTestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "self-test passed: {} frames, {} bytes in {:?}",
            self.frames, self.bytes, self.elapsed
        )
    }
}

fn pattern(frame: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u32).wrapping_add(frame.wrapping_mul(7)) as u8).collect()
}

fn format_list(direction: Direction, target: u32, size: u32) -> FormatList {
    FormatList {
        direction,
        formats: vec![FormatRequest {
            target,
            colorspace: colorspace::U8,
            width: size,
            height: size,
            stride: size,
            ..Default::default()
        }],
    }
}

fn dequeue(file: &VertexFile, direction: Direction) -> Result<ContainerListDesc> {
    match file.ioctl(VertexIoctl::Dqbuf {
        direction,
        nonblocking: false,
    })? {
        IoctlReply::Dequeued(desc) => Ok(desc),
        IoctlReply::Done => bail!("dqbuf returned no bundle"),
    }
}

pub fn run(vertex: &Vertex, heap: &DmaBufHeap, config: &SelfTestConfig) -> Result<SelfTestReport> {
    ensure!(config.size > 0, "feature map size must be non-zero");
    let edge = config.size as usize;
    let len = edge.checked_mul(edge).unwrap_or(usize::MAX);
    ensure!(
        len <= MAX_FRAME_BYTES,
        "feature map {}x{} exceeds {} bytes",
        config.size,
        config.size,
        MAX_FRAME_BYTES
    );
    let start = Instant::now();

    let file = vertex.open().context("open vertex")?;
    info!("npu: self-test on session {}", file.session().uid());

    file.ioctl(VertexIoctl::SGraph(GraphDesc {
        id: 1,
        address_vectors: vec![
            AddressVector {
                index: INPUT_AV,
                kind: MemoryKind::Input,
                size: len,
            },
            AddressVector {
                index: OUTPUT_AV,
                kind: MemoryKind::Output,
                size: len,
            },
        ],
    }))?;
    file.ioctl(VertexIoctl::SFormat(format_list(Direction::Input, INPUT_AV, config.size)))?;
    file.ioctl(VertexIoctl::SFormat(format_list(Direction::Output, OUTPUT_AV, config.size)))?;

    let fd_in = heap.alloc(len);
    let fd_out = heap.alloc(len);
    let (Some(input_mem), Some(output_mem)) = (heap.memory(fd_in), heap.memory(fd_out)) else {
        bail!("heap lost its own buffers");
    };

    file.ioctl(VertexIoctl::StreamOn)?;

    for frame in 0..config.frames {
        let expected = pattern(frame, len);
        input_mem.write().copy_from_slice(&expected);
        output_mem.write().fill(0);

        file.ioctl(VertexIoctl::Qbuf(
            ContainerListDesc::new(Direction::Input, 0)
                .with_id(frame)
                .with_buffer(INPUT_AV, BufferHandle::Fd(fd_in)),
        ))?;
        file.ioctl(VertexIoctl::Qbuf(
            ContainerListDesc::new(Direction::Output, 0)
                .with_id(frame)
                .with_buffer(OUTPUT_AV, BufferHandle::Fd(fd_out)),
        ))?;

        let done_in = dequeue(&file, Direction::Input)?;
        let done_out = dequeue(&file, Direction::Output)?;
        for desc in [&done_in, &done_out] {
            ensure!(
                !desc.flags.contains(BundleFlags::INVALID),
                "frame {} {} bundle marked invalid",
                frame,
                desc.direction.name()
            );
        }

        if *output_mem.read() != expected {
            bail!("frame {}: output differs from input", frame);
        }
        debug!("npu: self-test frame {} ok", frame);
    }

    file.ioctl(VertexIoctl::StreamOff)?;
    file.close()?;
    heap.close(fd_in);
    heap.close(fd_out);

    Ok(SelfTestReport {
        frames: config.frames,
        bytes: len.saturating_mul(config.frames as usize),
        elapsed: start.elapsed(),
    })
}
