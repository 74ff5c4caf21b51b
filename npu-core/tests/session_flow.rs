//! End-to-end session flows through the vertex ioctl surface

use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use npu_core::error::errno;
use npu_core::memory::shared;
use npu_core::vertex::{status, IoctlReply};
use npu_core::{
    colorspace, AddressVector, BufferHandle, BundleFlags, ComputeEngine, ContainerListDesc,
    Direction, DmaBufHeap, DmaDirection, Error, FormatList, FormatRequest, GraphDesc,
    LoopbackEngine, MemoryBackend, MemoryKind, NpuConfig, NpuDevice, PollFlags, ResultCode,
    SessionState, SharedMemory, Vertex, VertexFile, VertexIoctl,
};

const EDGE: u32 = 4;
const LEN: usize = (EDGE * EDGE) as usize;

struct Rig {
    heap: Arc<DmaBufHeap>,
    engine: Arc<LoopbackEngine>,
    device: Arc<NpuDevice>,
    vertex: Vertex,
}

fn rig_with(engine: Arc<LoopbackEngine>, config: NpuConfig) -> Rig {
    let heap = Arc::new(DmaBufHeap::new());
    let device = NpuDevice::probe(config, engine.clone(), heap.clone()).unwrap();
    Rig {
        heap,
        engine,
        vertex: Vertex::new(device.clone()),
        device,
    }
}

fn rig() -> Rig {
    rig_with(LoopbackEngine::new(), NpuConfig::default())
}

fn graph() -> GraphDesc {
    GraphDesc {
        id: 9,
        address_vectors: vec![
            AddressVector {
                index: 0,
                kind: MemoryKind::Input,
                size: LEN,
            },
            AddressVector {
                index: 1,
                kind: MemoryKind::Output,
                size: LEN,
            },
            AddressVector {
                index: 2,
                kind: MemoryKind::Weight,
                size: 64,
            },
        ],
    }
}

fn formats(direction: Direction, target: u32) -> FormatList {
    FormatList {
        direction,
        formats: vec![FormatRequest {
            target,
            colorspace: colorspace::U8,
            width: EDGE,
            height: EDGE,
            ..Default::default()
        }],
    }
}

fn streaming(rig: &Rig) -> VertexFile {
    let file = rig.vertex.open().unwrap();
    file.ioctl(VertexIoctl::SGraph(graph())).unwrap();
    file.ioctl(VertexIoctl::SFormat(formats(Direction::Input, 0)))
        .unwrap();
    file.ioctl(VertexIoctl::SFormat(formats(Direction::Output, 1)))
        .unwrap();
    file.ioctl(VertexIoctl::StreamOn).unwrap();
    file
}

fn dqbuf(file: &VertexFile, direction: Direction, nonblocking: bool) -> Result<ContainerListDesc, Error> {
    match file.ioctl(VertexIoctl::Dqbuf {
        direction,
        nonblocking,
    })? {
        IoctlReply::Dequeued(desc) => Ok(desc),
        IoctlReply::Done => panic!("dqbuf without bundle"),
    }
}

#[test]
fn test_dmabuf_frames_loop_back() {
    let rig = rig();
    let file = streaming(&rig);

    let fd_in = rig.heap.alloc(LEN);
    let fd_out = rig.heap.alloc(LEN);
    let input = rig.heap.memory(fd_in).unwrap();
    let output = rig.heap.memory(fd_out).unwrap();

    for frame in 0..5u32 {
        let data: Vec<u8> = (0..LEN as u32).map(|i| (i * 3 + frame) as u8).collect();
        input.write().copy_from_slice(&data);

        file.ioctl(VertexIoctl::Qbuf(
            ContainerListDesc::new(Direction::Input, 0)
                .with_id(frame)
                .with_buffer(0, BufferHandle::Fd(fd_in)),
        ))
        .unwrap();
        file.ioctl(VertexIoctl::Qbuf(
            ContainerListDesc::new(Direction::Output, 0).with_buffer(1, BufferHandle::Fd(fd_out)),
        ))
        .unwrap();

        let done_in = dqbuf(&file, Direction::Input, false).unwrap();
        let done_out = dqbuf(&file, Direction::Output, false).unwrap();
        assert_eq!(done_in.id, frame);
        assert!(done_out.flags.contains(BundleFlags::DONE));
        assert!(!done_out.flags.contains(BundleFlags::INVALID));
        assert_eq!(*output.read(), data);
    }

    file.ioctl(VertexIoctl::StreamOff).unwrap();
    assert!(file.session().state().contains(SessionState::STOP));
    assert_eq!(rig.heap.attach_count(fd_in), 0);
    assert_eq!(rig.engine.stats().completed, 5);
    file.close().unwrap();
    assert_eq!(rig.device.sessions().count(), 0);
}

#[test]
fn test_user_pointers_go_through_scratch() {
    let rig = rig();
    let file = streaming(&rig);

    let src = shared((0..LEN as u8).collect());
    let dst = shared(vec![0; LEN]);

    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Output, 1).with_buffer(1, BufferHandle::UserPtr(dst.clone())),
    ))
    .unwrap();
    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Input, 2).with_buffer(0, BufferHandle::UserPtr(src.clone())),
    ))
    .unwrap();

    let out = dqbuf(&file, Direction::Output, false).unwrap();
    assert_eq!(out.index, 1);
    assert_eq!(*dst.read(), *src.read());
    dqbuf(&file, Direction::Input, false).unwrap();
}

#[test]
fn test_nothing_dispatched_without_a_pair() {
    let rig = rig_with(LoopbackEngine::manual(), NpuConfig::default());
    let file = streaming(&rig);

    for index in 0..3 {
        file.ioctl(VertexIoctl::Qbuf(
            ContainerListDesc::new(Direction::Input, index)
                .with_buffer(0, BufferHandle::Fd(rig.heap.alloc(LEN))),
        ))
        .unwrap();
    }
    assert_eq!(rig.engine.pending(), 0);

    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Output, 0)
            .with_buffer(1, BufferHandle::Fd(rig.heap.alloc(LEN))),
    ))
    .unwrap();
    assert_eq!(rig.engine.pending(), 1);

    rig.engine.run_pending();
    // Oldest input is paired first
    assert_eq!(dqbuf(&file, Direction::Input, true).unwrap().index, 0);
    assert!(matches!(
        dqbuf(&file, Direction::Input, true),
        Err(Error::WouldBlock)
    ));
}

#[test]
fn test_nonblocking_dqbuf_status_is_eagain() {
    let rig = rig();
    let file = streaming(&rig);

    let started = Instant::now();
    let result = file.ioctl(VertexIoctl::Dqbuf {
        direction: Direction::Output,
        nonblocking: true,
    });
    assert_eq!(status(&result), -errno::EAGAIN);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(file.poll(), PollFlags::empty());
}

#[test]
fn test_blocked_dqbuf_wakes_on_completion() {
    let rig = rig_with(LoopbackEngine::manual(), NpuConfig::default());
    let file = Arc::new(streaming(&rig));

    let waiter = {
        let file = file.clone();
        thread::spawn(move || dqbuf(&file, Direction::Output, false).map(|d| d.index))
    };

    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Input, 0)
            .with_buffer(0, BufferHandle::Fd(rig.heap.alloc(LEN))),
    ))
    .unwrap();
    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Output, 3)
            .with_buffer(1, BufferHandle::Fd(rig.heap.alloc(LEN))),
    ))
    .unwrap();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(rig.engine.run_pending(), 1);
    assert_eq!(waiter.join().unwrap().unwrap(), 3);
}

#[test]
fn test_out_of_order_ioctls_are_rejected() {
    let rig = rig();
    let file = rig.vertex.open().unwrap();
    let before = file.session().state();

    for cmd in [
        VertexIoctl::SFormat(formats(Direction::Input, 0)),
        VertexIoctl::StreamOn,
        VertexIoctl::StreamOff,
        VertexIoctl::Qbuf(ContainerListDesc::new(Direction::Input, 0)),
        VertexIoctl::Dqbuf {
            direction: Direction::Input,
            nonblocking: true,
        },
    ] {
        let name = cmd.name();
        let result = file.ioctl(cmd);
        assert_eq!(status(&result), -errno::EINVAL, "{}", name);
    }
    assert_eq!(file.session().state(), before);

    file.ioctl(VertexIoctl::SGraph(graph())).unwrap();
    file.ioctl(VertexIoctl::SFormat(formats(Direction::Input, 0)))
        .unwrap();
    // Output format still missing
    assert!(matches!(
        file.ioctl(VertexIoctl::StreamOn),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_format_after_streamon_fails() {
    let rig = rig();
    let file = streaming(&rig);
    assert!(matches!(
        file.ioctl(VertexIoctl::SFormat(formats(Direction::Input, 0))),
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        file.ioctl(VertexIoctl::SGraph(graph())),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_qbuf_target_must_be_in_graph() {
    let rig = rig();
    let file = streaming(&rig);
    let weight_target = ContainerListDesc::new(Direction::Input, 0)
        .with_buffer(2, BufferHandle::Fd(rig.heap.alloc(LEN)));
    assert!(matches!(
        file.ioctl(VertexIoctl::Qbuf(weight_target)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_streamon_failure_then_retry() {
    let rig = rig();
    let file = rig.vertex.open().unwrap();
    file.ioctl(VertexIoctl::SGraph(graph())).unwrap();
    file.ioctl(VertexIoctl::SFormat(formats(Direction::Input, 0)))
        .unwrap();
    file.ioctl(VertexIoctl::SFormat(formats(Direction::Output, 1)))
        .unwrap();

    rig.engine.set_stream_on_result(ResultCode(0x21));
    let result = file.ioctl(VertexIoctl::StreamOn);
    assert_eq!(status(&result), -errno::EIO);
    assert!(!file.session().state().contains(SessionState::START));
    assert_eq!(rig.device.start_refs(), 0);

    rig.engine.set_stream_on_result(ResultCode::NO_ERROR);
    file.ioctl(VertexIoctl::StreamOn).unwrap();
    assert!(file.session().state().contains(SessionState::START));
}

#[test]
fn test_start_refcount_spans_sessions() {
    let rig = rig();
    let a = streaming(&rig);
    let b = streaming(&rig);
    assert_eq!(rig.device.start_refs(), 2);
    assert_eq!(rig.engine.stats().power_cycles, 1);

    a.ioctl(VertexIoctl::StreamOff).unwrap();
    assert!(rig.engine.is_powered());
    b.ioctl(VertexIoctl::StreamOff).unwrap();
    assert!(!rig.engine.is_powered());
    assert_eq!(rig.device.start_refs(), 0);
}

#[test]
fn test_streamoff_busy_then_close_forces() {
    let rig = rig_with(LoopbackEngine::manual(), NpuConfig::default());
    let file = streaming(&rig);

    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Input, 0)
            .with_buffer(0, BufferHandle::Fd(rig.heap.alloc(LEN))),
    ))
    .unwrap();
    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Output, 0)
            .with_buffer(1, BufferHandle::Fd(rig.heap.alloc(LEN))),
    ))
    .unwrap();

    let result = file.ioctl(VertexIoctl::StreamOff);
    assert_eq!(status(&result), -errno::EBUSY);

    let session = file.session().clone();
    file.close().unwrap();
    assert!(session.state().contains(SessionState::CLOSE));
    assert_eq!(session.queue(Direction::Input).live_buffers(), 0);
    assert_eq!(session.queue(Direction::Output).live_buffers(), 0);
    // Forced streamoff flushed the parked frame
    assert_eq!(rig.engine.pending(), 0);
    assert_eq!(rig.device.start_refs(), 0);
}

#[test]
fn test_emergency_close_waits_configured_delay() {
    let config = NpuConfig {
        streamoff_delay_ms: 30,
        ..Default::default()
    };
    let rig = rig_with(LoopbackEngine::manual(), config);
    let file = streaming(&rig);
    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Input, 0)
            .with_buffer(0, BufferHandle::Fd(rig.heap.alloc(LEN))),
    ))
    .unwrap();

    rig.engine.set_emergency(true);
    let started = Instant::now();
    drop(file);
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(rig.device.sessions().count(), 0);
    assert_eq!(rig.device.start_refs(), 0);
}

#[test]
fn test_session_limit_is_enforced() {
    let config = NpuConfig {
        max_session: 3,
        ..Default::default()
    };
    let rig = rig_with(LoopbackEngine::manual(), config);

    let files: Vec<VertexFile> = (0..3).map(|_| rig.vertex.open().unwrap()).collect();
    let uids: Vec<u32> = files.iter().map(|f| f.session().uid()).collect();
    assert_eq!(uids, vec![0, 1, 2]);

    assert!(matches!(
        rig.vertex.open(),
        Err(Error::ResourceExhausted { .. })
    ));
    assert_eq!(rig.device.sessions().occupied(), vec![0, 1, 2]);
}

#[test]
fn test_concurrent_opens_get_distinct_uids() {
    let rig = rig_with(LoopbackEngine::manual(), NpuConfig::default());
    let vertex = Arc::new(rig.vertex);

    let handles: Vec<_> = (0..npu_core::NPU_MAX_SESSION)
        .map(|_| {
            let vertex = vertex.clone();
            thread::spawn(move || vertex.open().unwrap())
        })
        .collect();
    let files: Vec<VertexFile> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut uids: Vec<u32> = files.iter().map(|f| f.session().uid()).collect();
    uids.sort_unstable();
    assert_eq!(uids, (0..npu_core::NPU_MAX_SESSION as u32).collect::<Vec<_>>());
    assert!(vertex.open().is_err());
}

#[test]
fn test_params_and_controls_reach_engine() {
    let rig = rig();
    let file = rig.vertex.open().unwrap();
    file.ioctl(VertexIoctl::SCtrl(npu_core::Control { id: 4, value: 1 }))
        .unwrap();
    file.ioctl(VertexIoctl::SGraph(graph())).unwrap();
    file.ioctl(VertexIoctl::SParam(npu_core::ParamList {
        params: vec![npu_core::Param {
            target: 2,
            offset: 8,
            size: 4,
            value: 0x1234,
        }],
    }))
    .unwrap();

    assert_eq!(rig.engine.controls(), vec![(0, npu_core::Control { id: 4, value: 1 })]);
    assert_eq!(rig.engine.params()[0].1.params[0].value, 0x1234);
    assert_eq!(file.session().params().len(), 1);
}

#[test]
fn test_failed_frames_are_marked_invalid() {
    let rig = rig();
    rig.engine.set_frame_result(ResultCode(3));
    let file = streaming(&rig);

    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Input, 0)
            .with_buffer(0, BufferHandle::Fd(rig.heap.alloc(LEN))),
    ))
    .unwrap();
    file.ioctl(VertexIoctl::Qbuf(
        ContainerListDesc::new(Direction::Output, 0)
            .with_buffer(1, BufferHandle::Fd(rig.heap.alloc(LEN))),
    ))
    .unwrap();

    let out = dqbuf(&file, Direction::Output, false).unwrap();
    assert!(out.flags.contains(BundleFlags::INVALID | BundleFlags::DONE));
}

#[test]
fn test_prepare_then_qbuf_reuses_mapping() {
    let rig = rig_with(LoopbackEngine::manual(), NpuConfig::default());
    let file = rig.vertex.open().unwrap();
    file.ioctl(VertexIoctl::SGraph(graph())).unwrap();
    file.ioctl(VertexIoctl::SFormat(formats(Direction::Input, 0)))
        .unwrap();

    let fd = rig.heap.alloc(LEN);
    let desc = ContainerListDesc::new(Direction::Input, 0).with_buffer(0, BufferHandle::Fd(fd));
    file.ioctl(VertexIoctl::Prepare(desc.clone())).unwrap();
    assert_eq!(rig.heap.attach_count(fd), 1);

    file.ioctl(VertexIoctl::Unprepare(desc.clone())).unwrap();
    assert_eq!(rig.heap.attach_count(fd), 0);

    file.ioctl(VertexIoctl::Prepare(desc)).unwrap();
    file.ioctl(VertexIoctl::SFormat(formats(Direction::Output, 1)))
        .unwrap();
    file.ioctl(VertexIoctl::StreamOn).unwrap();
    assert_eq!(rig.heap.attach_count(fd), 1);
}

fn sized_formats(direction: Direction, target: u32, width: u32, height: u32) -> FormatList {
    FormatList {
        direction,
        formats: vec![FormatRequest {
            target,
            colorspace: colorspace::U8,
            width,
            height,
            ..Default::default()
        }],
    }
}

#[test]
fn test_golden_reordered_on_completion_path() {
    // 5x6 feature map dumped as an 8x8 grid of 4x4 tiles
    let (h, w) = (5usize, 6usize);
    let tiled_len = 64;
    let tiled_index = |row: usize, col: usize| (row / 4) * 32 + (col / 4) * 16 + (row % 4) * 4 + col % 4;

    let golden: Vec<u8> = (0..(h * w) as u8).map(|v| v.wrapping_mul(3)).collect();
    let mut tiled = vec![0u8; tiled_len];
    for row in 0..h {
        for col in 0..w {
            tiled[tiled_index(row, col)] = golden[row * w + col];
        }
    }

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("av1.bin");
    fs::write(&path, &golden).unwrap();

    let rig = rig();
    let matcher = rig.device.golden();
    matcher.open_desc().unwrap();
    matcher
        .write_desc(format!("COMPARATOR REORDERED\n1 {}\n", path.display()).as_bytes())
        .unwrap();
    matcher.close_desc().unwrap();

    let file = rig.vertex.open().unwrap();
    file.ioctl(VertexIoctl::SGraph(GraphDesc {
        id: 2,
        address_vectors: vec![
            AddressVector {
                index: 0,
                kind: MemoryKind::Input,
                size: tiled_len,
            },
            AddressVector {
                index: 1,
                kind: MemoryKind::Output,
                size: tiled_len,
            },
        ],
    }))
    .unwrap();
    file.ioctl(VertexIoctl::SFormat(sized_formats(Direction::Input, 0, w as u32, h as u32)))
        .unwrap();
    file.ioctl(VertexIoctl::SFormat(sized_formats(Direction::Output, 1, w as u32, h as u32)))
        .unwrap();
    file.ioctl(VertexIoctl::StreamOn).unwrap();

    let fd_in = rig.heap.export(tiled);
    let fd_out = rig.heap.alloc(tiled_len);
    let input = rig.heap.memory(fd_in).unwrap();

    let run_frame = |id: u32| {
        file.ioctl(VertexIoctl::Qbuf(
            ContainerListDesc::new(Direction::Input, 0)
                .with_id(id)
                .with_buffer(0, BufferHandle::Fd(fd_in)),
        ))
        .unwrap();
        file.ioctl(VertexIoctl::Qbuf(
            ContainerListDesc::new(Direction::Output, 0).with_buffer(1, BufferHandle::Fd(fd_out)),
        ))
        .unwrap();
        dqbuf(&file, Direction::Input, false).unwrap();
        let out = dqbuf(&file, Direction::Output, false).unwrap();
        assert!(!out.flags.contains(BundleFlags::INVALID));
    };

    run_frame(0);
    assert_eq!(matcher.compared(), 1);
    let text = matcher.result_text();
    assert!(text.contains("(REORDERED):"), "{}", text);
    assert!(text.contains("0 of 30 bytes mismatch"), "{}", text);

    // row 4, col 5 holds golden byte 29 * 3
    input.write()[tiled_index(4, 5)] = 0xee;
    run_frame(1);
    assert_eq!(matcher.compared(), 2);
    let text = matcher.result_text();
    assert!(text.contains("(0 4 5 0x57 0xee)"), "{}", text);
    assert!(text.contains("1 of 30 bytes mismatch"), "{}", text);

    file.ioctl(VertexIoctl::StreamOff).unwrap();
}

/// Heap whose next CPU sync parks until the test lets it continue
struct GatedHeap {
    heap: DmaBufHeap,
    gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl MemoryBackend for GatedHeap {
    fn attach(&self, fd: i32, size: usize) -> npu_core::Result<SharedMemory> {
        self.heap.attach(fd, size)
    }

    fn detach(&self, fd: i32) {
        self.heap.detach(fd)
    }

    fn sync_for_device(&self, mem: &SharedMemory, dir: DmaDirection) {
        self.heap.sync_for_device(mem, dir)
    }

    fn sync_for_cpu(&self, mem: &SharedMemory, dir: DmaDirection) {
        let gate = self.gate.lock().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        self.heap.sync_for_cpu(mem, dir)
    }
}

#[test]
fn test_session_dropped_inside_its_completion() {
    let heap = Arc::new(GatedHeap {
        heap: DmaBufHeap::new(),
        gate: Mutex::new(None),
    });
    let engine = LoopbackEngine::new();
    let device = NpuDevice::probe(NpuConfig::default(), engine.clone(), heap.clone()).unwrap();

    let session = device.open_session().unwrap();
    session.s_graph(graph()).unwrap();
    session.s_format(&formats(Direction::Input, 0)).unwrap();
    session.s_format(&formats(Direction::Output, 1)).unwrap();
    session.streamon().unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *heap.gate.lock() = Some((entered_tx, release_rx));

    session
        .qbuf(
            &ContainerListDesc::new(Direction::Input, 0)
                .with_buffer(0, BufferHandle::Fd(heap.heap.alloc(LEN))),
        )
        .unwrap();
    session
        .qbuf(
            &ContainerListDesc::new(Direction::Output, 0)
                .with_buffer(1, BufferHandle::Fd(heap.heap.alloc(LEN))),
        )
        .unwrap();

    // The worker is inside frame completion; it now holds the last reference
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    drop(session);
    release_tx.send(()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while device.sessions().count() != 0 || device.start_refs() != 0 {
        assert!(Instant::now() < deadline, "dropped session never tore down");
        thread::sleep(Duration::from_millis(5));
    }

    // The worker went idle, so a stream-off from any thread returns
    let (done_tx, done_rx) = mpsc::channel();
    {
        let engine = engine.clone();
        thread::spawn(move || {
            let _ = done_tx.send(engine.stream_off(0));
        });
    }
    assert_eq!(
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ResultCode::NO_ERROR
    );
    assert_eq!(engine.stats().completed, 1);
    assert!(!engine.is_powered());
}
