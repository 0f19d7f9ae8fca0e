//! End-to-end scenarios exercising the kernel the way a user-mode caller
//! would: through `Kernel`'s public methods only, never reaching into its
//! internals. Each scenario spawns a small process/thread tree and reports
//! its result back to the host test thread over a channel, since only a
//! kernel thread itself holds a `Tid` it can make further kernel calls
//! with.

use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tinykernel_core::config::KernelConfig;
use tinykernel_core::ids::{Port, NO_TIMEOUT};
use tinykernel_core::kernel::{Kernel, ShutdownHow, Task};

fn fast_config() -> KernelConfig {
    let mut cfg = KernelConfig::default();
    cfg.tick_period = Duration::from_millis(1);
    cfg.quantum_ticks = 5;
    cfg
}

fn recv_within<T>(rx: &Receiver<T>, timeout: Duration) -> T {
    rx.recv_timeout(timeout)
        .expect("scenario did not report a result in time")
}

#[test]
fn exec_exit_wait_reports_child_status() {
    let kernel = Kernel::new(fast_config());
    let (tx, rx) = channel::<(u32, i32)>();
    let tx = Mutex::new(tx);

    let root: Task = Arc::new(move |kernel, tid, _args| {
        let child_task: Task = Arc::new(|_k, _tid, _args| 42);
        let child_tid = kernel.exec(tid, child_task, Vec::new()).expect("exec");
        let (pid, status) = kernel.wait_child(tid, None).expect("wait_child");
        assert_eq!(pid, child_tid.pid());
        tx.lock().unwrap().send((pid.as_u32(), status)).unwrap();
        0
    });
    kernel.spawn_init(root, Vec::new()).expect("spawn root");

    let (_pid, status) = recv_within(&rx, Duration::from_secs(2));
    assert_eq!(status, 42);
    kernel.shutdown();
}

#[test]
fn pipe_echo_roundtrips_exact_bytes() {
    let kernel = Kernel::new(fast_config());
    let (tx, rx) = channel::<Vec<u8>>();
    let tx = Mutex::new(tx);

    let root: Task = Arc::new(move |kernel, tid, _args| {
        let (read_fid, write_fid) = kernel.pipe(tid).expect("pipe");
        let input: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let writer_input = input.clone();
        let writer: Task = Arc::new(move |kernel, tid, _args| {
            for byte in &writer_input {
                kernel.write(tid, write_fid, std::slice::from_ref(byte)).expect("write");
            }
            kernel.close(tid, write_fid).expect("close write end");
            0
        });
        let writer_tid = kernel.create_thread(tid, writer, Vec::new()).expect("spawn writer");

        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = kernel.read(tid, read_fid, &mut byte).expect("read");
            if n == 0 {
                break;
            }
            out.push(byte[0]);
        }
        kernel.thread_join(tid, writer_tid).expect("join writer");
        kernel.close(tid, read_fid).expect("close read end");
        tx.lock().unwrap().send(out).unwrap();
        0
    });
    kernel.spawn_init(root, Vec::new()).expect("spawn root");

    let out = recv_within(&rx, Duration::from_secs(5));
    let expected: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    assert_eq!(out, expected);
    kernel.shutdown();
}

#[test]
fn pipe_write_after_reader_close_fails() {
    let kernel = Kernel::new(fast_config());
    let (tx, rx) = channel::<bool>();
    let tx = Mutex::new(tx);

    let root: Task = Arc::new(move |kernel, tid, _args| {
        let (read_fid, write_fid) = kernel.pipe(tid).expect("pipe");
        kernel.close(tid, read_fid).expect("close read end");
        let result = kernel.write(tid, write_fid, b"x");
        tx.lock().unwrap().send(result.is_err()).unwrap();
        0
    });
    kernel.spawn_init(root, Vec::new()).expect("spawn root");

    assert!(recv_within(&rx, Duration::from_secs(2)));
    kernel.shutdown();
}

#[test]
fn socket_roundtrip_is_full_duplex() {
    let kernel = Kernel::new(fast_config());
    const PORT: u16 = 100;
    let (tx, rx) = channel::<(Vec<u8>, Vec<u8>)>();
    let tx = Mutex::new(tx);

    let server: Task = Arc::new(move |kernel, tid, _args| {
        let listener = kernel.socket(tid, Port::new(PORT)).expect("socket");
        kernel.listen(tid, listener).expect("listen");

        let client: Task = Arc::new(|kernel, tid, _args| {
            let sock = kernel.socket(tid, Port::new(0)).expect("socket");
            kernel.connect(tid, sock, Port::new(PORT), NO_TIMEOUT).expect("connect");
            kernel.write(tid, sock, b"HELLO").expect("write");
            kernel.shutdown_fid(tid, sock, ShutdownHow::Write).expect("shutdown write");
            let mut buf = [0u8; 16];
            let mut got = Vec::new();
            loop {
                let n = kernel.read(tid, sock, &mut buf).expect("read");
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(got, b"WORLD");
            kernel.close(tid, sock).expect("close");
            0
        });
        kernel.exec(tid, client, Vec::new()).expect("exec client");

        let peer = kernel.accept(tid, listener).expect("accept");
        let mut buf = [0u8; 16];
        let mut from_client = Vec::new();
        loop {
            let n = kernel.read(tid, peer, &mut buf).expect("read");
            if n == 0 {
                break;
            }
            from_client.extend_from_slice(&buf[..n]);
        }
        kernel.write(tid, peer, b"WORLD").expect("write");
        kernel.shutdown_fid(tid, peer, ShutdownHow::Write).expect("shutdown write");
        kernel.close(tid, peer).expect("close peer");
        kernel.close(tid, listener).expect("close listener");

        kernel.wait_child(tid, None).expect("wait for client");
        tx.lock().unwrap().send((from_client, b"WORLD".to_vec())).unwrap();
        0
    });
    kernel.spawn_init(server, Vec::new()).expect("spawn server");

    let (from_client, expected_echo) = recv_within(&rx, Duration::from_secs(5));
    assert_eq!(from_client, b"HELLO");
    assert_eq!(expected_echo, b"WORLD");
    kernel.shutdown();
}

#[test]
fn connect_with_no_listener_fails_immediately() {
    let kernel = Kernel::new(fast_config());
    let (tx, rx) = channel::<bool>();
    let tx = Mutex::new(tx);

    let root: Task = Arc::new(move |kernel, tid, _args| {
        let sock = kernel.socket(tid, Port::new(0)).expect("socket");
        let start = std::time::Instant::now();
        let result = kernel.connect(tid, sock, Port::new(200), NO_TIMEOUT);
        let fast = start.elapsed() < Duration::from_millis(200);
        tx.lock().unwrap().send(result.is_err() && fast).unwrap();
        0
    });
    kernel.spawn_init(root, Vec::new()).expect("spawn root");

    assert!(recv_within(&rx, Duration::from_secs(2)));
    kernel.shutdown();
}

#[test]
fn connect_with_listener_that_never_accepts_times_out() {
    let kernel = Kernel::new(fast_config());
    const PORT: u16 = 200;
    let (tx, rx) = channel::<bool>();
    let tx = Mutex::new(tx);

    let root: Task = Arc::new(move |kernel, tid, _args| {
        let listener = kernel.socket(tid, Port::new(PORT)).expect("socket");
        kernel.listen(tid, listener).expect("listen");
        // Deliberately never call accept(); the connecting thread must
        // give up on its own after the timeout elapses.
        let sock = kernel.socket(tid, Port::new(0)).expect("socket");
        let result = kernel.connect(tid, sock, Port::new(PORT), 5);
        tx.lock().unwrap().send(result.is_err()).unwrap();
        kernel.close(tid, listener).expect("close listener");
        0
    });
    kernel.spawn_init(root, Vec::new()).expect("spawn root");

    assert!(recv_within(&rx, Duration::from_secs(2)));
    kernel.shutdown();
}

#[test]
fn eight_threads_join_with_their_own_index_and_a_detached_ninth_cannot_be_joined() {
    let kernel = Kernel::new(fast_config());
    let (tx, rx) = channel::<(Vec<i32>, bool)>();
    let tx = Mutex::new(tx);

    let root: Task = Arc::new(move |kernel, tid, _args| {
        let mut tids = Vec::new();
        for i in 0..8i32 {
            let task: Task = Arc::new(move |_k, _tid, _args| i);
            tids.push(kernel.create_thread(tid, task, Vec::new()).expect("spawn"));
        }
        let mut results = Vec::new();
        for t in tids {
            results.push(kernel.thread_join(tid, t).expect("join"));
        }

        let ninth: Task = Arc::new(|_k, _tid, _args| 8);
        let ninth_tid = kernel.create_thread(tid, ninth, Vec::new()).expect("spawn ninth");
        kernel.thread_detach(tid, ninth_tid).expect("detach ninth");
        std::thread::sleep(Duration::from_millis(50));
        let join_after_detach_failed = kernel.thread_join(tid, ninth_tid).is_err();

        tx.lock().unwrap().send((results, join_after_detach_failed)).unwrap();
        0
    });
    kernel.spawn_init(root, Vec::new()).expect("spawn root");

    let (results, join_after_detach_failed) = recv_within(&rx, Duration::from_secs(2));
    assert_eq!(results, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    assert!(join_after_detach_failed);
    kernel.shutdown();
}

#[test]
fn detaching_an_already_detached_thread_fails() {
    let kernel = Kernel::new(fast_config());
    let (tx, rx) = channel::<(bool, bool)>();
    let tx = Mutex::new(tx);

    let root: Task = Arc::new(move |kernel, tid, _args| {
        let task: Task = Arc::new(|_k, _tid, _args| 0);
        let child = kernel.create_thread(tid, task, Vec::new()).expect("spawn");
        let first = kernel.thread_detach(tid, child).is_ok();
        let second = kernel.thread_detach(tid, child).is_err();
        tx.lock().unwrap().send((first, second)).unwrap();
        0
    });
    kernel.spawn_init(root, Vec::new()).expect("spawn root");

    let (first, second) = recv_within(&rx, Duration::from_secs(2));
    assert!(first, "first detach should succeed");
    assert!(second, "second detach on the same thread should fail");
    kernel.shutdown();
}

#[test]
fn cpu_bound_thread_is_demoted_and_io_bound_thread_is_promoted() {
    let kernel = Kernel::new(fast_config());
    let (tx, rx) = channel::<(usize, usize)>();
    let tx = Mutex::new(tx);
    let max_level = kernel.config().sched_max_level;

    let root: Task = Arc::new(move |kernel, tid, _args| {
        let cpu_bound: Task = Arc::new(|kernel, tid, _args| {
            let deadline = std::time::Instant::now() + Duration::from_millis(80);
            while std::time::Instant::now() < deadline {
                kernel.cooperative_checkpoint(tid);
                std::hint::black_box(0);
            }
            kernel.thread_priority(tid).unwrap_or(0) as i32
        });
        let cpu_tid = kernel.create_thread(tid, cpu_bound, Vec::new()).expect("spawn cpu");

        let io_bound: Task = Arc::new(|kernel, tid, _args| {
            let (read_fid, write_fid) = kernel.pipe(tid).expect("pipe");
            for i in 0u8..50 {
                kernel.write(tid, write_fid, &[i]).expect("write");
                let mut buf = [0u8; 1];
                kernel.read(tid, read_fid, &mut buf).expect("read");
            }
            kernel.close(tid, read_fid).expect("close");
            kernel.close(tid, write_fid).expect("close");
            kernel.thread_priority(tid).unwrap_or(999) as i32
        });
        let io_tid = kernel.create_thread(tid, io_bound, Vec::new()).expect("spawn io");

        let cpu_priority = kernel.thread_join(tid, cpu_tid).expect("join cpu") as usize;
        let io_priority = kernel.thread_join(tid, io_tid).expect("join io") as usize;
        tx.lock().unwrap().send((cpu_priority, io_priority)).unwrap();
        0
    });
    kernel.spawn_init(root, Vec::new()).expect("spawn root");

    let (cpu_priority, io_priority) = recv_within(&rx, Duration::from_secs(5));
    assert_eq!(cpu_priority, max_level - 1);
    assert_eq!(io_priority, 0);
    kernel.shutdown();
}
