//! A small interactive tour of the kernel: boots it, execs a child that
//! echoes bytes through a pipe, then runs a socket client/server pair over
//! a listener port, printing what each step observed.
//!
//! Run with `RUST_LOG=debug` to see the scheduler's own logging.

use std::sync::Arc;
use std::time::Duration;

use tinykernel_core::config::KernelConfig;
use tinykernel_core::kernel::{Kernel, Task};
use tinykernel_core::ids::Port;

fn main() {
    let kernel = Kernel::new(KernelConfig::default());

    pipe_demo(&kernel);
    socket_demo(&kernel);

    kernel.shutdown();
    // Give the idle/ticker threads a moment to notice shutdown before the
    // process exits; nothing downstream depends on this, it's just so the
    // demo's output isn't interleaved with their exit.
    std::thread::sleep(Duration::from_millis(20));
}

fn pipe_demo(kernel: &Arc<Kernel>) {
    println!("--- pipe echo ---");
    let boot_task: Task = Arc::new(|kernel, tid, _args| {
        let (read_fid, write_fid) = kernel.pipe(tid).expect("pipe");

        let writer: Task = Arc::new(move |kernel, tid, _args| {
            for chunk in b"hello from the writer thread".chunks(4) {
                kernel.write(tid, write_fid, chunk).expect("write");
            }
            kernel.close(tid, write_fid).expect("close write end");
            0
        });
        let writer_tid = kernel.create_thread(tid, writer, Vec::new()).expect("spawn writer");

        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            let n = kernel.read(tid, read_fid, &mut buf).expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        kernel.thread_join(tid, writer_tid).expect("join writer");
        println!("child read back: {:?}", String::from_utf8_lossy(&out));
        0
    });

    // Nothing outside the kernel holds a `Tid`, so the demo's own `main`
    // thread cannot `wait_child` this process itself; give it a moment to
    // run instead.
    let _ = kernel.spawn_init(boot_task, Vec::new()).expect("exec");
    std::thread::sleep(Duration::from_millis(50));
}

fn socket_demo(kernel: &Arc<Kernel>) {
    println!("--- socket roundtrip ---");
    const PORT: u16 = 100;

    let server: Task = Arc::new(|kernel, tid, _args| {
        let listener = kernel.socket(tid, Port::new(PORT)).expect("socket");
        kernel.listen(tid, listener).expect("listen");

        let client: Task = Arc::new(|kernel, tid, _args| {
            let sock = kernel.socket(tid, Port::new(0)).expect("socket");
            kernel
                .connect(tid, sock, Port::new(PORT), tinykernel_core::ids::NO_TIMEOUT)
                .expect("connect");
            kernel.write(tid, sock, b"HELLO").expect("write");
            kernel.shutdown_fid(tid, sock, tinykernel_core::kernel::ShutdownHow::Write).expect("shutdown write");
            let mut buf = [0u8; 16];
            let n = kernel.read(tid, sock, &mut buf).expect("read");
            println!("client read: {:?}", String::from_utf8_lossy(&buf[..n]));
            kernel.close(tid, sock).expect("close");
            0
        });
        let client_tid = kernel
            .exec(tid, client, Vec::new())
            .expect("exec client process");

        let peer = kernel.accept(tid, listener).expect("accept");
        let mut buf = [0u8; 16];
        let n = kernel.read(tid, peer, &mut buf).expect("read");
        println!("server read: {:?}", String::from_utf8_lossy(&buf[..n]));
        kernel.write(tid, peer, b"WORLD").expect("write");
        kernel.close(tid, peer).expect("close");
        kernel.close(tid, listener).expect("close listener");

        let (_pid, status) = kernel.wait_child(tid, None).expect("wait for client");
        println!("client exited with {status}");
        let _ = client_tid;
        0
    });

    let _server_pid = kernel.spawn_init(server, Vec::new()).expect("exec server");
    std::thread::sleep(Duration::from_millis(50));
}
