//! End-to-end scenarios driving the crate purely through
//! `TcpServer`/`EventLoop`'s public API over real loopback sockets,
//! mirroring how `examples/tokio-rs-mio`'s own `tests/` directory
//! exercises `mio::Poll` rather than unit-testing `sys` internals in
//! place.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactix::{Buffer, EventLoop, EventLoopHandle, InetAddress, TcpConnection, TcpServer};

/// Spawns a `TcpServer` bound to an ephemeral loopback port on its own
/// base-loop thread, wires `on_message` as the message callback, and
/// returns the address to connect to plus a handle to shut the loop
/// down. The base loop keeps running until `handle.quit()` is called.
fn spawn_server(
    thread_num: usize,
    on_message: impl Fn(&TcpConnection, &mut Buffer, reactix::Timestamp) + Send + Sync + 'static,
) -> (InetAddress, EventLoopHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();

    let join = std::thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(event_loop.handle(), InetAddress::loopback(0)).unwrap();
        server.set_message_callback(Arc::new(on_message));
        server.set_thread_num(thread_num);
        server.start();

        let addr = server.local_addr().unwrap();
        tx.send((addr, event_loop.handle())).unwrap();
        event_loop.run().unwrap();
    });

    let (addr, handle) = rx.recv().unwrap();
    (addr, handle, join)
}

fn connect(addr: InetAddress) -> TcpStream {
    let stream = TcpStream::connect(addr.to_socket_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

#[test]
fn echoes_a_single_message() {
    let (addr, handle, join) = spawn_server(0, |conn, buf, _recv_time| {
        let data = buf.retrieve_as_bytes();
        conn.send(data);
    });

    let mut stream = connect(addr);
    stream.write_all(b"hello reactor").unwrap();

    let mut received = vec![0u8; b"hello reactor".len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"hello reactor");

    handle.quit();
    join.join().unwrap();
}

#[test]
fn echoes_a_large_message() {
    let (addr, handle, join) = spawn_server(0, |conn, buf, _recv_time| {
        let data = buf.retrieve_as_bytes();
        conn.send(data);
    });

    let payload = vec![0x5au8; 1024 * 1024];
    let mut stream = connect(addr);
    stream.write_all(&payload).unwrap();
    stream.flush().unwrap();

    let mut received = vec![0u8; payload.len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);

    handle.quit();
    join.join().unwrap();
}

/// Sends a 4 MiB burst the kernel socket buffers can't absorb in one
/// write, then reads it back from the other end in small chunks so the
/// server's output buffer is forced to queue behind `EWOULDBLOCK` and
/// drain gradually rather than completing in a single `send_in_loop`.
#[test]
fn backpressure_stalls_then_resumes() {
    let write_complete_count = Arc::new(AtomicUsize::new(0));
    let wcc = write_complete_count.clone();

    let (tx, rx) = std::sync::mpsc::channel();
    let join = std::thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(event_loop.handle(), InetAddress::loopback(0)).unwrap();
        server.set_message_callback(Arc::new(|conn: &TcpConnection, buf: &mut Buffer, _t| {
            let data = buf.retrieve_as_bytes();
            conn.send(data);
        }));
        server.set_write_complete_callback(Arc::new(move |_conn: &TcpConnection| {
            wcc.fetch_add(1, Ordering::SeqCst);
        }));
        server.start();

        let addr = server.local_addr().unwrap();
        tx.send((addr, event_loop.handle())).unwrap();
        event_loop.run().unwrap();
    });
    let (addr, handle): (InetAddress, EventLoopHandle) = rx.recv().unwrap();

    let mut stream = connect(addr);
    let payload = vec![0x7eu8; 4 * 1024 * 1024];

    let writer = {
        let mut write_half = stream.try_clone().unwrap();
        std::thread::spawn(move || {
            write_half.write_all(&payload).unwrap();
        })
    };

    let mut received = Vec::with_capacity(4 * 1024 * 1024);
    let mut chunk = [0u8; 64 * 1024];
    while received.len() < 4 * 1024 * 1024 {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before all bytes arrived");
        received.extend_from_slice(&chunk[..n]);
    }

    writer.join().unwrap();
    assert_eq!(received.len(), 4 * 1024 * 1024);
    assert!(received.iter().all(|&b| b == 0x7e));

    // The output buffer must have drained to empty at least once for a
    // transfer this size over a loopback socket with default buffers.
    assert!(write_complete_count.load(Ordering::SeqCst) > 0);

    handle.quit();
    join.join().unwrap();
}

#[test]
fn half_close_lets_pending_reads_finish() {
    let (addr, handle, join) = spawn_server(0, |conn, buf, _recv_time| {
        let data = buf.retrieve_as_bytes();
        conn.send(data);
    });

    let mut stream = connect(addr);
    stream.write_all(b"last message").unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    let mut received = vec![0u8; b"last message".len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"last message");

    // The server should now see EOF and close its side too.
    let mut tail = Vec::new();
    stream.read_to_end(&mut tail).unwrap();
    assert!(tail.is_empty());

    handle.quit();
    join.join().unwrap();
}

#[test]
fn multithreaded_pool_handles_many_connections() {
    const CONNECTIONS: usize = 100;
    const MESSAGES_PER_CONNECTION: usize = 100;

    let (addr, handle, join) = spawn_server(4, |conn, buf, _recv_time| {
        let data = buf.retrieve_as_bytes();
        conn.send(data);
    });

    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut clients = Vec::with_capacity(CONNECTIONS);

    for i in 0..CONNECTIONS {
        let errors = errors.clone();
        clients.push(std::thread::spawn(move || {
            use rand::Rng;
            let mut rng = rand::rng();
            let mut stream = connect(addr);
            for j in 0..MESSAGES_PER_CONNECTION {
                let padding: String = (0..rng.random_range(0..32)).map(|_| 'x').collect();
                let message = format!("conn{i}-msg{j}-{padding}");
                if let Err(e) = stream.write_all(message.as_bytes()) {
                    errors.lock().unwrap().push(format!("write: {e}"));
                    return;
                }
                let mut received = vec![0u8; message.len()];
                if let Err(e) = stream.read_exact(&mut received) {
                    errors.lock().unwrap().push(format!("read: {e}"));
                    return;
                }
                if received != message.as_bytes() {
                    errors.lock().unwrap().push(format!(
                        "mismatch: sent {message:?}, got {:?}",
                        String::from_utf8_lossy(&received)
                    ));
                }
            }
        }));
    }

    for client in clients {
        client.join().unwrap();
    }

    assert!(errors.lock().unwrap().is_empty(), "{:?}", errors.lock().unwrap());

    handle.quit();
    join.join().unwrap();
}

#[test]
fn run_every_fires_roughly_once_per_interval() {
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();

    let (tx, rx) = std::sync::mpsc::channel();
    let worker = std::thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.handle()).unwrap();
        event_loop.run().unwrap();
    });

    let handle: EventLoopHandle = rx.recv().unwrap();
    let id = handle.run_every(0.05, Box::new(move || {
        count2.fetch_add(1, Ordering::SeqCst);
    }));

    std::thread::sleep(Duration::from_millis(1010));
    handle.cancel(id);
    handle.quit();
    worker.join().unwrap();

    let ticks = count.load(Ordering::SeqCst);
    assert!((18..=22).contains(&ticks), "expected 18-22 ticks, got {ticks}");
}
