//! Reads and drops everything sent to it, logging byte counts. Useful
//! for load-testing a client against a server that does the least
//! possible amount of work per message.
//!
//! ```text
//! $ cargo run --example discard_server
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reactix::{EventLoop, InetAddress, TcpConnection, TcpServer};

fn main() -> io::Result<()> {
    env_logger::init();

    let mut event_loop = EventLoop::new().expect("failed to create the base EventLoop");
    let server =
        TcpServer::new(event_loop.handle(), InetAddress::new(9999)).expect("failed to bind");

    let total_bytes = Arc::new(AtomicU64::new(0));

    server.set_connection_callback(Arc::new(|conn: &TcpConnection| {
        if conn.connected() {
            println!("new connection from {}", conn.peer_addr());
        }
    }));

    let counted = total_bytes.clone();
    server.set_message_callback(Arc::new(
        move |_conn: &TcpConnection, buf: &mut reactix::Buffer, _recv_time| {
            let n = buf.readable_bytes();
            buf.retrieve(n);
            let so_far = counted.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
            println!("discarded {n} bytes ({so_far} total)");
        },
    ));

    server.start();

    println!("discard server listening on 0.0.0.0:9999");
    event_loop.run()
}
