//! Echoes every message it receives back to the sender.
//!
//! ```text
//! $ cargo run --example echo_server
//! $ nc 127.0.0.1 13265
//! ```

use std::io;

use reactix::{EventLoop, InetAddress, TcpConnection, TcpServer};

fn main() -> io::Result<()> {
    env_logger::init();

    let mut event_loop = EventLoop::new().expect("failed to create the base EventLoop");
    let server =
        TcpServer::new(event_loop.handle(), InetAddress::new(13265)).expect("failed to bind");

    server.set_connection_callback(std::sync::Arc::new(|conn: &TcpConnection| {
        if conn.connected() {
            println!("new connection from {}", conn.peer_addr());
        } else {
            println!("connection {} closed", conn.name());
        }
    }));

    server.set_message_callback(std::sync::Arc::new(
        |conn: &TcpConnection, buf: &mut reactix::Buffer, _recv_time| {
            let message = buf.retrieve_as_bytes();
            conn.send(message);
        },
    ));

    // Hand off accepted connections to four worker loops instead of
    // servicing everything on the base loop.
    server.set_thread_num(4);
    server.start();

    println!("echo server listening on 0.0.0.0:13265 (4 worker loops)");
    event_loop.run()
}
