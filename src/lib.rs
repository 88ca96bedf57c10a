//! A one-loop-per-thread reactor and the TCP connection machinery built
//! on top of it: a nonblocking, level-triggered event dispatcher plus
//! the acceptor/connection/server plumbing that makes it useful for
//! embedding in a server application.
//!
//! Start with [`TcpServer`] and [`EventLoop`]. A server binds a listening
//! address on a base loop, optionally spreads accepted connections
//! across a pool of worker loops ([`TcpServer::set_thread_num`]), and
//! delivers [`TcpConnection`] handles to user callbacks for every byte
//! in and out.
//!
//! This crate is IPv4-only, imposes no framing on top of raw byte
//! streams, and targets Unix platforms with `poll(2)`, `eventfd(2)`, and
//! `timerfd(2)`.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod event_loop_pool;
pub mod event_loop_thread;
pub mod inet_addr;
pub mod poller;
pub mod server;
pub mod sockets;
pub mod tcp_connection;
pub mod timer;
pub mod timer_queue;
pub mod timestamp;

pub use buffer::Buffer;
pub use callbacks::{ConnectionCallback, MessageCallback, WriteCompleteCallback};
pub use error::{ReactorError, Result};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use event_loop_pool::EventLoopThreadPool;
pub use event_loop_thread::EventLoopThread;
pub use inet_addr::InetAddress;
pub use server::TcpServer;
pub use tcp_connection::{State as ConnectionState, TcpConnection};
pub use timer::TimerId;
pub use timestamp::Timestamp;
