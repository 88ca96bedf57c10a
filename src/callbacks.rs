//! Type aliases for the callbacks user code hands to [`crate::server::TcpServer`]
//! and [`crate::tcp_connection::TcpConnection`]. Grounded on
//! `examples/original_source/src/include/callbacks.h`.
//!
//! These are `Fn`, not `FnMut`: every invocation happens on the callback's
//! owning loop thread (spec §8 invariant 3), so there's never concurrent
//! re-entry to guard against, but the type is still shared (`Arc`-cloned
//! into posted tasks) rather than uniquely owned.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

/// Fired once when a connection is established and once more on
/// disconnection; discriminate with [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

/// Fired when the input buffer has new bytes. The callback drains
/// whatever it wants from `buf` via its `retrieve*` family.
pub type MessageCallback = Arc<dyn Fn(&TcpConnection, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired when the output buffer has fully drained after having been
/// non-empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

/// Internal only — wired by `TcpServer` to `removeConnection`, never
/// exposed to user code (spec §6.1).
pub(crate) type CloseCallback = Arc<dyn Fn(TcpConnection) + Send + Sync>;
