use std::io;

use crate::InetAddress;

/// Fatal initialization failures.
///
/// These surface only from the handful of calls that can't sensibly
/// continue: creating the poller, arming a timer, or binding the
/// listening socket. Everything else funnels through [`io::Result`].
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("failed to create poller: {0}")]
    PollerInit(#[source] io::Error),

    #[error("failed to create timerfd: {0}")]
    TimerInit(#[source] io::Error),

    #[error("failed to create eventfd for loop wakeup: {0}")]
    WakeupInit(#[source] io::Error),

    #[error("failed to create a nonblocking socket: {0}")]
    SocketInit(#[source] io::Error),

    #[error("failed to bind listening socket to {addr}: {source}")]
    Bind {
        addr: InetAddress,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on socket: {0}")]
    Listen(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
