//! The async edge of the engine: mio-backed socket endpoints and the
//! single-threaded worker reactor that drives them. Everything above this
//! module is synchronous callbacks re-entered from the reactor.

pub mod socket;
pub mod worker;

use std::io;

/// Outcome shape for socket operations: `Wait` means try again on the next
/// readiness event, `Fatal` tears the connection down.
pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(crate::event::ErrorKind),
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> NetError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => NetError::Wait,
            io::ErrorKind::ConnectionRefused => {
                NetError::Fatal(crate::event::ErrorKind::ConnectionRefused)
            }
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                NetError::Fatal(crate::event::ErrorKind::ConnectionReset)
            }
            _ => NetError::Fatal(crate::event::ErrorKind::ReadError),
        }
    }
}
