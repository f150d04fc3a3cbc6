//! Free-port discovery
//!
//! Ports are found by binding a throwaway listener to port 0 and reading back
//! the number the OS picked. The listener is closed immediately, so another
//! process may grab the port before the child binds it.

use crate::error::PortError;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use tracing::debug;

/// Retries after the first probe before giving up
pub const MAX_PORT_ATTEMPTS: u32 = 100;

/// Bind to an OS-assigned port and return its number
pub fn probe_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Find a free port, retrying on "address in use"
pub fn allocate() -> Result<u16, PortError> {
    allocate_with(probe_free_port)
}

/// Run `probe` until it yields a port.
///
/// "Address in use" failures are retried up to [`MAX_PORT_ATTEMPTS`] times;
/// any other error is returned straight away.
pub fn allocate_with<F>(mut probe: F) -> Result<u16, PortError>
where
    F: FnMut() -> io::Result<u16>,
{
    let mut attempt = 0;
    loop {
        match probe() {
            Ok(port) => return Ok(port),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if attempt >= MAX_PORT_ATTEMPTS {
                    return Err(PortError::Exhausted {
                        attempts: attempt + 1,
                    });
                }
                debug!(attempt, "Probed port already in use, retrying");
                attempt += 1;
            }
            Err(e) => return Err(PortError::Io(e)),
        }
    }
}

/// Check whether something is already listening on `port`
pub fn is_taken(port: u16) -> io::Result<bool> {
    match TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))) {
        Ok(listener) => {
            drop(listener);
            Ok(false)
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_use() -> io::Error {
        io::Error::new(io::ErrorKind::AddrInUse, "address in use")
    }

    #[test]
    fn test_allocate_returns_usable_port() {
        let port = allocate().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn test_success_before_bound_returns_port() {
        let mut calls = 0;
        let result = allocate_with(|| {
            calls += 1;
            if calls <= 100 {
                Err(in_use())
            } else {
                Ok(4321)
            }
        });

        assert_eq!(result.unwrap(), 4321);
        assert_eq!(calls, 101);
    }

    #[test]
    fn test_exhausting_bound_is_error() {
        let mut calls = 0;
        let result = allocate_with(|| {
            calls += 1;
            Err(in_use())
        });

        assert!(matches!(result, Err(PortError::Exhausted { attempts: 101 })));
        assert_eq!(calls, 101);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut calls = 0;
        let result = allocate_with(|| {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        });

        match result {
            Err(PortError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_is_taken() {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_taken(port).unwrap());

        drop(listener);
        assert!(!is_taken(port).unwrap());
    }
}
