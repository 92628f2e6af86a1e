//! Port probe channel.

use std::net::{IpAddr, SocketAddr};

use protocol::TerminalStatus;
use tokio::net::TcpListener;

/// Status reported when the port could be bound.
pub const PORT_AVAILABLE: TerminalStatus = TerminalStatus::Exited(0);

/// Status reported when the port could not be bound.
pub const PORT_UNAVAILABLE: TerminalStatus = TerminalStatus::Exited(1);

/// Check whether a TCP listener can bind `port` on `host`.
///
/// The listener is released before returning.
pub async fn probe_port(host: IpAddr, port: u16) -> TerminalStatus {
    let addr = SocketAddr::new(host, port);
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            tracing::info!(%addr, "Port is available");
            PORT_AVAILABLE
        }
        Err(e) => {
            tracing::info!(%addr, error = %e, "Port is unavailable");
            PORT_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_probe_busy_port() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert_eq!(probe_port(LOCALHOST, port).await, PORT_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_probe_free_port() {
        let port = {
            let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        assert_eq!(probe_port(LOCALHOST, port).await, PORT_AVAILABLE);
        // The probe released the port again.
        assert_eq!(probe_port(LOCALHOST, port).await, PORT_AVAILABLE);
    }
}
