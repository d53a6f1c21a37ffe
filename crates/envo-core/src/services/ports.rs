use std::net::{TcpListener, UdpSocket};

use crate::error::{OrchestratorError, Result};
use crate::models::{PortBinding, Protocol};

/// Refuse to launch when a host port this service binds is already taken.
pub fn ensure_host_ports_free(service: &str, ports: &[PortBinding]) -> Result<()> {
    for binding in ports {
        if let Err(e) = try_bind(binding) {
            return Err(OrchestratorError::StartFailed {
                service: service.to_string(),
                reason: format!(
                    "host port {}/{} address already in use ({e})",
                    binding.host, binding.protocol
                ),
            });
        }
    }
    Ok(())
}

fn bind_address(binding: &PortBinding) -> String {
    let ip = binding.host_ip.as_deref().unwrap_or("0.0.0.0");
    format!("{ip}:{}", binding.host)
}

fn try_bind(binding: &PortBinding) -> std::io::Result<()> {
    let address = bind_address(binding);
    match binding.protocol {
        Protocol::Tcp => TcpListener::bind(&address).map(drop),
        Protocol::Udp => UdpSocket::bind(&address).map(drop),
    }
}

/// Whether something accepts TCP connections on `host:port`.
pub async fn tcp_reachable(host: &str, port: u16) -> bool {
    tokio::net::TcpStream::connect((host, port)).await.is_ok()
}
