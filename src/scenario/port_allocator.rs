use std::net::{Ipv4Addr, TcpListener};

use tracing::{debug, warn};

/// Used when the OS cannot hand out an ephemeral port.
const FALLBACK_BASE_PORT: u16 = 40000;

/// Hands out a fresh coordination port per scenario.
#[derive(Debug, Default)]
pub struct PortAllocator {
    allocated: u16,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds port 0 to let the OS pick a free port, then releases it.
    pub fn next_port(&mut self) -> u16 {
        self.allocated = self.allocated.wrapping_add(1);

        match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).and_then(|listener| listener.local_addr())
        {
            Ok(address) => {
                debug!("Allocated port {}", address.port());
                address.port()
            }
            Err(e) => {
                let port = FALLBACK_BASE_PORT.wrapping_add(self.allocated);
                warn!("Failed to discover a free port ({e}), falling back to {port}");
                port
            }
        }
    }
}
