//! Local TCP port reservations shared by every device on this provider.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

const MAX_ATTEMPTS: u32 = 10;
const BACKOFF_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no free port after {0} attempts")]
    Exhausted(u32),
}

#[derive(Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the OS for an ephemeral port and reserves it. A port another caller
    /// already holds is retried with a growing backoff.
    pub async fn get_free(&self) -> Result<u16, PortError> {
        for attempt in 1..=MAX_ATTEMPTS {
            if let Some(port) = probe_ephemeral() {
                if self.reserved.lock().insert(port) {
                    debug!(port, "port reserved");
                    return Ok(port);
                }
            }
            tokio::time::sleep(BACKOFF_STEP * attempt).await;
        }
        Err(PortError::Exhausted(MAX_ATTEMPTS))
    }

    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            debug!(port, "port released");
        }
    }

    pub fn release_all(&self, ports: impl IntoIterator<Item = u16>) {
        let mut reserved = self.reserved.lock();
        for port in ports {
            reserved.remove(&port);
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }
}

fn probe_ephemeral() -> Option<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).ok()?;
    listener.local_addr().ok().map(|addr| addr.port())
}
