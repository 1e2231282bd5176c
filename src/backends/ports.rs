//! TCP port allocation for local workers.

use std::net::TcpListener;
use std::sync::Mutex;

use crate::core::SessionError;

/// How far above the base port the allocator will search.
const PORT_WINDOW: u16 = 1000;

/// Hands out free TCP ports with a monotonically advancing cursor.
///
/// Ports are never explicitly returned; the OS reclaims them when the worker
/// exits. The cursor only moves forward; exhausting the window is an error
/// the operator clears by restarting the control plane.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    cursor: Mutex<u16>,
}

impl PortAllocator {
    /// Create an allocator searching `[base, base + 1000)`.
    #[must_use]
    pub fn new(base: u16) -> Self {
        Self {
            base,
            cursor: Mutex::new(base),
        }
    }

    /// One past the last port of the window.
    fn end(&self) -> u16 {
        self.base.saturating_add(PORT_WINDOW)
    }

    /// Allocate the first bindable port at or above the cursor.
    pub fn allocate(&self) -> Result<u16, SessionError> {
        let mut cursor = match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let end = self.end();
        let mut candidate = *cursor;
        while candidate < end {
            if Self::is_port_available(candidate) {
                *cursor = candidate + 1;
                tracing::debug!(port = candidate, "allocated worker port");
                return Ok(candidate);
            }
            candidate += 1;
        }

        // Park the cursor at the end so later calls fail fast
        *cursor = end;
        Err(SessionError::NoPortAvailable {
            base: self.base,
            end,
        })
    }

    /// Probe availability by binding to the port.
    fn is_port_available(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}
