//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//! The same pair of windows is kept for the connection and for each stream:
//! the send window limits our DATA, the receive window tracks the peer's
//! DATA and decides when to hand credit back with WINDOW_UPDATE.

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Flow control window
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    /// Can go negative after SETTINGS shrinks the initial size
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Bytes that can be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Take up to `amount` bytes of capacity; returns what was granted
    pub fn consume(&mut self, amount: usize) -> usize {
        let granted = amount.min(self.available());
        self.current_size -= granted as i64;
        granted
    }

    /// Increase window size (WINDOW_UPDATE)
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol(
                "WINDOW_UPDATE increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Record `amount` bytes received against this window
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.current_size {
            return Err(Error::FlowControl(format!(
                "Received {} bytes with only {} bytes of window",
                amount, self.current_size
            )));
        }
        self.current_size -= amount as i64;
        Ok(())
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE, shifting the window by
    /// the difference
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }

    /// Increment to send once less than half the window is left
    pub fn pending_update(&self) -> Option<u32> {
        let initial = self.initial_size as i64;
        if self.current_size < initial / 2 {
            Some((initial - self.current_size) as u32)
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Send and receive windows for the connection or one stream
#[derive(Debug, Clone, Default)]
pub struct FlowControl {
    send: FlowControlWindow,
    recv: FlowControlWindow,
}

impl FlowControl {
    pub fn new(send_size: u32, recv_size: u32) -> Self {
        FlowControl {
            send: FlowControlWindow::with_initial_size(send_size),
            recv: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send
    }

    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv
    }

    /// Capacity available for outbound DATA
    pub fn send_available(&self) -> usize {
        self.send.available()
    }

    pub fn consume_send(&mut self, amount: usize) -> usize {
        self.send.consume(amount)
    }

    /// Peer granted more send capacity
    pub fn on_window_update(&mut self, increment: u32) -> Result<i64> {
        self.send.increase(increment)
    }

    /// Peer sent DATA
    pub fn on_data(&mut self, amount: usize) -> Result<()> {
        self.recv.receive(amount)
    }

    /// Take the WINDOW_UPDATE increment that is due, crediting the
    /// receive window as if it had already been sent
    pub fn take_recv_update(&mut self) -> Result<Option<u32>> {
        match self.recv.pending_update() {
            Some(increment) if increment > 0 => {
                self.recv.increase(increment)?;
                Ok(Some(increment))
            }
            _ => Ok(None),
        }
    }
}
