//! Scripted channel for testing the protocol engine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::traits::{FlashChannel, TransportError};

/// Mock channel: queued notifications, captured writes.
///
/// An empty queue behaves like a silent device: `recv` sleeps for the
/// full timeout and then reports it.
pub struct MockChannel {
    /// Notifications returned by `recv`, in order.
    replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
    /// Writes that succeed before every further write fails.
    writes_before_failure: Arc<Mutex<Option<usize>>>,
    /// Drop the link when the write with this first byte arrives.
    disconnect_on: Arc<Mutex<Option<u8>>>,
    device_id: String,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            writes_before_failure: Arc::new(Mutex::new(None)),
            disconnect_on: Arc::new(Mutex::new(None)),
            device_id: "mock".to_string(),
        }
    }

    /// Queue a notification.
    pub fn queue_reply(&self, bytes: &[u8]) {
        self.replies.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Queue the same notification `count` times.
    pub fn queue_replies(&self, bytes: &[u8], count: usize) {
        for _ in 0..count {
            self.queue_reply(bytes);
        }
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// First byte of every captured write.
    pub fn opcodes(&self) -> Vec<u8> {
        self.get_writes()
            .iter()
            .filter_map(|w| w.first().copied())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Let `count` more writes succeed, then fail all later ones.
    pub fn fail_writes_after(&self, count: usize) {
        *self.writes_before_failure.lock().unwrap() = Some(count);
    }

    /// Disconnect as soon as a command with this opcode is written.
    pub fn disconnect_on(&self, opcode: u8) {
        *self.disconnect_on.lock().unwrap() = Some(opcode);
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashChannel for MockChannel {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        {
            let mut budget = self.writes_before_failure.lock().unwrap();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(TransportError::WriteFailed("injected failure".into()));
                }
                *remaining -= 1;
            }
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        let trigger = *self.disconnect_on.lock().unwrap();
        if trigger.is_some() && trigger == data.first().copied() {
            self.disconnect();
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return Ok(reply);
        }
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        thread::sleep(timeout);
        Err(TransportError::timeout(timeout))
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn reconnect(&self, _timeout: Duration) -> Result<(), TransportError> {
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}
