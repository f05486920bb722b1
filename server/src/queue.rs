//! Mailbox between the network receive task and the simulation tick

use crate::session::SessionId;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

/// A datagram accepted by the transport, waiting for the simulation.
///
/// `data[0]` is the message type and the rest is the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPacket {
    pub session_id: SessionId,
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

impl PendingPacket {
    pub fn new(addr: SocketAddr, message_type: u8, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(message_type);
        data.extend_from_slice(payload);
        Self {
            session_id: SessionId::from_addr(addr),
            addr,
            data,
        }
    }

    pub fn message_type(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    pub fn payload(&self) -> &[u8] {
        self.data.get(1..).unwrap_or(&[])
    }
}

/// FIFO shared between producers and the single consumer. The lock is only
/// held for a push or a buffer swap.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<Vec<PendingPacket>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: PendingPacket) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet);
    }

    /// Swaps out everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<PendingPacket> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        mem::take(&mut *guard)
    }

    /// Like [`drain`](Self::drain) but reuses the caller's buffer.
    pub fn drain_into(&self, out: &mut Vec<PendingPacket>) {
        out.clear();
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        mem::swap(&mut *guard, out);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
