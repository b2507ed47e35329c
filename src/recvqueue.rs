//! Per socket receive queue.
//!
//! A bounded set of packet slots plus a FIFO of the slots that hold a
//! complete packet. A recv pump claims a free slot, marks it locked while
//! the blocking OS read is in flight, and either commits the packet or
//! releases the slot again. Readers always take (or peek) the front of the
//! ready list.
//!
//! The queue is shared as `Arc<RecvQueue>`: the socket holds one reference
//! and every in-flight pump holds another, so a socket closed mid-pump does
//! not pull the buffers out from under the pump.

use std::sync::Mutex;

use packet::IPX_HEADER_SIZE;

/// Number of packets a socket can queue before the router starts dropping.
pub const RECV_QUEUE_MAX_PACKETS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Free,
    /// Claimed by an in-flight pump.
    Locked,
    /// Holds a complete wire packet.
    Ready(Vec<u8>),
}

struct Inner {
    slots: Vec<Slot>,
    /// Indices of `Ready` slots in the order they became ready.
    ready: Vec<usize>,
}

pub struct RecvQueue {
    inner: Mutex<Inner>,
}

impl RecvQueue {
    pub fn new() -> RecvQueue {
        RecvQueue {
            inner: Mutex::new(Inner {
                slots: vec![Slot::Free; RECV_QUEUE_MAX_PACKETS],
                ready: Vec::new(),
            }),
        }
    }

    /// Claims a free slot for an in-flight receive. Returns `None` when the
    /// queue is full, in which case the caller must not read a packet on
    /// this queue's behalf.
    pub fn claim(&self) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if *slot == Slot::Free {
                *slot = Slot::Locked;
                return Some(index);
            }
        }
        None
    }

    /// Stores a received packet in a previously claimed slot and appends it
    /// to the ready list.
    ///
    /// # Panics
    ///
    /// Panics if `slot` was not claimed.
    pub fn commit(&self, slot: usize, packet: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(inner.slots[slot], Slot::Locked);
        inner.slots[slot] = Slot::Ready(packet);
        inner.ready.push(slot);
    }

    /// Returns a previously claimed slot to the free state without storing
    /// anything, e.g. after a failed OS read.
    pub fn release(&self, slot: usize) {
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(inner.slots[slot], Slot::Locked);
        inner.slots[slot] = Slot::Free;
    }

    /// Takes the oldest ready packet off the queue. With `peek` the packet
    /// is cloned and the slot stays ready for the next read.
    pub fn pop(&self, peek: bool) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = match inner.ready.first() {
            Some(&slot) => slot,
            None => return None,
        };
        if peek {
            if let Slot::Ready(ref packet) = inner.slots[slot] {
                return Some(packet.clone());
            }
            unreachable!("ready list referenced a non-ready slot");
        }
        inner.ready.remove(0);
        match ::std::mem::replace(&mut inner.slots[slot], Slot::Free) {
            Slot::Ready(packet) => Some(packet),
            _ => unreachable!("ready list referenced a non-ready slot"),
        }
    }

    /// Number of packets ready to be read.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    /// Sum of the payload sizes of all ready packets, which is what the
    /// FIONREAD ioctl reports.
    pub fn ready_payload_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .ready
            .iter()
            .map(|&slot| match inner.slots[slot] {
                Slot::Ready(ref packet) => packet.len().saturating_sub(IPX_HEADER_SIZE),
                _ => 0,
            })
            .sum()
    }

    #[cfg(test)]
    fn check_consistency(&self) {
        let inner = self.inner.lock().unwrap();
        for (index, slot) in inner.slots.iter().enumerate() {
            let in_ready = inner.ready.contains(&index);
            match *slot {
                Slot::Ready(_) => assert!(in_ready),
                _ => assert!(!in_ready),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet::IPX_HEADER_SIZE;

    fn packet(payload_len: usize) -> Vec<u8> {
        vec![0u8; IPX_HEADER_SIZE + payload_len]
    }

    #[test]
    fn fifo_order() {
        let queue = RecvQueue::new();

        let a = queue.claim().unwrap();
        let b = queue.claim().unwrap();
        assert_ne!(a, b);

        // Commit in reverse claim order, reads follow commit order.
        queue.commit(b, packet(10));
        queue.commit(a, packet(20));
        queue.check_consistency();

        assert_eq!(queue.ready_len(), 2);
        assert_eq!(queue.pop(false).unwrap().len(), IPX_HEADER_SIZE + 10);
        assert_eq!(queue.pop(false).unwrap().len(), IPX_HEADER_SIZE + 20);
        assert_eq!(queue.pop(false), None);
        queue.check_consistency();
    }

    #[test]
    fn peek_leaves_packet() {
        let queue = RecvQueue::new();
        let slot = queue.claim().unwrap();
        queue.commit(slot, packet(5));

        assert!(queue.pop(true).is_some());
        assert_eq!(queue.ready_len(), 1);
        assert!(queue.pop(false).is_some());
        assert_eq!(queue.ready_len(), 0);
    }

    #[test]
    fn release_frees_slot() {
        let queue = RecvQueue::new();
        for _ in 0..3 {
            let slot = queue.claim().unwrap();
            queue.release(slot);
        }
        queue.check_consistency();
        assert_eq!(queue.ready_len(), 0);
    }

    #[test]
    fn claim_exhaustion() {
        let queue = RecvQueue::new();
        let mut slots = Vec::new();
        for _ in 0..RECV_QUEUE_MAX_PACKETS {
            slots.push(queue.claim().unwrap());
        }
        assert_eq!(queue.claim(), None);

        queue.release(slots.pop().unwrap());
        assert!(queue.claim().is_some());
    }

    #[test]
    fn payload_byte_accounting() {
        let queue = RecvQueue::new();
        for len in &[128usize, 256] {
            let slot = queue.claim().unwrap();
            queue.commit(slot, packet(*len));
        }
        assert_eq!(queue.ready_payload_bytes(), 384);

        queue.pop(false).unwrap();
        assert_eq!(queue.ready_payload_bytes(), 256);
        queue.pop(false).unwrap();
        assert_eq!(queue.ready_payload_bytes(), 0);
    }
}
