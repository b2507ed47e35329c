//! Outbound packet coalescing for the DOSBox carrier.
//!
//! Applications hammering `send_to` with tiny packets flood the relay with
//! datagrams. Per destination, the coalescer watches the timestamps of the
//! most recent sends and, while the rate stays above a threshold, merges the
//! already serialised IPX packets into one outer packet whose type is
//! `IPX_MAGIC_COALESCED`. A buffer is flushed when it would overflow and in
//! any case within `COALESCE_MAX_DELAY` of its first packet.
//!
//! The state machine is pure: callers pass in the clock and transmit the
//! returned datagrams themselves.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use addr::{Addr32, Addr48, IpxAddr};
use packet::{IpxHeader, IPX_HEADER_SIZE, IPX_MAGIC_COALESCED};

/// How many send timestamps are tracked per destination.
pub const COALESCE_TRACK_COUNT: usize = 512;

/// Start coalescing when `COALESCE_TRACK_COUNT` sends to one destination
/// happened within this window.
pub const COALESCE_START_THRESH: Duration = Duration::from_micros(2_500_000);

/// Stop coalescing when the tracked sends stretch over more than this.
pub const COALESCE_STOP_THRESH: Duration = Duration::from_micros(10_000_000);

/// A buffered packet never waits longer than this.
pub const COALESCE_MAX_DELAY: Duration = Duration::from_micros(20_000);

/// Upper bound for the outer packet.
pub const COALESCE_MAX_SIZE: usize = 1384;

struct CoalesceDest {
    active: bool,
    send_times: Vec<Instant>,
    buffer: Vec<u8>,
    buffer_since: Option<Instant>,
}

impl CoalesceDest {
    fn new() -> CoalesceDest {
        CoalesceDest {
            active: false,
            send_times: Vec::new(),
            buffer: Vec::new(),
            buffer_since: None,
        }
    }

    /// Records a send and decides whether it should be coalesced.
    fn register_send(&mut self, now: Instant) -> bool {
        self.send_times.push(now);
        if self.send_times.len() > COALESCE_TRACK_COUNT {
            self.send_times.remove(0);
        }

        if self.send_times.len() == COALESCE_TRACK_COUNT {
            let oldest = self.send_times[0];
            if now.duration_since(oldest) <= COALESCE_START_THRESH {
                return true;
            }
            if self.active && now.duration_since(oldest) > COALESCE_STOP_THRESH {
                return false;
            }
        }
        self.active && self.send_times.len() == COALESCE_TRACK_COUNT
    }

    fn start_buffer(&mut self, dest: IpxAddr, local: (Addr32, Addr48), now: Instant) {
        let header = IpxHeader {
            length: 0, // patched at flush
            ptype: IPX_MAGIC_COALESCED,
            dest: IpxAddr::new(dest.net, dest.node, 0),
            src: IpxAddr::new(local.0, local.1, 0),
        };
        self.buffer = vec![0u8; IPX_HEADER_SIZE];
        header.write(&mut self.buffer);
        self.buffer_since = Some(now);
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        let mut buffer = ::std::mem::replace(&mut self.buffer, Vec::new());
        let length = buffer.len() as u16;
        buffer[2] = (length >> 8) as u8;
        buffer[3] = length as u8;
        self.buffer_since = None;
        buffer
    }

    fn buffer_expired(&self, now: Instant) -> bool {
        match self.buffer_since {
            Some(since) => now.duration_since(since) >= COALESCE_MAX_DELAY,
            None => false,
        }
    }
}

pub struct Coalescer {
    table: HashMap<IpxAddr, CoalesceDest>,
    /// Destinations with buffered data, oldest buffer first.
    pending: Vec<IpxAddr>,
}

impl Coalescer {
    pub fn new() -> Coalescer {
        Coalescer {
            table: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn unpend(&mut self, dest: &IpxAddr) {
        self.pending.retain(|d| d != dest);
    }

    /// Offers one already serialised IPX packet for `dest`. Returns the
    /// datagrams that must go out to the relay now, in order. When the send
    /// rate is below the threshold that is simply `packet` itself.
    pub fn send(
        &mut self,
        packet: &[u8],
        dest: IpxAddr,
        local: (Addr32, Addr48),
        now: Instant,
    ) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut queued = false;

        {
            let entry = self
                .table
                .entry(dest)
                .or_insert_with(CoalesceDest::new);

            let should_coalesce = entry.register_send(now);

            if should_coalesce && !entry.active {
                warn!("High send rate to {} detected, coalescing future packets", dest);
                entry.active = true;
            } else if !should_coalesce && entry.active {
                info!("Send rate to {} has dropped, no longer coalescing packets", dest);
                entry.active = false;
            }

            if should_coalesce
                && entry.buffer.len() + packet.len() > COALESCE_MAX_SIZE
                && packet.len() < COALESCE_MAX_SIZE / 2
            {
                if !entry.buffer.is_empty() {
                    out.push(entry.take_buffer());
                }
            }

            if should_coalesce {
                if entry.buffer.is_empty() {
                    if IPX_HEADER_SIZE + packet.len() <= COALESCE_MAX_SIZE {
                        entry.start_buffer(dest, local, now);
                    }
                }
                if !entry.buffer.is_empty()
                    && entry.buffer.len() + packet.len() <= COALESCE_MAX_SIZE
                {
                    entry.buffer.extend_from_slice(packet);
                    queued = true;
                }
            }

            if !queued {
                out.push(packet.to_vec());
            }

            if !entry.buffer.is_empty() && entry.buffer_expired(now) {
                out.push(entry.take_buffer());
            }
        }

        // Keep the pending list in step with the buffer states.
        self.unpend(&dest);
        if self
            .table
            .get(&dest)
            .map(|entry| entry.buffer_since.is_some())
            .unwrap_or(false)
        {
            self.pending.push(dest);
        }

        out
    }

    /// Flushes every buffer older than `COALESCE_MAX_DELAY`. The background
    /// sweep calls this; it is also the path that drains buffers when the
    /// application goes quiet.
    pub fn flush_waiting(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut flushed = Vec::new();

        for dest in &self.pending {
            if let Some(entry) = self.table.get_mut(dest) {
                if entry.buffer_expired(now) {
                    out.push(entry.take_buffer());
                    flushed.push(*dest);
                }
            }
        }
        self.pending.retain(|dest| !flushed.contains(dest));
        out
    }

    /// Flushes everything unconditionally, used at shutdown.
    pub fn flush_all(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for dest in ::std::mem::replace(&mut self.pending, Vec::new()) {
            if let Some(entry) = self.table.get_mut(&dest) {
                if !entry.buffer.is_empty() {
                    out.push(entry.take_buffer());
                }
            }
        }
        out
    }

    /// Whether any buffer is waiting to be flushed.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
