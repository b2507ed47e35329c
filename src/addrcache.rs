//! Destination address learning.
//!
//! The router records which IP endpoint every IPX source address was last
//! heard from, so that the send path can unicast instead of broadcasting
//! once a peer has replied. Entries expire after a short TTL and are not
//! otherwise evicted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use addr::{Addr32, Addr48};

/// How long a learned endpoint stays valid.
pub const ADDR_CACHE_TTL: Duration = Duration::from_secs(30);

/// Map of `(net, node)` to the last observed IP endpoint.
///
/// The socket number is accepted in the `set` and `get` signatures so a
/// future version can keep per socket entries, but it does not participate
/// in the key.
pub struct AddrCache {
    map: HashMap<(Addr32, Addr48), (Instant, SocketAddr)>,
    ttl: Duration,
}

impl AddrCache {
    pub fn new() -> AddrCache {
        AddrCache::with_ttl(ADDR_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> AddrCache {
        AddrCache {
            map: HashMap::new(),
            ttl: ttl,
        }
    }

    /// The best endpoint to reach `(net, node)`, if one was learned within
    /// the TTL.
    pub fn get(&self, net: Addr32, node: Addr48, _socket: u16) -> Option<SocketAddr> {
        match self.map.get(&(net, node)) {
            Some(&(stamp, addr)) if stamp.elapsed() <= self.ttl => Some(addr),
            _ => None,
        }
    }

    /// Inserts or refreshes the endpoint for `(net, node)`. Last write wins.
    pub fn set(&mut self, endpoint: SocketAddr, net: Addr32, node: Addr48, _socket: u16) {
        self.map.insert((net, node), (Instant::now(), endpoint));
    }
}

impl Default for AddrCache {
    fn default() -> AddrCache {
        AddrCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::thread::sleep;
    use std::time::Duration;

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port))
    }

    #[test]
    fn miss_on_empty() {
        let cache = AddrCache::new();
        assert_eq!(cache.get(Addr32::from(1), Addr48::from(2), 0), None);
    }

    #[test]
    fn set_then_get() {
        let mut cache = AddrCache::new();
        cache.set(endpoint(100), Addr32::from(1), Addr48::from(2), 4567);

        assert_eq!(
            cache.get(Addr32::from(1), Addr48::from(2), 4567),
            Some(endpoint(100))
        );
        // The socket number is not part of the key.
        assert_eq!(
            cache.get(Addr32::from(1), Addr48::from(2), 9999),
            Some(endpoint(100))
        );
        assert_eq!(cache.get(Addr32::from(1), Addr48::from(3), 4567), None);
    }

    #[test]
    fn last_write_wins() {
        let mut cache = AddrCache::new();
        cache.set(endpoint(100), Addr32::from(1), Addr48::from(2), 0);
        cache.set(endpoint(200), Addr32::from(1), Addr48::from(2), 0);
        assert_eq!(
            cache.get(Addr32::from(1), Addr48::from(2), 0),
            Some(endpoint(200))
        );
    }

    #[test]
    fn entries_expire() {
        let mut cache = AddrCache::with_ttl(Duration::from_millis(20));
        cache.set(endpoint(100), Addr32::from(1), Addr48::from(2), 0);
        assert!(cache.get(Addr32::from(1), Addr48::from(2), 0).is_some());

        sleep(Duration::from_millis(40));
        assert_eq!(cache.get(Addr32::from(1), Addr48::from(2), 0), None);
    }
}
