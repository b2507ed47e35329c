//! The semantic "IPX interface" table.
//!
//! An IPX interface pairs a network/node address with the IP bindings that
//! back it. The cache rebuilds itself from host interface enumeration when
//! it is older than `INTERFACE_CACHE_TTL` or when a reload is forced, except
//! under the Ethernet carrier where the set is fixed at startup, and under
//! the DOSBox carrier where the single interface mirrors whatever address
//! the relay assigned.
//!
//! Readers get snapshot copies, writers hold the internal lock only for the
//! swap.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ipnetwork::{IpNetwork, Ipv4Network};
use pnet::datalink;

use addr::{Addr32, Addr48};
use config::{ConfigStore, EncapType, WILDCARD_IFACE_HWADDR};

/// How long a cached interface list stays fresh.
pub const INTERFACE_CACHE_TTL: Duration = Duration::from_secs(5);

/// One IP address under which an IPX interface can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpxBinding {
    pub ipaddr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub bcast: Ipv4Addr,
}

impl IpxBinding {
    /// Whether `ip` falls in this binding's subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.ipaddr) & mask == u32::from(ip) & mask
    }
}

/// A local virtual IPX endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpxInterface {
    pub net: Addr32,
    pub node: Addr48,
    pub bindings: Vec<IpxBinding>,
    /// Hardware address of the backing card, for the Ethernet carrier. The
    /// capture handle itself lives with the router, keyed by this node.
    pub mac: Option<Addr48>,
}

impl IpxInterface {
    /// Whether a bind request for `(net, node)` resolves to this interface.
    /// Zero fields are wildcards.
    pub fn matches_bind(&self, net: Addr32, node: Addr48) -> bool {
        (net == self.net || net.is_zero()) && (node == self.node || node.is_zero())
    }
}

/// Connection state of the DOSBox carrier, shared between the router (which
/// drives the registration handshake), the interface cache and the socket
/// layer (which blocks ordinarily non-blocking calls until registration
/// finishes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DosboxState {
    Disconnected,
    Registering,
    Connected,
}

pub struct DosboxShared {
    inner: Mutex<DosboxInner>,
    cond: Condvar,
}

struct DosboxInner {
    state: DosboxState,
    net: Addr32,
    node: Addr48,
}

impl DosboxShared {
    pub fn new() -> DosboxShared {
        DosboxShared {
            inner: Mutex::new(DosboxInner {
                state: DosboxState::Disconnected,
                net: Addr32::ZERO,
                node: Addr48::ZERO,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> DosboxState {
        self.inner.lock().unwrap().state
    }

    pub fn set_registering(&self) {
        self.inner.lock().unwrap().state = DosboxState::Registering;
    }

    pub fn set_connected(&self, net: Addr32, node: Addr48) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = DosboxState::Connected;
        inner.net = net;
        inner.node = node;
        self.cond.notify_all();
    }

    /// The `(net, node)` the relay assigned, once connected.
    pub fn assigned(&self) -> Option<(Addr32, Addr48)> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            DosboxState::Connected => Some((inner.net, inner.node)),
            _ => None,
        }
    }

    /// Blocks until the relay registration completes, up to `timeout`.
    /// Returns whether the carrier is ready.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.state != DosboxState::Connected {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        true
    }
}

/// A host interface as seen by enumeration, decoupled from `pnet` so the
/// interface building logic can be driven by tests.
#[derive(Debug, Clone)]
pub struct HostIface {
    pub mac: Option<Addr48>,
    pub addrs: Vec<Ipv4Network>,
}

fn gather_host_interfaces() -> Vec<HostIface> {
    datalink::interfaces()
        .into_iter()
        .map(|iface| HostIface {
            mac: iface
                .mac
                .map(|mac| Addr48::from_wire(&mac.octets())),
            addrs: iface
                .ips
                .iter()
                .filter_map(|net| match *net {
                    IpNetwork::V4(v4) if !v4.ip().is_unspecified() => Some(v4),
                    _ => None,
                })
                .collect(),
        })
        .collect()
}

/// Non-default routes of the host, used only for the point-to-point netmask
/// workaround below.
#[cfg(target_os = "linux")]
fn gather_routes() -> Vec<Ipv4Network> {
    let file = match File::open("/proc/net/route") {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };

    let mut routes = Vec::new();
    for line in BufReader::new(file).lines().skip(1) {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let dest = match u32::from_str_radix(fields[1], 16) {
            Ok(v) => Ipv4Addr::from(v.swap_bytes()),
            Err(_) => continue,
        };
        let mask = match u32::from_str_radix(fields[7], 16) {
            Ok(v) => Ipv4Addr::from(v.swap_bytes()),
            Err(_) => continue,
        };
        if let Ok(net) = Ipv4Network::with_netmask(dest, mask) {
            routes.push(net);
        }
    }
    routes
}

#[cfg(not(target_os = "linux"))]
fn gather_routes() -> Vec<Ipv4Network> {
    Vec::new()
}

/// Turns one enumerated address into a binding.
///
/// A point-to-point link has a netmask of 255.255.255.255 which is useless
/// for calculating a broadcast address, so the most specific non-default
/// route containing the address donates its netmask instead.
fn binding_from_network(net: Ipv4Network, routes: &[Ipv4Network]) -> IpxBinding {
    let ip = net.ip();
    let mut mask = net.mask();

    if mask == Ipv4Addr::BROADCAST {
        let mut best_prefix = 0;
        for route in routes {
            if route.prefix() > 0
                && route.prefix() < 32
                && route.contains(ip)
                && route.prefix() > best_prefix
            {
                best_prefix = route.prefix();
                mask = route.mask();
            }
        }
    }

    IpxBinding {
        ipaddr: ip,
        netmask: mask,
        bcast: Ipv4Addr::from(u32::from(ip) | !u32::from(mask)),
    }
}

/// Builds the interface list for the IPX over UDP carrier: the wildcard
/// interface aggregating every IP broadcast domain, then one interface per
/// enabled host interface. The primary interface, when configured, goes
/// first.
fn build_udp_interfaces(
    host: &[HostIface],
    routes: &[Ipv4Network],
    store: &dyn ConfigStore,
    local_node: Addr48,
) -> Vec<IpxInterface> {
    let mut list = Vec::new();

    let wc_config = store.iface_config(WILDCARD_IFACE_HWADDR);
    let mut wildcard = if wc_config.enabled {
        let node = if wc_config.nodenum.is_zero() {
            local_node
        } else {
            wc_config.nodenum
        };
        Some(IpxInterface {
            net: wc_config.netnum,
            node: node,
            bindings: Vec::new(),
            mac: None,
        })
    } else {
        None
    };

    let primary = store.primary_iface();

    for iface in host {
        let bindings: Vec<IpxBinding> = iface
            .addrs
            .iter()
            .map(|net| binding_from_network(*net, routes))
            .collect();

        if let Some(ref mut wildcard) = wildcard {
            wildcard.bindings.extend(bindings.iter().cloned());
        }

        let hwaddr = match iface.mac {
            Some(mac) if !mac.is_zero() => mac,
            _ => continue,
        };

        let config = store.iface_config(hwaddr);
        if !config.enabled {
            continue;
        }

        let node = if config.nodenum.is_zero() {
            hwaddr
        } else {
            config.nodenum
        };
        let entry = IpxInterface {
            net: config.netnum,
            node: node,
            bindings: bindings,
            mac: Some(hwaddr),
        };

        if primary == Some(hwaddr) {
            list.insert(0, entry);
        } else {
            list.push(entry);
        }
    }

    if let Some(wildcard) = wildcard {
        // The wildcard leads the list unless a primary interface was
        // configured, which keeps its spot at the front.
        let at = match (list.first().and_then(|iface| iface.mac), primary) {
            (Some(mac), Some(primary_mac)) if mac == primary_mac => 1,
            _ => 0,
        };
        list.insert(at, wildcard);
    }

    list
}

struct CacheInner {
    list: Vec<IpxInterface>,
    ctime: Option<Instant>,
    /// Set under the Ethernet carrier, where the list is built once at
    /// startup and survives for the lifetime of the stack.
    fixed: bool,
}

type HostProvider = Box<dyn Fn() -> Vec<HostIface> + Send + Sync>;
type RouteProvider = Box<dyn Fn() -> Vec<Ipv4Network> + Send + Sync>;

pub struct InterfaceCache {
    encap: EncapType,
    store: Arc<dyn ConfigStore>,
    dosbox: Arc<DosboxShared>,
    local_node: Addr48,
    hosts: HostProvider,
    routes: RouteProvider,
    inner: Mutex<CacheInner>,
}

impl InterfaceCache {
    pub fn new(
        encap: EncapType,
        store: Arc<dyn ConfigStore>,
        dosbox: Arc<DosboxShared>,
    ) -> InterfaceCache {
        InterfaceCache::with_providers(
            encap,
            store,
            dosbox,
            Box::new(gather_host_interfaces),
            Box::new(gather_routes),
        )
    }

    pub(crate) fn with_providers(
        encap: EncapType,
        store: Arc<dyn ConfigStore>,
        dosbox: Arc<DosboxShared>,
        hosts: HostProvider,
        routes: RouteProvider,
    ) -> InterfaceCache {
        let local_node = match store.local_node() {
            Some(node) => node,
            None => {
                let node = Addr48::random();
                store.set_local_node(node);
                info!("Generated local node number {}", node);
                node
            }
        };

        InterfaceCache {
            encap: encap,
            store: store,
            dosbox: dosbox,
            local_node: local_node,
            hosts: hosts,
            routes: routes,
            inner: Mutex::new(CacheInner {
                list: Vec::new(),
                ctime: None,
                fixed: false,
            }),
        }
    }

    /// The locally administered node number backing the wildcard interface.
    pub fn local_node(&self) -> Addr48 {
        self.local_node
    }

    /// Installs the interface list built at startup by the Ethernet
    /// carrier. The cache never refreshes past this.
    pub(crate) fn install_fixed(&self, list: Vec<IpxInterface>) {
        let mut inner = self.inner.lock().unwrap();
        inner.list = list;
        inner.ctime = Some(Instant::now());
        inner.fixed = true;
    }

    fn renew(&self, inner: &mut CacheInner, force: bool) {
        if inner.fixed {
            return;
        }
        let expired = match inner.ctime {
            Some(ctime) => ctime.elapsed() > INTERFACE_CACHE_TTL,
            None => true,
        };
        if !force && !expired {
            return;
        }

        inner.list = match self.encap {
            EncapType::Pcap => return,
            EncapType::DosBox => match self.dosbox.assigned() {
                Some((net, node)) => vec![IpxInterface {
                    net: net,
                    node: node,
                    bindings: Vec::new(),
                    mac: None,
                }],
                None => Vec::new(),
            },
            EncapType::IpxWrapper => {
                let host = (self.hosts)();
                let routes = (self.routes)();
                build_udp_interfaces(&host, &routes, &*self.store, self.local_node)
            }
        };
        inner.ctime = Some(Instant::now());
    }

    /// Flushes and repopulates the cache, e.g. on a topology event or when
    /// the relay assigns an address.
    pub fn reload(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.renew(&mut inner, true);
    }

    /// Snapshot of the interface list, primary first.
    pub fn list(&self) -> Vec<IpxInterface> {
        let mut inner = self.inner.lock().unwrap();
        self.renew(&mut inner, false);
        inner.list.clone()
    }

    /// Exact lookup by IPX address.
    pub fn by_addr(&self, net: Addr32, node: Addr48) -> Option<IpxInterface> {
        let mut inner = self.inner.lock().unwrap();
        self.renew(&mut inner, false);
        inner
            .list
            .iter()
            .find(|iface| iface.net == net && iface.node == node)
            .cloned()
    }

    /// First interface with a binding whose subnet contains `ip`.
    pub fn by_subnet(&self, ip: Ipv4Addr) -> Option<IpxInterface> {
        let mut inner = self.inner.lock().unwrap();
        self.renew(&mut inner, false);
        inner
            .list
            .iter()
            .find(|iface| iface.bindings.iter().any(|binding| binding.contains(ip)))
            .cloned()
    }

    pub fn by_index(&self, index: usize) -> Option<IpxInterface> {
        let mut inner = self.inner.lock().unwrap();
        self.renew(&mut inner, false);
        inner.list.get(index).cloned()
    }

    pub fn count(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        self.renew(&mut inner, false);
        inner.list.len()
    }

    /// Resolves a bind request, treating zero network or node numbers as
    /// wildcards. The first matching interface wins.
    pub fn resolve_bind(&self, net: Addr32, node: Addr48) -> Option<(Addr32, Addr48)> {
        let mut inner = self.inner.lock().unwrap();
        self.renew(&mut inner, false);
        inner
            .list
            .iter()
            .find(|iface| iface.matches_bind(net, node))
            .map(|iface| (iface.net, iface.node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{IfaceConfig, MemoryConfigStore};
    use std::sync::Arc;

    fn v4(net: &str) -> Ipv4Network {
        net.parse().unwrap()
    }

    fn store() -> MemoryConfigStore {
        MemoryConfigStore::new()
    }

    fn host(mac: u64, addrs: &[&str]) -> HostIface {
        HostIface {
            mac: Some(Addr48::from(mac)),
            addrs: addrs.iter().map(|s| v4(s)).collect(),
        }
    }

    #[test]
    fn binding_subnet_match() {
        let binding = binding_from_network(v4("192.168.1.10/24"), &[]);
        assert_eq!(binding.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(binding.bcast, Ipv4Addr::new(192, 168, 1, 255));
        assert!(binding.contains(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!binding.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[test]
    fn point_to_point_adopts_route_netmask() {
        let routes = [v4("0.0.0.0/0"), v4("10.5.0.0/16"), v4("10.5.1.0/24")];
        let binding = binding_from_network(v4("10.5.1.2/32"), &routes);
        assert_eq!(binding.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(binding.bcast, Ipv4Addr::new(10, 5, 1, 255));
    }

    #[test]
    fn point_to_point_without_route_stays_host() {
        let binding = binding_from_network(v4("10.5.1.2/32"), &[]);
        assert_eq!(binding.netmask, Ipv4Addr::BROADCAST);
        assert_eq!(binding.bcast, Ipv4Addr::new(10, 5, 1, 2));
    }

    #[test]
    fn wildcard_aggregates_all_bindings() {
        let store = store();
        let node = Addr48::from(0x020000000001);
        let host_ifaces = [
            host(0x0a0000000001, &["192.168.1.10/24"]),
            host(0x0a0000000002, &["10.0.0.2/8"]),
        ];

        let list = build_udp_interfaces(&host_ifaces, &[], &store, node);

        assert_eq!(list.len(), 3);
        // Wildcard first, carrying the union of bindings.
        assert_eq!(list[0].node, node);
        assert_eq!(list[0].bindings.len(), 2);
        assert_eq!(list[1].node, Addr48::from(0x0a0000000001));
        assert_eq!(list[2].node, Addr48::from(0x0a0000000002));
    }

    #[test]
    fn disabled_interfaces_feed_wildcard_only() {
        let store = store();
        let disabled = Addr48::from(0x0a0000000002);
        store.set_iface_config(
            disabled,
            IfaceConfig {
                netnum: Addr32::from(1),
                nodenum: Addr48::ZERO,
                enabled: false,
            },
        );

        let host_ifaces = [
            host(0x0a0000000001, &["192.168.1.10/24"]),
            host(u64::from(disabled), &["10.0.0.2/8"]),
        ];
        let list = build_udp_interfaces(&host_ifaces, &[], &store, Addr48::from(2));

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].bindings.len(), 2);
        assert!(list.iter().all(|iface| iface.mac != Some(disabled)));
    }

    #[test]
    fn primary_goes_before_wildcard() {
        let store = store();
        let primary = Addr48::from(0x0a0000000002);
        store.set_primary_iface(Some(primary));

        let host_ifaces = [
            host(0x0a0000000001, &["192.168.1.10/24"]),
            host(u64::from(primary), &["10.0.0.2/8"]),
        ];
        let list = build_udp_interfaces(&host_ifaces, &[], &store, Addr48::from(2));

        assert_eq!(list.len(), 3);
        assert_eq!(list[0].mac, Some(primary));
        assert_eq!(list[1].mac, None); // wildcard
    }

    #[test]
    fn cache_lookups() {
        let store = Arc::new(store());
        let dosbox = Arc::new(DosboxShared::new());
        let cache = InterfaceCache::with_providers(
            EncapType::IpxWrapper,
            store,
            dosbox,
            Box::new(|| {
                vec![HostIface {
                    mac: Some(Addr48::from(0x0a0000000001)),
                    addrs: vec!["192.168.1.10/24".parse().unwrap()],
                }]
            }),
            Box::new(Vec::new),
        );

        assert_eq!(cache.count(), 2);

        let wildcard = cache.by_index(0).unwrap();
        assert_eq!(wildcard.node, cache.local_node());

        assert!(cache
            .by_addr(Addr32::from(1), Addr48::from(0x0a0000000001))
            .is_some());
        assert!(cache.by_addr(Addr32::from(2), Addr48::from(1)).is_none());

        let by_subnet = cache.by_subnet(Ipv4Addr::new(192, 168, 1, 77)).unwrap();
        assert_eq!(by_subnet.node, cache.local_node());

        // Wildcard bind resolves to the first interface.
        assert_eq!(
            cache.resolve_bind(Addr32::ZERO, Addr48::ZERO),
            Some((Addr32::from(1), cache.local_node()))
        );
        // Specific bind resolves to the matching card.
        assert_eq!(
            cache.resolve_bind(Addr32::ZERO, Addr48::from(0x0a0000000001)),
            Some((Addr32::from(1), Addr48::from(0x0a0000000001)))
        );
        assert_eq!(cache.resolve_bind(Addr32::from(9), Addr48::ZERO), None);
    }

    #[test]
    fn dosbox_interface_follows_assignment() {
        let store = Arc::new(store());
        let dosbox = Arc::new(DosboxShared::new());
        let cache = InterfaceCache::with_providers(
            EncapType::DosBox,
            store,
            dosbox.clone(),
            Box::new(Vec::new),
            Box::new(Vec::new),
        );

        assert_eq!(cache.count(), 0);

        dosbox.set_connected(Addr32::from(7), Addr48::from(0x99));
        cache.reload();

        let list = cache.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].net, Addr32::from(7));
        assert_eq!(list[0].node, Addr48::from(0x99));
        assert!(list[0].bindings.is_empty());
    }
}
