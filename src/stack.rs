//! The process wide IPX stack context.
//!
//! `IpxStack::new` wires up the carrier sockets, the interface cache, the
//! address cache and table, and the router thread, in one startup step.
//! Everything else holds an `Arc` of the internals; dropping the stack
//! stops the router.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libc;
use pnet::datalink::{self, DataLinkReceiver, DataLinkSender};

use addr::Addr48;
use addrcache::AddrCache;
use addrtable::AddrTable;
use coalesce::Coalescer;
use config::{ConfigStore, EncapType, MainConfig, MemoryConfigStore};
use error::{Error, Result};
use interface::{DosboxShared, InterfaceCache, IpxInterface};
use router::{self, Router};
use socket::{self, IpxSocket, SocketTable};
use tx;

/// Traffic counters, reported when the stack shuts down.
#[derive(Default)]
pub(crate) struct Counters {
    /// Sent from / forwarded to emulated sockets.
    pub send_packets: AtomicU64,
    pub send_bytes: AtomicU64,
    pub recv_packets: AtomicU64,
    pub recv_bytes: AtomicU64,

    /// Moved over the UDP transport.
    pub send_packets_udp: AtomicU64,
    pub send_bytes_udp: AtomicU64,
    pub recv_packets_udp: AtomicU64,
    pub recv_bytes_udp: AtomicU64,
}

pub(crate) struct StackInner {
    pub config: MainConfig,
    pub sockets: Mutex<SocketTable>,
    pub interfaces: InterfaceCache,
    pub addr_cache: Mutex<AddrCache>,
    pub addr_table: AddrTable,
    pub dosbox: Arc<DosboxShared>,
    pub dosbox_server: Option<SocketAddr>,

    /// Send and local relay socket. Unicast receive in UDP mode, server
    /// traffic in DOSBox mode.
    pub private_socket: UdpSocket,
    /// Receives broadcasts on the configured port; UDP carrier only.
    pub shared_socket: Option<UdpSocket>,

    /// Transmit halves of the capture channels, keyed by interface node.
    pub carrier_senders: Mutex<HashMap<Addr48, Box<dyn DataLinkSender>>>,

    pub coalescer: Mutex<Coalescer>,
    pub counters: Counters,
    pub running: Arc<AtomicBool>,
}

/// The stack. One per process is the intended shape, though nothing stops
/// tests from running several.
pub struct IpxStack {
    inner: Arc<StackInner>,
    router: Router,
}

/// The broadcast receive socket is shared by every instance on the host,
/// so it needs address reuse before bind, which the standard library does
/// not expose. 512KiB buffers keep bursty games from dropping packets.
fn init_shared_socket(port: u16) -> io::Result<UdpSocket> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let on: libc::c_int = 1;
        let bufsize: libc::c_int = 524288;
        for (level, name, value) in &[
            (libc::SOL_SOCKET, libc::SO_REUSEADDR, &on),
            (libc::SOL_SOCKET, libc::SO_REUSEPORT, &on),
            (libc::SOL_SOCKET, libc::SO_BROADCAST, &on),
            (libc::SOL_SOCKET, libc::SO_RCVBUF, &bufsize),
            (libc::SOL_SOCKET, libc::SO_SNDBUF, &bufsize),
        ] {
            libc::setsockopt(
                fd,
                *level,
                *name,
                *value as *const libc::c_int as *const libc::c_void,
                ::std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let mut addr: libc::sockaddr_in = ::std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;

        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            ::std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(UdpSocket::from_raw_fd(fd))
    }
}

/// Opens a capture channel per enabled physical interface and builds the
/// matching IPX interface list for the cache.
fn init_capture(
    store: &dyn ConfigStore,
) -> (
    Vec<IpxInterface>,
    HashMap<Addr48, Box<dyn DataLinkSender>>,
    Vec<(Addr48, Box<dyn DataLinkReceiver>)>,
) {
    let mut interfaces = Vec::new();
    let mut senders = HashMap::new();
    let mut receivers = Vec::new();

    let primary = store.primary_iface();

    for host_iface in datalink::interfaces() {
        let mac = match host_iface.mac {
            Some(mac) => Addr48::from_wire(&mac.octets()),
            None => continue,
        };
        if mac.is_zero() {
            continue;
        }

        let iface_config = store.iface_config(mac);
        if !iface_config.enabled {
            continue;
        }

        let mut channel_config = datalink::Config::default();
        channel_config.read_timeout = Some(Duration::from_millis(500));

        let (sender, receiver) = match datalink::channel(&host_iface, channel_config) {
            Ok(datalink::Channel::Ethernet(sender, receiver)) => (sender, receiver),
            Ok(_) => continue,
            Err(e) => {
                error!(
                    "Could not open capture interface '{}': {}",
                    host_iface.name, e
                );
                warn!("This interface will not be available for IPX use");
                continue;
            }
        };

        info!(
            "Capture interface: {} ({}), network {}",
            host_iface.name, mac, iface_config.netnum
        );

        let entry = IpxInterface {
            net: iface_config.netnum,
            node: mac,
            bindings: Vec::new(),
            mac: Some(mac),
        };
        if primary == Some(mac) {
            interfaces.insert(0, entry);
        } else {
            interfaces.push(entry);
        }
        senders.insert(mac, sender);
        receivers.push((mac, receiver));
    }

    (interfaces, senders, receivers)
}

impl IpxStack {
    /// Brings the stack up with an in-memory configuration store.
    pub fn new(config: MainConfig) -> Result<IpxStack> {
        IpxStack::with_store(config, Arc::new(MemoryConfigStore::new()))
    }

    pub fn with_store(config: MainConfig, store: Arc<dyn ConfigStore>) -> Result<IpxStack> {
        info!(
            "IPX stack starting (carrier {:?}, UDP port {})",
            config.encap_type, config.udp_port
        );

        if config.fw_except {
            // The firewall helper is external; all we can do is note the
            // request.
            info!("Firewall exception requested, deferring to the embedding application");
        }

        let dosbox = Arc::new(DosboxShared::new());
        let interfaces = InterfaceCache::new(config.encap_type, store.clone(), dosbox.clone());

        let mut dosbox_server = None;
        let mut shared_socket = None;
        let mut capture_senders = HashMap::new();
        let mut capture_receivers = Vec::new();

        let private_socket = match config.encap_type {
            EncapType::Pcap => {
                let (iface_list, senders, receivers) = init_capture(&*store);
                interfaces.install_fixed(iface_list);
                capture_senders = senders;
                capture_receivers = receivers;

                // Only relays packets to local sockets in this mode.
                UdpSocket::bind(("127.0.0.1", 0)).map_err(Error::Io)?
            }
            EncapType::DosBox => {
                let server = (config.dosbox_server_addr.as_str(), config.dosbox_server_port)
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.find(|addr| addr.is_ipv4()));
                dosbox_server = match server {
                    Some(server) => Some(server),
                    None => {
                        error!(
                            "Cannot resolve DOSBox server address '{}'",
                            config.dosbox_server_addr
                        );
                        return Err(Error::InvalidArg);
                    }
                };
                info!(
                    "Using DOSBox server: {} port {}",
                    config.dosbox_server_addr, config.dosbox_server_port
                );

                UdpSocket::bind(("0.0.0.0", 0)).map_err(Error::Io)?
            }
            EncapType::IpxWrapper => {
                shared_socket = Some(init_shared_socket(config.udp_port).map_err(Error::Io)?);
                let private = UdpSocket::bind(("0.0.0.0", 0)).map_err(Error::Io)?;
                private.set_broadcast(true).map_err(Error::Io)?;
                private
            }
        };

        let inner = Arc::new(StackInner {
            config: config,
            sockets: Mutex::new(SocketTable::new()),
            interfaces: interfaces,
            addr_cache: Mutex::new(AddrCache::new()),
            addr_table: AddrTable::open(),
            dosbox: dosbox,
            dosbox_server: dosbox_server,
            private_socket: private_socket,
            shared_socket: shared_socket,
            carrier_senders: Mutex::new(capture_senders),
            coalescer: Mutex::new(Coalescer::new()),
            counters: Counters::default(),
            running: Arc::new(AtomicBool::new(true)),
        });

        let router = Router::spawn(inner.clone(), capture_receivers);

        if inner.config.encap_type == EncapType::DosBox {
            inner.dosbox.set_registering();
            router::send_dosbox_registration(&inner);
        }

        Ok(IpxStack {
            inner: inner,
            router: router,
        })
    }

    /// Opens an IPX datagram socket. `ptype` is the packet type stamped on
    /// outgoing packets, usually zero.
    pub fn datagram_socket(&self, ptype: u8) -> Result<IpxSocket> {
        socket::create_datagram(&self.inner, ptype)
    }

    /// Opens an SPX stream socket. Fails on the Ethernet and DOSBox
    /// carriers.
    pub fn stream_socket(&self) -> Result<IpxSocket> {
        socket::create_stream(&self.inner, false)
    }

    /// Opens an SPX II stream socket. The wire behaviour is identical, the
    /// flag only changes what the socket reports about itself.
    pub fn stream_socket_spx2(&self) -> Result<IpxSocket> {
        socket::create_stream(&self.inner, true)
    }

    /// Snapshot of the IPX interfaces, primary first.
    pub fn interfaces(&self) -> Vec<IpxInterface> {
        self.inner.interfaces.list()
    }

    /// Flushes and rebuilds the interface table immediately, e.g. on a
    /// topology change notification. Otherwise the table refreshes on its
    /// own TTL.
    pub fn reload_interfaces(&self) {
        self.inner.interfaces.reload()
    }

    /// The locally administered node number of the wildcard interface.
    pub fn local_node(&self) -> Addr48 {
        self.inner.interfaces.local_node()
    }

    pub fn config(&self) -> &MainConfig {
        &self.inner.config
    }
}

impl Drop for IpxStack {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.router.join();

        // Push out whatever the coalescer still holds.
        if let Some(server) = self.inner.dosbox_server {
            let waiting = self.inner.coalescer.lock().unwrap().flush_all();
            for datagram in waiting {
                tx::send_relay(&self.inner, &datagram, server).ok();
            }
        }

        let counters = &self.inner.counters;
        info!(
            "IPX sockets sent {} packets ({} bytes)",
            counters.send_packets.load(Ordering::Relaxed),
            counters.send_bytes.load(Ordering::Relaxed)
        );
        info!(
            "IPX sockets received {} packets ({} bytes)",
            counters.recv_packets.load(Ordering::Relaxed),
            counters.recv_bytes.load(Ordering::Relaxed)
        );
        info!(
            "UDP transport sent {} packets ({} bytes)",
            counters.send_packets_udp.load(Ordering::Relaxed),
            counters.send_bytes_udp.load(Ordering::Relaxed)
        );
        info!(
            "UDP transport received {} packets ({} bytes)",
            counters.recv_packets_udp.load(Ordering::Relaxed),
            counters.recv_bytes_udp.load(Ordering::Relaxed)
        );
    }
}
