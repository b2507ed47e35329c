//! Configuration values consumed by the stack.
//!
//! Loading from a persisted store or an INI file is outside this crate. The
//! embedding layer builds a `MainConfig` however it likes and hands it to
//! `IpxStack::new`. Per interface records and the persisted node number go
//! through the `ConfigStore` trait.

use std::collections::HashMap;
use std::sync::Mutex;

use log::LevelFilter;

use addr::{Addr32, Addr48};

/// Default UDP port for the IPX over UDP carrier.
pub const DEFAULT_PORT: u16 = 54792;

/// Default port of a DOSBox IPX server.
pub const DEFAULT_DOSBOX_PORT: u16 = 213;

/// Node number key under which the wildcard interface's configuration is
/// stored.
pub const WILDCARD_IFACE_HWADDR: Addr48 = Addr48::ZERO;

/// Which transport actually carries the IPX packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncapType {
    /// IPX over UDP with broadcast peer discovery.
    IpxWrapper,

    /// Raw Ethernet frames through a capture handle.
    Pcap,

    /// Relay through a DOSBox compatible IPX over UDP server.
    DosBox,
}

/// Ethernet frame layout used by the `Pcap` carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    EthernetII,
    NovellRaw,
    Llc,
}

/// Log verbosity, ordered from chattiest to disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Call,
    Debug,
    Info,
    Warning,
    Error,
    Disabled,
}

impl LogLevel {
    /// The `log` crate filter equivalent to this level. The embedding layer
    /// feeds this to whatever logger implementation it installs.
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Call => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Disabled => LevelFilter::Off,
        }
    }
}

/// The complete set of tunables the stack consumes.
#[derive(Debug, Clone)]
pub struct MainConfig {
    /// Listen/broadcast port for the IPX over UDP carrier.
    pub udp_port: u16,

    pub encap_type: EncapType,

    /// Only meaningful with `EncapType::Pcap`.
    pub frame_type: FrameType,

    /// Emulate the Windows 95 bug that requires `SO_BROADCAST` for a socket
    /// to receive broadcast packets.
    pub w95_bug: bool,

    /// Ask the (external) firewall helper to add an exception on startup.
    pub fw_except: bool,

    pub dosbox_server_addr: String,
    pub dosbox_server_port: u16,
    pub dosbox_coalesce: bool,

    pub log_level: LogLevel,
}

impl Default for MainConfig {
    fn default() -> MainConfig {
        MainConfig {
            udp_port: DEFAULT_PORT,
            encap_type: EncapType::IpxWrapper,
            frame_type: FrameType::EthernetII,
            w95_bug: true,
            fw_except: false,
            dosbox_server_addr: String::new(),
            dosbox_server_port: DEFAULT_DOSBOX_PORT,
            dosbox_coalesce: false,
            log_level: LogLevel::Info,
        }
    }
}

/// Per interface record, keyed by the interface MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceConfig {
    pub netnum: Addr32,
    pub nodenum: Addr48,
    pub enabled: bool,
}

impl Default for IfaceConfig {
    fn default() -> IfaceConfig {
        IfaceConfig {
            netnum: Addr32::from(1),
            nodenum: Addr48::ZERO,
            enabled: true,
        }
    }
}

/// Persisted per interface records and the locally administered node number.
///
/// The crate ships `MemoryConfigStore`; an embedding layer backed by a real
/// configuration store implements this itself.
pub trait ConfigStore: Send + Sync {
    /// The record for an interface, or the defaults when none is stored.
    /// A zero `nodenum` in the result means "use the hardware address".
    fn iface_config(&self, hwaddr: Addr48) -> IfaceConfig;

    fn set_iface_config(&self, hwaddr: Addr48, config: IfaceConfig);

    /// MAC of the interface to place first in enumerations, if configured.
    fn primary_iface(&self) -> Option<Addr48>;

    /// The persisted locally administered node number, if one was generated
    /// before.
    fn local_node(&self) -> Option<Addr48>;

    fn set_local_node(&self, node: Addr48);
}

/// In-memory `ConfigStore`. Also what the tests use.
#[derive(Default)]
pub struct MemoryConfigStore {
    inner: Mutex<MemoryConfigInner>,
}

#[derive(Default)]
struct MemoryConfigInner {
    ifaces: HashMap<Addr48, IfaceConfig>,
    primary: Option<Addr48>,
    local_node: Option<Addr48>,
}

impl MemoryConfigStore {
    pub fn new() -> MemoryConfigStore {
        MemoryConfigStore::default()
    }

    pub fn set_primary_iface(&self, hwaddr: Option<Addr48>) {
        self.inner.lock().unwrap().primary = hwaddr;
    }
}

impl ConfigStore for MemoryConfigStore {
    fn iface_config(&self, hwaddr: Addr48) -> IfaceConfig {
        let inner = self.inner.lock().unwrap();
        inner
            .ifaces
            .get(&hwaddr)
            .cloned()
            .unwrap_or_else(IfaceConfig::default)
    }

    fn set_iface_config(&self, hwaddr: Addr48, config: IfaceConfig) {
        self.inner.lock().unwrap().ifaces.insert(hwaddr, config);
    }

    fn primary_iface(&self) -> Option<Addr48> {
        self.inner.lock().unwrap().primary
    }

    fn local_node(&self) -> Option<Addr48> {
        self.inner.lock().unwrap().local_node
    }

    fn set_local_node(&self, node: Addr48) {
        self.inner.lock().unwrap().local_node = Some(node);
    }
}
