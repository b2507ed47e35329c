//! Cross process coordination of bound IPX addresses.
//!
//! Every instance on the host appends its bound addresses to a fixed size
//! table in a well known file, protected by an advisory lock, so that two
//! processes cannot bind the same IPX socket number unless both asked for
//! reuse. Entries carry a heartbeat timestamp and are purged when their
//! owner stops refreshing them, so a crashed process does not leak its
//! slots.
//!
//! Per socket-number mutexes are separate lock files held for the lifetime
//! of the bind: exclusive for a normal bind, shared when `SO_REUSEADDR` is
//! set.
//!
//! If the table or the lock files cannot be used the socket layer falls
//! back to in-process checks with the same semantics, minus cross process
//! uniqueness.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libc;

use addr::{Addr32, Addr48, IpxAddr};

pub const ADDR_TABLE_MAX_ENTRIES: usize = 512;

/// Entries whose heartbeat is older than this are treated as abandoned.
pub const ADDR_TABLE_ENTRY_TIMEOUT: Duration = Duration::from_secs(10);

const ADDR_TABLE_VERSION: u32 = 2;

const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 24;
const REGION_SIZE: usize = HEADER_SIZE + ADDR_TABLE_MAX_ENTRIES * ENTRY_SIZE;

const ENTRY_VALID: u16 = 1 << 0;
const ENTRY_REUSE: u16 = 1 << 1;

/// Directory holding the table and the socket lock files.
pub fn runtime_dir() -> PathBuf {
    ::std::env::temp_dir().join("ripx")
}

fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One record of the shared table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrTableEntry {
    pub addr: IpxAddr,
    pub reuse: bool,
    /// Loopback port of the owning socket, which doubles as the owner key.
    pub port: u16,
    pub time: u64,
}

impl AddrTableEntry {
    fn read(buf: &[u8]) -> Option<AddrTableEntry> {
        let flags = (buf[12] as u16) << 8 | buf[13] as u16;
        if flags & ENTRY_VALID == 0 {
            return None;
        }
        Some(AddrTableEntry {
            addr: IpxAddr {
                net: Addr32::from_wire(&buf[0..4]),
                node: Addr48::from_wire(&buf[4..10]),
                socket: (buf[10] as u16) << 8 | buf[11] as u16,
            },
            reuse: flags & ENTRY_REUSE != 0,
            port: (buf[14] as u16) << 8 | buf[15] as u16,
            time: (buf[16] as u64) << 56
                | (buf[17] as u64) << 48
                | (buf[18] as u64) << 40
                | (buf[19] as u64) << 32
                | (buf[20] as u64) << 24
                | (buf[21] as u64) << 16
                | (buf[22] as u64) << 8
                | buf[23] as u64,
        })
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.addr.net.to_wire());
        buf[4..10].copy_from_slice(&self.addr.node.to_wire());
        buf[10] = (self.addr.socket >> 8) as u8;
        buf[11] = self.addr.socket as u8;
        let flags = ENTRY_VALID | if self.reuse { ENTRY_REUSE } else { 0 };
        buf[12] = (flags >> 8) as u8;
        buf[13] = flags as u8;
        buf[14] = (self.port >> 8) as u8;
        buf[15] = self.port as u8;
        for i in 0..8 {
            buf[16 + i] = (self.time >> (56 - i * 8)) as u8;
        }
    }
}

struct Shared {
    region: File,
    lock: File,
}

impl Shared {
    /// Reads the valid run of entries. The caller must hold the lock.
    fn load(&self) -> io::Result<Vec<AddrTableEntry>> {
        let mut buf = vec![0u8; REGION_SIZE];
        self.region.read_exact_at(&mut buf, 0)?;

        let mut entries = Vec::new();
        for i in 0..ADDR_TABLE_MAX_ENTRIES {
            let offset = HEADER_SIZE + i * ENTRY_SIZE;
            match AddrTableEntry::read(&buf[offset..offset + ENTRY_SIZE]) {
                Some(entry) => entries.push(entry),
                // The valid run is contiguous from the start.
                None => break,
            }
        }
        Ok(entries)
    }

    /// Writes back a compact valid run. The caller must hold the lock.
    fn store(&self, entries: &[AddrTableEntry]) -> io::Result<()> {
        let mut buf = vec![0u8; REGION_SIZE - HEADER_SIZE];
        for (i, entry) in entries.iter().take(ADDR_TABLE_MAX_ENTRIES).enumerate() {
            entry.write(&mut buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
        }
        self.region.write_all_at(&buf, HEADER_SIZE as u64)
    }
}

/// Handle to the shared address table. Degraded to a no-op when the shared
/// region could not be set up.
pub struct AddrTable {
    shared: Option<Mutex<Shared>>,
    timeout: Duration,
}

impl AddrTable {
    /// Opens (creating if necessary) the table in the default runtime
    /// directory. Never fails: on any error a degraded table is returned
    /// and a warning logged.
    pub fn open() -> AddrTable {
        AddrTable::open_in(&runtime_dir())
    }

    pub fn open_in(dir: &Path) -> AddrTable {
        match AddrTable::try_open(dir) {
            Ok(shared) => AddrTable {
                shared: Some(Mutex::new(shared)),
                timeout: ADDR_TABLE_ENTRY_TIMEOUT,
            },
            Err(e) => {
                warn!("Address table unavailable ({}), falling back to in-process checks", e);
                warn!("Multiple processes may have address conflicts!");
                AddrTable {
                    shared: None,
                    timeout: ADDR_TABLE_ENTRY_TIMEOUT,
                }
            }
        }
    }

    fn try_open(dir: &Path) -> io::Result<Shared> {
        fs::create_dir_all(dir)?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join("addr_table.lock"))?;
        flock(&lock, libc::LOCK_EX)?;

        let region = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join("addr_table"))?;

        let len = region.metadata()?.len();
        if len < REGION_SIZE as u64 {
            // Fresh table: zero the region and stamp the version.
            region.write_all_at(&vec![0u8; REGION_SIZE], 0)?;
            let mut header = [0u8; HEADER_SIZE];
            header[0] = (ADDR_TABLE_VERSION >> 24) as u8;
            header[1] = (ADDR_TABLE_VERSION >> 16) as u8;
            header[2] = (ADDR_TABLE_VERSION >> 8) as u8;
            header[3] = ADDR_TABLE_VERSION as u8;
            region.write_all_at(&header, 0)?;
        } else {
            let mut header = [0u8; HEADER_SIZE];
            region.read_exact_at(&mut header, 0)?;
            let version = (header[0] as u32) << 24
                | (header[1] as u32) << 16
                | (header[2] as u32) << 8
                | header[3] as u32;
            if version != ADDR_TABLE_VERSION {
                flock(&lock, libc::LOCK_UN).ok();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("table version {} != {}", version, ADDR_TABLE_VERSION),
                ));
            }
        }

        flock(&lock, libc::LOCK_UN)?;
        Ok(Shared {
            region: region,
            lock: lock,
        })
    }

    /// Whether the cross process region is in use.
    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    #[cfg(test)]
    pub fn set_entry_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn with_locked<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&Shared) -> io::Result<T>,
    {
        let shared = self.shared.as_ref()?;
        let shared = shared.lock().unwrap();
        if flock(&shared.lock, libc::LOCK_EX).is_err() {
            return None;
        }
        let result = f(&shared);
        flock(&shared.lock, libc::LOCK_UN).ok();
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Address table operation failed: {}", e);
                None
            }
        }
    }

    /// Scans for a conflicting bind. `Some(true)` means the address is
    /// free to bind, `Some(false)` that it conflicts, `None` that the table
    /// is unavailable and the caller must check its own sockets instead.
    ///
    /// Entries whose heartbeat has expired belong to dead processes and do
    /// not count as conflicts, whether or not a purge ran yet.
    pub fn check(&self, addr: &IpxAddr, reuse: bool) -> Option<bool> {
        let socket = addr.socket;
        let timeout = self.timeout.as_secs();
        self.with_locked(|shared| {
            let now = now_secs();
            let entries = shared.load()?;
            Ok(entries
                .iter()
                .filter(|entry| entry.time + timeout > now)
                .all(|entry| entry.addr.socket != socket || (entry.reuse && reuse)))
        })
    }

    /// An unused socket number for automatic allocation, walking up from
    /// 1024. `None` when the table is unavailable or every number is taken.
    pub fn auto_socket(&self) -> Option<u16> {
        let timeout = self.timeout.as_secs();
        self.with_locked(|shared| {
            let now = now_secs();
            let entries: Vec<AddrTableEntry> = shared
                .load()?
                .into_iter()
                .filter(|entry| entry.time + timeout > now)
                .collect();
            let mut socket: u32 = 1024;
            while socket <= 0xffff {
                if entries.iter().any(|entry| entry.addr.socket as u32 == socket) {
                    socket += 1;
                } else {
                    return Ok(Some(socket as u16));
                }
            }
            Ok(None)
        })
        .unwrap_or(None)
    }

    /// Appends an entry at the end of the valid run. Conflict checking is
    /// the caller's job, via `check`.
    pub fn add(&self, addr: &IpxAddr, port: u16, reuse: bool) {
        let _ = self.with_locked(|shared| {
            let mut entries = shared.load()?;
            if entries.len() >= ADDR_TABLE_MAX_ENTRIES {
                warn!("Out of address table slots, not appending!");
                return Ok(());
            }
            entries.push(AddrTableEntry {
                addr: *addr,
                reuse: reuse,
                port: port,
                time: now_secs(),
            });
            shared.store(&entries)
        });
    }

    /// Removes the entry owned by `port`, keeping the valid run compact.
    pub fn remove(&self, port: u16) {
        let _ = self.with_locked(|shared| {
            let mut entries = shared.load()?;
            entries.retain(|entry| entry.port != port);
            shared.store(&entries)
        });
    }

    /// Refreshes the heartbeat on entries owned by this process and drops
    /// entries whose heartbeat has expired, compacting the rest.
    pub fn update(&self, own_ports: &[u16]) {
        let timeout = self.timeout.as_secs();
        let _ = self.with_locked(|shared| {
            let now = now_secs();
            let mut entries = shared.load()?;
            for entry in entries.iter_mut() {
                if own_ports.contains(&entry.port) {
                    entry.time = now;
                }
            }
            entries.retain(|entry| entry.time + timeout > now);
            shared.store(&entries)
        });
    }

    /// Snapshot of the valid entries.
    pub fn entries(&self) -> Vec<AddrTableEntry> {
        self.with_locked(|shared| shared.load()).unwrap_or_default()
    }
}

/// Handle on a socket number's lock file, held for the lifetime of a bind.
///
/// A normal bind holds the lock exclusively, a reuse bind holds it shared,
/// which gives exactly the `SO_REUSEADDR` conflict matrix. When the lock
/// files are unusable the mutex degrades to a marker and uniqueness is only
/// enforced against this process's own sockets.
#[derive(Debug)]
pub enum SocketMutex {
    Locked { file: File, socket: u16 },
    Local { socket: u16 },
}

static LOCK_DIR_WARNING: Once = Once::new();

impl SocketMutex {
    /// Tries to take the named lock for `socket`. Returns `None` when
    /// another holder conflicts.
    pub fn acquire(socket: u16, exclusive: bool) -> Option<SocketMutex> {
        SocketMutex::acquire_in(&runtime_dir(), socket, exclusive)
    }

    pub fn acquire_in(dir: &Path, socket: u16, exclusive: bool) -> Option<SocketMutex> {
        let path = dir.join(format!("socket_{}.lock", socket));
        let file = fs::create_dir_all(dir).and_then(|_| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
        });
        let file = match file {
            Ok(file) => file,
            Err(e) => {
                LOCK_DIR_WARNING.call_once(|| {
                    warn!("Cannot create socket lock files ({}), socket numbers are only unique within this process", e);
                });
                return Some(SocketMutex::Local { socket: socket });
            }
        };

        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        match flock(&file, op | libc::LOCK_NB) {
            Ok(()) => Some(SocketMutex::Locked {
                file: file,
                socket: socket,
            }),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                LOCK_DIR_WARNING.call_once(|| {
                    warn!("Socket lock failed ({}), socket numbers are only unique within this process", e);
                });
                Some(SocketMutex::Local { socket: socket })
            }
        }
    }

    pub fn socket(&self) -> u16 {
        match *self {
            SocketMutex::Locked { socket, .. } => socket,
            SocketMutex::Local { socket } => socket,
        }
    }

    /// Second handle on the same lock, used when an accepted SPX socket
    /// shares the listener's address. The lock is released when the last
    /// handle is dropped.
    pub fn duplicate(&self) -> io::Result<SocketMutex> {
        match *self {
            SocketMutex::Locked { ref file, socket } => Ok(SocketMutex::Locked {
                file: file.try_clone()?,
                socket: socket,
            }),
            SocketMutex::Local { socket } => Ok(SocketMutex::Local { socket: socket }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addr::{Addr32, Addr48, IpxAddr};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;
    use std::time::Duration;

    static TEST_DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn test_dir() -> PathBuf {
        let seq = TEST_DIR_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = ::std::env::temp_dir().join(format!(
            "ripx_table_test_{}_{}",
            ::std::process::id(),
            seq
        ));
        ::std::fs::remove_dir_all(&dir).ok();
        dir
    }

    fn addr(socket: u16) -> IpxAddr {
        IpxAddr::new(Addr32::from(1), Addr48::from(0xa0b0c0d0e0f0), socket)
    }

    #[test]
    fn add_check_remove() {
        let dir = test_dir();
        let table = AddrTable::open_in(&dir);
        assert!(table.is_shared());

        assert_eq!(table.check(&addr(5000), false), Some(true));
        table.add(&addr(5000), 101, false);

        assert_eq!(table.check(&addr(5000), false), Some(false));
        assert_eq!(table.check(&addr(5000), true), Some(false));
        assert_eq!(table.check(&addr(5001), false), Some(true));

        table.remove(101);
        assert_eq!(table.check(&addr(5000), false), Some(true));
    }

    #[test]
    fn reuse_only_conflicts_without_reuse() {
        let dir = test_dir();
        let table = AddrTable::open_in(&dir);

        table.add(&addr(6000), 102, true);
        assert_eq!(table.check(&addr(6000), true), Some(true));
        assert_eq!(table.check(&addr(6000), false), Some(false));
    }

    #[test]
    fn visible_across_handles() {
        let dir = test_dir();
        let table_a = AddrTable::open_in(&dir);
        let table_b = AddrTable::open_in(&dir);

        table_a.add(&addr(7000), 103, false);
        assert_eq!(table_b.check(&addr(7000), false), Some(false));
        assert_eq!(table_b.entries().len(), 1);
    }

    #[test]
    fn auto_socket_skips_taken() {
        let dir = test_dir();
        let table = AddrTable::open_in(&dir);

        assert_eq!(table.auto_socket(), Some(1024));
        table.add(&addr(1024), 104, false);
        table.add(&addr(1025), 105, false);
        assert_eq!(table.auto_socket(), Some(1026));
    }

    #[test]
    fn remove_keeps_run_compact() {
        let dir = test_dir();
        let table = AddrTable::open_in(&dir);

        table.add(&addr(8000), 110, false);
        table.add(&addr(8001), 111, false);
        table.add(&addr(8002), 112, false);

        table.remove(111);
        let entries = table.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.addr.socket == 8000));
        assert!(entries.iter().any(|e| e.addr.socket == 8002));
    }

    #[test]
    fn update_expires_foreign_entries() {
        let dir = test_dir();
        let mut table = AddrTable::open_in(&dir);
        table.set_entry_timeout(Duration::from_secs(1));

        table.add(&addr(9000), 120, false); // "ours"
        table.add(&addr(9001), 121, false); // abandoned by a dead process

        sleep(Duration::from_millis(1100));
        table.update(&[120]);

        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].addr.socket, 9000);
    }

    #[test]
    fn socket_mutex_exclusive() {
        let dir = test_dir();

        let held = SocketMutex::acquire_in(&dir, 4567, true).unwrap();
        assert!(SocketMutex::acquire_in(&dir, 4567, true).is_none());
        assert!(SocketMutex::acquire_in(&dir, 4567, false).is_none());
        assert!(SocketMutex::acquire_in(&dir, 4568, true).is_some());

        drop(held);
        assert!(SocketMutex::acquire_in(&dir, 4567, true).is_some());
    }

    #[test]
    fn socket_mutex_shared_for_reuse() {
        let dir = test_dir();

        let a = SocketMutex::acquire_in(&dir, 4600, false).unwrap();
        let b = SocketMutex::acquire_in(&dir, 4600, false).unwrap();
        assert!(SocketMutex::acquire_in(&dir, 4600, true).is_none());

        drop(a);
        drop(b);
        assert!(SocketMutex::acquire_in(&dir, 4600, true).is_some());
    }

    #[test]
    fn socket_mutex_duplicate_keeps_lock() {
        let dir = test_dir();

        let original = SocketMutex::acquire_in(&dir, 4700, true).unwrap();
        let copy = original.duplicate().unwrap();
        drop(original);

        // Still held through the duplicate.
        assert!(SocketMutex::acquire_in(&dir, 4700, true).is_none());
        drop(copy);
        assert!(SocketMutex::acquire_in(&dir, 4700, true).is_some());
    }
}
