//! IPX address types.
//!
//! An IPX address is the triple of a 32 bit network number, a 48 bit node
//! number and a 16 bit socket number. The network and node numbers get their
//! own types here since they show up on their own in configuration and in the
//! interface table, the full triple is an `IpxAddr`.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand;

/// A 32 bit IPX network number.
///
/// `00:00:00:00` addresses "this network" and `FF:FF:FF:FF` is the broadcast
/// network. Stored in host byte order, written to the wire big endian.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr32(u32);

impl Addr32 {
    pub const ZERO: Addr32 = Addr32(0);
    pub const BROADCAST: Addr32 = Addr32(0xffff_ffff);

    /// Reads an address from the first four bytes of `buf` in network byte
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than four bytes.
    pub fn from_wire(buf: &[u8]) -> Addr32 {
        Addr32(
            (buf[0] as u32) << 24 | (buf[1] as u32) << 16 | (buf[2] as u32) << 8 | (buf[3] as u32),
        )
    }

    /// Returns the network byte order representation of this address.
    pub fn to_wire(&self) -> [u8; 4] {
        [
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == 0xffff_ffff
    }
}

impl From<u32> for Addr32 {
    fn from(value: u32) -> Addr32 {
        Addr32(value)
    }
}

impl From<Addr32> for u32 {
    fn from(addr: Addr32) -> u32 {
        addr.0
    }
}

impl fmt::Display for Addr32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.to_wire();
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}", b[0], b[1], b[2], b[3])
    }
}

impl FromStr for Addr32 {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Addr32, AddrParseError> {
        let mut buf = [0u8; 4];
        parse_hex_fields(s, &mut buf)?;
        Ok(Addr32::from_wire(&buf))
    }
}

/// A 48 bit IPX node number, usually a MAC address.
///
/// Kept in the low six bytes of a `u64`, the upper two bytes are always zero.
/// `FF:FF:FF:FF:FF:FF` is the broadcast node and all zeroes is reserved for
/// the wildcard interface.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr48(u64);

impl Addr48 {
    pub const ZERO: Addr48 = Addr48(0);
    pub const BROADCAST: Addr48 = Addr48(0xffff_ffff_ffff);

    /// Reads an address from the first six bytes of `buf` in network byte
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than six bytes.
    pub fn from_wire(buf: &[u8]) -> Addr48 {
        let mut value = 0u64;
        for byte in &buf[..6] {
            value = value << 8 | *byte as u64;
        }
        Addr48(value)
    }

    /// Returns the network byte order representation of this address.
    pub fn to_wire(&self) -> [u8; 6] {
        [
            (self.0 >> 40) as u8,
            (self.0 >> 32) as u8,
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == 0xffff_ffff_ffff
    }

    /// Generates a (probably) unique locally administered node number.
    pub fn random() -> Addr48 {
        let mut rng = rand::thread_rng();
        let mut buf = [0u8; 6];
        for byte in buf.iter_mut() {
            *byte = rng.gen();
        }
        buf[0] |= 0x02;
        Addr48::from_wire(&buf)
    }
}

impl From<u64> for Addr48 {
    fn from(value: u64) -> Addr48 {
        Addr48(value & 0xffff_ffff_ffff)
    }
}

impl From<Addr48> for u64 {
    fn from(addr: Addr48) -> u64 {
        addr.0
    }
}

impl fmt::Display for Addr48 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.to_wire();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for Addr48 {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Addr48, AddrParseError> {
        let mut buf = [0u8; 6];
        parse_hex_fields(s, &mut buf)?;
        Ok(Addr48::from_wire(&buf))
    }
}

/// Error returned when parsing a text formatted address fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrParseError;

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Invalid IPX address syntax")
    }
}

impl ::std::error::Error for AddrParseError {
    fn description(&self) -> &str {
        "Invalid IPX address syntax"
    }
}

/// Parses colon separated hex fields into `out`. Every field must be one or
/// two hex digits and the field count must match `out.len()` exactly.
fn parse_hex_fields(s: &str, out: &mut [u8]) -> Result<(), AddrParseError> {
    let mut fields = s.split(':');
    for slot in out.iter_mut() {
        let field = fields.next().ok_or(AddrParseError)?;
        if field.is_empty() || field.len() > 2 || !field.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddrParseError);
        }
        *slot = u8::from_str_radix(field, 16).map_err(|_| AddrParseError)?;
    }
    if fields.next().is_some() {
        return Err(AddrParseError);
    }
    Ok(())
}

/// A full IPX socket address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpxAddr {
    pub net: Addr32,
    pub node: Addr48,
    pub socket: u16,
}

impl IpxAddr {
    pub const ZERO: IpxAddr = IpxAddr {
        net: Addr32::ZERO,
        node: Addr48::ZERO,
        socket: 0,
    };

    pub fn new(net: Addr32, node: Addr48, socket: u16) -> IpxAddr {
        IpxAddr {
            net: net,
            node: node,
            socket: socket,
        }
    }
}

impl fmt::Display for IpxAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.net, self.node, self.socket)
    }
}

/// The wider address variant used when the packet type extension is enabled.
///
/// Deliberately a distinct type rather than a flag on `IpxAddr` so that the
/// send path can only read the extra byte when the caller actually supplied
/// it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IpxAddrExt {
    pub addr: IpxAddr,
    /// Packet type carried alongside the address. Overrides the socket's
    /// default on send, reports the received type on receive.
    pub ptype: u8,
    /// Receive side only: `IPX_ADDR_FLAG_BCAST` when the destination was a
    /// broadcast, `IPX_ADDR_FLAG_LOCAL` when the source is one of this
    /// host's own interfaces.
    pub flags: u8,
}

pub const IPX_ADDR_FLAG_BCAST: u8 = 0x01;
pub const IPX_ADDR_FLAG_LOCAL: u8 = 0x02;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr32_wire_round_trip() {
        let addr = Addr32::from(0x00123456);
        assert_eq!(addr.to_wire(), [0x00, 0x12, 0x34, 0x56]);
        assert_eq!(Addr32::from_wire(&addr.to_wire()), addr);
    }

    #[test]
    fn addr48_wire_round_trip() {
        let addr = Addr48::from(0xdead_beef_cafe);
        assert_eq!(addr.to_wire(), [0xde, 0xad, 0xbe, 0xef, 0xca, 0xfe]);
        assert_eq!(Addr48::from_wire(&addr.to_wire()), addr);
    }

    #[test]
    fn addr48_upper_bytes_ignored() {
        assert_eq!(Addr48::from(0xffff_0000_0000_0001), Addr48::from(1));
    }

    #[test]
    fn addr32_string_round_trip() {
        for value in &[0u32, 1, 0x00001234, 0xdeadbeef, 0xffffffff] {
            let addr = Addr32::from(*value);
            assert_eq!(addr.to_string().parse::<Addr32>(), Ok(addr));
        }
    }

    #[test]
    fn addr48_string_round_trip() {
        for value in &[0u64, 1, 0x0800_2b01_0203, 0xffff_ffff_ffff] {
            let addr = Addr48::from(*value);
            assert_eq!(addr.to_string().parse::<Addr48>(), Ok(addr));
        }
    }

    #[test]
    fn addr32_parse_accepts_short_fields() {
        assert_eq!("0:1:a:FF".parse::<Addr32>(), Ok(Addr32::from(0x00010aff)));
    }

    #[test]
    fn addr32_parse_rejects_garbage() {
        assert!("".parse::<Addr32>().is_err());
        assert!("00:00:00".parse::<Addr32>().is_err());
        assert!("00:00:00:00:00".parse::<Addr32>().is_err());
        assert!("000:00:00:00".parse::<Addr32>().is_err());
        assert!("00:00:0g:00".parse::<Addr32>().is_err());
        assert!("00::00:00".parse::<Addr32>().is_err());
        assert!("00.00.00.00".parse::<Addr32>().is_err());
    }

    #[test]
    fn addr48_parse_rejects_garbage() {
        assert!("00:00:00:00:00".parse::<Addr48>().is_err());
        assert!("00:00:00:00:00:00:00".parse::<Addr48>().is_err());
        assert!("001:00:00:00:00:00".parse::<Addr48>().is_err());
    }

    #[test]
    fn random_node_is_locally_administered() {
        let node = Addr48::random();
        assert_eq!(node.to_wire()[0] & 0x02, 0x02);
        assert!(!node.is_zero());
    }

    #[test]
    fn ipx_addr_display() {
        let addr = IpxAddr::new(Addr32::from(1), Addr48::from(0x0a0b0c0d0e0f), 4567);
        assert_eq!(addr.to_string(), "00:00:00:01/0A:0B:0C:0D:0E:0F/4567");
    }
}
