//! The IPX packet as it appears on the wire, plus the fixed-layout records
//! used by the SPX session setup.
//!
//! All carriers use the same 30 byte Novell header. The checksum field is
//! never computed, it always carries the sentinel `0xFFFF`.

use addr::{Addr32, Addr48, IpxAddr};

/// Size of the fixed IPX header.
pub const IPX_HEADER_SIZE: usize = 30;

/// Largest application payload accepted by the send path.
pub const MAX_DATA_SIZE: usize = 8192;

/// Largest packet a receive buffer must be able to hold.
pub const MAX_PKT_SIZE: usize = IPX_HEADER_SIZE + MAX_DATA_SIZE;

/// Packet types with a source socket of zero are internal traffic, the type
/// decides what they mean. The destination address of such packets is all
/// zeroes so that applications can never see them, since nothing can bind to
/// socket zero.
pub const IPX_MAGIC_SPXLOOKUP: u8 = 1;

/// Registration exchange with a DOSBox server uses type 2 on the echo socket.
pub const IPX_MAGIC_DOSBOX_REG: u8 = 2;

/// Outer type of a packet whose payload is a concatenation of whole IPX
/// packets, produced by the coalescer.
pub const IPX_MAGIC_COALESCED: u8 = 3;

/// Socket number the DOSBox registration request is addressed to.
pub const IPX_SOCK_ECHO: u16 = 2;

/// A parsed IPX header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpxHeader {
    /// Total packet length including this header.
    pub length: u16,
    pub ptype: u8,
    pub dest: IpxAddr,
    pub src: IpxAddr,
}

impl IpxHeader {
    /// Parses the header from the front of `buf`, also returning the raw
    /// checksum field. Only checks that enough bytes are present; validity
    /// of the length and checksum fields is the router's business.
    pub fn read(buf: &[u8]) -> Option<(IpxHeader, u16)> {
        if buf.len() < IPX_HEADER_SIZE {
            return None;
        }
        let checksum = (buf[0] as u16) << 8 | buf[1] as u16;
        let header = IpxHeader {
            length: (buf[2] as u16) << 8 | buf[3] as u16,
            ptype: buf[5],
            dest: IpxAddr {
                net: Addr32::from_wire(&buf[6..10]),
                node: Addr48::from_wire(&buf[10..16]),
                socket: (buf[16] as u16) << 8 | buf[17] as u16,
            },
            src: IpxAddr {
                net: Addr32::from_wire(&buf[18..22]),
                node: Addr48::from_wire(&buf[22..28]),
                socket: (buf[28] as u16) << 8 | buf[29] as u16,
            },
        };
        Some((header, checksum))
    }

    /// Serialises the header into the first 30 bytes of `buf`, filling
    /// `checksum = 0xFFFF` and `hops = 0`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than `IPX_HEADER_SIZE`.
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = 0xff;
        buf[1] = 0xff;
        buf[2] = (self.length >> 8) as u8;
        buf[3] = self.length as u8;
        buf[4] = 0; // hops
        buf[5] = self.ptype;
        buf[6..10].copy_from_slice(&self.dest.net.to_wire());
        buf[10..16].copy_from_slice(&self.dest.node.to_wire());
        buf[16] = (self.dest.socket >> 8) as u8;
        buf[17] = self.dest.socket as u8;
        buf[18..22].copy_from_slice(&self.src.net.to_wire());
        buf[22..28].copy_from_slice(&self.src.node.to_wire());
        buf[28] = (self.src.socket >> 8) as u8;
        buf[29] = self.src.socket as u8;
    }
}

/// Builds a complete IPX packet from its parts.
pub fn pack_ipx_packet(ptype: u8, src: IpxAddr, dest: IpxAddr, payload: &[u8]) -> Vec<u8> {
    let header = IpxHeader {
        length: (IPX_HEADER_SIZE + payload.len()) as u16,
        ptype: ptype,
        dest: dest,
        src: src,
    };
    let mut buf = vec![0u8; IPX_HEADER_SIZE + payload.len()];
    header.write(&mut buf);
    buf[IPX_HEADER_SIZE..].copy_from_slice(payload);
    buf
}

/// Splits a received datagram into header and payload, checking that the
/// checksum carries the sentinel and that the length field matches the
/// datagram exactly.
pub fn unpack_ipx_packet(buf: &[u8]) -> Option<(IpxHeader, &[u8])> {
    let (header, checksum) = IpxHeader::read(buf)?;
    if checksum != 0xffff {
        return None;
    }
    if header.length as usize != buf.len() || (header.length as usize) < IPX_HEADER_SIZE {
        return None;
    }
    Some((header, &buf[IPX_HEADER_SIZE..header.length as usize]))
}

/// Size of the three fixed SPX setup records below.
pub const SPX_RECORD_SIZE: usize = 32;

fn write_spx_addr(buf: &mut [u8], addr: &IpxAddr) {
    buf[0..4].copy_from_slice(&addr.net.to_wire());
    buf[4..10].copy_from_slice(&addr.node.to_wire());
    buf[10] = (addr.socket >> 8) as u8;
    buf[11] = addr.socket as u8;
}

fn read_spx_addr(buf: &[u8]) -> IpxAddr {
    IpxAddr {
        net: Addr32::from_wire(&buf[0..4]),
        node: Addr48::from_wire(&buf[4..10]),
        socket: (buf[10] as u16) << 8 | buf[11] as u16,
    }
}

/// Payload of an `IPX_MAGIC_SPXLOOKUP` request:
/// `{net(4), node(6), socket(2), padding(20)}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpxLookupReq {
    pub addr: IpxAddr,
}

impl SpxLookupReq {
    pub fn to_bytes(&self) -> [u8; SPX_RECORD_SIZE] {
        let mut buf = [0u8; SPX_RECORD_SIZE];
        write_spx_addr(&mut buf, &self.addr);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<SpxLookupReq> {
        if buf.len() != SPX_RECORD_SIZE {
            return None;
        }
        Some(SpxLookupReq {
            addr: read_spx_addr(buf),
        })
    }
}

/// Reply to a lookup: `{net(4), node(6), socket(2), port(2), padding(18)}`.
/// `port` is the TCP port backing the listening SPX socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpxLookupReply {
    pub addr: IpxAddr,
    pub port: u16,
}

impl SpxLookupReply {
    pub fn to_bytes(&self) -> [u8; SPX_RECORD_SIZE] {
        let mut buf = [0u8; SPX_RECORD_SIZE];
        write_spx_addr(&mut buf, &self.addr);
        buf[12] = (self.port >> 8) as u8;
        buf[13] = self.port as u8;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<SpxLookupReply> {
        if buf.len() != SPX_RECORD_SIZE {
            return None;
        }
        Some(SpxLookupReply {
            addr: read_spx_addr(buf),
            port: (buf[12] as u16) << 8 | buf[13] as u16,
        })
    }
}

/// First record a client transmits on a fresh SPX stream, carrying its own
/// IPX address so the accepting side can recover it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpxInit {
    pub addr: IpxAddr,
}

impl SpxInit {
    pub fn to_bytes(&self) -> [u8; SPX_RECORD_SIZE] {
        let mut buf = [0u8; SPX_RECORD_SIZE];
        write_spx_addr(&mut buf, &self.addr);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<SpxInit> {
        if buf.len() != SPX_RECORD_SIZE {
            return None;
        }
        Some(SpxInit {
            addr: read_spx_addr(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addr::{Addr32, Addr48, IpxAddr};

    fn test_addr(socket: u16) -> IpxAddr {
        IpxAddr::new(Addr32::from(1), Addr48::from(0x0a0b0c0d0e0f), socket)
    }

    #[test]
    fn header_layout() {
        let packet = pack_ipx_packet(5, test_addr(4567), test_addr(4568), b"hi");
        assert_eq!(packet.len(), 32);
        assert_eq!(&packet[0..2], &[0xff, 0xff]); // checksum sentinel
        assert_eq!(&packet[2..4], &[0, 32]); // length
        assert_eq!(packet[4], 0); // hops
        assert_eq!(packet[5], 5); // type
        assert_eq!(&packet[6..10], &[0, 0, 0, 1]); // dest net
        assert_eq!(&packet[16..18], &[0x11, 0xd8]); // dest socket 4568
        assert_eq!(&packet[28..30], &[0x11, 0xd7]); // src socket 4567
        assert_eq!(&packet[30..], b"hi");
    }

    #[test]
    fn packet_round_trip() {
        let payload = [7u8; 100];
        let packet = pack_ipx_packet(4, test_addr(1), test_addr(2), &payload);
        let (header, data) = unpack_ipx_packet(&packet).unwrap();
        assert_eq!(header.ptype, 4);
        assert_eq!(header.src, test_addr(1));
        assert_eq!(header.dest, test_addr(2));
        assert_eq!(data, &payload[..]);
    }

    #[test]
    fn unpack_rejects_bad_length() {
        let mut packet = pack_ipx_packet(0, test_addr(1), test_addr(2), b"abcd");
        packet[3] += 1;
        assert!(unpack_ipx_packet(&packet).is_none());
    }

    #[test]
    fn unpack_rejects_bad_checksum() {
        let mut packet = pack_ipx_packet(0, test_addr(1), test_addr(2), b"abcd");
        packet[0] = 0;
        assert!(unpack_ipx_packet(&packet).is_none());
    }

    #[test]
    fn unpack_rejects_short_buffer() {
        assert!(unpack_ipx_packet(&[0u8; 29]).is_none());
    }

    #[test]
    fn spx_records() {
        let req = SpxLookupReq {
            addr: test_addr(2000),
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(SpxLookupReq::from_bytes(&bytes), Some(req));

        let reply = SpxLookupReply {
            addr: test_addr(2000),
            port: 40000,
        };
        assert_eq!(SpxLookupReply::from_bytes(&reply.to_bytes()), Some(reply));
        assert!(SpxLookupReply::from_bytes(&bytes[..31]).is_none());

        let init = SpxInit {
            addr: test_addr(1060),
        };
        assert_eq!(SpxInit::from_bytes(&init.to_bytes()), Some(init));
    }
}
