//! Packing and unpacking IPX packets inside Ethernet frames.
//!
//! Three layouts are supported: Ethernet II with the IPX ethertype, "raw"
//! 802.3 as Novell shipped it, and 802.3 with an 802.2 LLC header. The
//! carrier picks one codec from configuration and uses it for every frame,
//! mixed frame types on one wire are not supported.

use addr::{Addr48, IpxAddr};
use config::FrameType;
use packet::{IpxHeader, IPX_HEADER_SIZE};

pub const ETHERTYPE_IPX: u16 = 0x8137;

/// MTU assumed for every capture interface.
pub const ETHERNET_MTU: usize = 1500;

const ETH_HEADER_SIZE: usize = 14;
const LLC_HEADER_SIZE: usize = 3;
const LLC_SAP_NETWARE: u8 = 0xe0;

/// Largest payload the 16 bit IPX length field can describe.
const MAX_IPX_PAYLOAD: usize = 0xffff - IPX_HEADER_SIZE;

/// One Ethernet frame layout.
///
/// `frame_size` returns the size of a whole frame holding `payload_len`
/// bytes of IPX payload, or `None` when the payload cannot fit in this
/// format. `pack` serialises into a buffer of at least that size. `unpack`
/// returns the embedded IPX packet (header plus payload, trimmed to the
/// frame's idea of its length) or `None` for frames that are not valid IPX
/// in this format.
pub trait FrameCodec: Send + Sync {
    fn frame_size(&self, payload_len: usize) -> Option<usize>;

    fn pack(&self, buf: &mut [u8], ptype: u8, src: IpxAddr, dest: IpxAddr, payload: &[u8]);

    fn unpack<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]>;
}

impl FrameType {
    pub fn codec(self) -> &'static dyn FrameCodec {
        match self {
            FrameType::EthernetII => &EthernetII,
            FrameType::NovellRaw => &NovellRaw,
            FrameType::Llc => &Llc,
        }
    }

    /// Convenience wrapper allocating and packing a frame in one go.
    pub fn pack_frame(
        self,
        ptype: u8,
        src: IpxAddr,
        dest: IpxAddr,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let codec = self.codec();
        let size = codec.frame_size(payload.len())?;
        let mut buf = vec![0u8; size];
        codec.pack(&mut buf, ptype, src, dest, payload);
        Some(buf)
    }

    /// The largest application payload this frame type can carry.
    pub fn max_payload(self) -> usize {
        match self {
            FrameType::EthernetII => MAX_IPX_PAYLOAD,
            FrameType::NovellRaw => ETHERNET_MTU - IPX_HEADER_SIZE,
            FrameType::Llc => ETHERNET_MTU - LLC_HEADER_SIZE - IPX_HEADER_SIZE,
        }
    }
}

fn write_eth_header(buf: &mut [u8], src: Addr48, dest: Addr48, type_or_len: u16) {
    buf[0..6].copy_from_slice(&dest.to_wire());
    buf[6..12].copy_from_slice(&src.to_wire());
    buf[12] = (type_or_len >> 8) as u8;
    buf[13] = type_or_len as u8;
}

fn write_ipx(buf: &mut [u8], ptype: u8, src: IpxAddr, dest: IpxAddr, payload: &[u8]) {
    let header = IpxHeader {
        length: (IPX_HEADER_SIZE + payload.len()) as u16,
        ptype: ptype,
        dest: dest,
        src: src,
    };
    header.write(buf);
    buf[IPX_HEADER_SIZE..IPX_HEADER_SIZE + payload.len()].copy_from_slice(payload);
}

/// Ethernet II: 14 byte header with ethertype 0x8137, then the IPX packet.
pub struct EthernetII;

impl FrameCodec for EthernetII {
    fn frame_size(&self, payload_len: usize) -> Option<usize> {
        if payload_len > MAX_IPX_PAYLOAD {
            return None;
        }
        Some(ETH_HEADER_SIZE + IPX_HEADER_SIZE + payload_len)
    }

    fn pack(&self, buf: &mut [u8], ptype: u8, src: IpxAddr, dest: IpxAddr, payload: &[u8]) {
        write_eth_header(buf, src.node, dest.node, ETHERTYPE_IPX);
        write_ipx(&mut buf[ETH_HEADER_SIZE..], ptype, src, dest, payload);
    }

    fn unpack<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        if frame.len() < ETH_HEADER_SIZE + IPX_HEADER_SIZE {
            return None;
        }
        let ethertype = (frame[12] as u16) << 8 | frame[13] as u16;
        if ethertype != ETHERTYPE_IPX {
            return None;
        }
        Some(&frame[ETH_HEADER_SIZE..])
    }
}

/// Novell "raw" 802.3: the two bytes after the MACs are the payload length
/// and the IPX packet follows with no intervening LLC header.
pub struct NovellRaw;

impl FrameCodec for NovellRaw {
    fn frame_size(&self, payload_len: usize) -> Option<usize> {
        if payload_len > MAX_IPX_PAYLOAD || IPX_HEADER_SIZE + payload_len > ETHERNET_MTU {
            return None;
        }
        Some(ETH_HEADER_SIZE + IPX_HEADER_SIZE + payload_len)
    }

    fn pack(&self, buf: &mut [u8], ptype: u8, src: IpxAddr, dest: IpxAddr, payload: &[u8]) {
        write_eth_header(
            buf,
            src.node,
            dest.node,
            (IPX_HEADER_SIZE + payload.len()) as u16,
        );
        write_ipx(&mut buf[ETH_HEADER_SIZE..], ptype, src, dest, payload);
    }

    fn unpack<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        if frame.len() < ETH_HEADER_SIZE + IPX_HEADER_SIZE {
            return None;
        }
        let length = ((frame[12] as u16) << 8 | frame[13] as u16) as usize;
        if length > ETHERNET_MTU {
            // Almost certainly an Ethernet II frame.
            return None;
        }
        if length < IPX_HEADER_SIZE {
            return None;
        }
        if length > frame.len() - ETH_HEADER_SIZE {
            // Truncated frame.
            return None;
        }
        Some(&frame[ETH_HEADER_SIZE..ETH_HEADER_SIZE + length])
    }
}

/// 802.3 with an 802.2 LLC header addressing the Netware SAP.
pub struct Llc;

impl FrameCodec for Llc {
    fn frame_size(&self, payload_len: usize) -> Option<usize> {
        if payload_len > MAX_IPX_PAYLOAD
            || LLC_HEADER_SIZE + IPX_HEADER_SIZE + payload_len > ETHERNET_MTU
        {
            return None;
        }
        Some(ETH_HEADER_SIZE + LLC_HEADER_SIZE + IPX_HEADER_SIZE + payload_len)
    }

    fn pack(&self, buf: &mut [u8], ptype: u8, src: IpxAddr, dest: IpxAddr, payload: &[u8]) {
        write_eth_header(
            buf,
            src.node,
            dest.node,
            (LLC_HEADER_SIZE + IPX_HEADER_SIZE + payload.len()) as u16,
        );
        buf[14] = LLC_SAP_NETWARE;
        buf[15] = LLC_SAP_NETWARE;
        buf[16] = 0x03; // unnumbered information
        write_ipx(
            &mut buf[ETH_HEADER_SIZE + LLC_HEADER_SIZE..],
            ptype,
            src,
            dest,
            payload,
        );
    }

    fn unpack<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        if frame.len() < ETH_HEADER_SIZE + LLC_HEADER_SIZE + IPX_HEADER_SIZE {
            return None;
        }
        let length = ((frame[12] as u16) << 8 | frame[13] as u16) as usize;
        if length > ETHERNET_MTU {
            return None;
        }
        if length < LLC_HEADER_SIZE + IPX_HEADER_SIZE {
            return None;
        }
        if length > frame.len() - ETH_HEADER_SIZE {
            return None;
        }
        if frame[14] != LLC_SAP_NETWARE || frame[15] != LLC_SAP_NETWARE {
            return None;
        }
        if frame[16] != 0x03 {
            // Some link layer control message, not for us.
            return None;
        }
        Some(&frame[ETH_HEADER_SIZE + LLC_HEADER_SIZE..ETH_HEADER_SIZE + length])
    }
}
