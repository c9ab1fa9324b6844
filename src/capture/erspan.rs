use pnet::packet::gre::GrePacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use thiserror::Error;

/// GRE protocol type carrying ERSPAN type II.
const ETHERTYPE_ERSPAN_II: u16 = 0x88BE;
/// Fixed ERSPAN type II header length following the GRE header.
const ERSPAN_II_HEADER_LEN: usize = 8;
/// Version nibble of an ERSPAN type II header.
const ERSPAN_II_VER: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated or invalid IPv4 header")]
    Ipv4,
    #[error("IPv4 protocol {0} is not GRE")]
    NotGre(u8),
    #[error("truncated GRE header")]
    Gre,
    #[error("GRE protocol {0:#06x} is not ERSPAN")]
    NotErspan(u16),
    #[error("truncated ERSPAN header")]
    Erspan,
    #[error("unsupported ERSPAN version nibble {0}")]
    UnsupportedVersion(u8),
}

/// The decoded interior of one raw GRE datagram.
#[derive(Debug)]
pub struct ErspanFrame<'a> {
    /// ERSPAN session id (10 bits).
    pub session_id: u16,
    /// Human-facing ERSPAN type; always 2 here.
    pub version: u8,
    /// The mirrored inner Ethernet frame.
    pub inner: &'a [u8],
}

/// Walk IPv4 -> GRE -> ERSPAN II and hand back the inner Ethernet frame.
/// Anything that is not well-formed ERSPAN type II is a decode error; type
/// III framing is deliberately treated as malformed until it is implemented.
pub fn decode(datagram: &[u8]) -> Result<ErspanFrame<'_>, DecodeError> {
    let ipv4 = Ipv4Packet::new(datagram).ok_or(DecodeError::Ipv4)?;
    let protocol = ipv4.get_next_level_protocol();
    if protocol != IpNextHeaderProtocols::Gre {
        return Err(DecodeError::NotGre(protocol.0));
    }
    let header_len = ipv4.get_header_length() as usize * 4;
    let gre_bytes = datagram.get(header_len..).ok_or(DecodeError::Ipv4)?;

    let gre = GrePacket::new(gre_bytes).ok_or(DecodeError::Gre)?;
    if gre.get_protocol_type() != ETHERTYPE_ERSPAN_II {
        return Err(DecodeError::NotErspan(gre.get_protocol_type()));
    }
    // Source routing never appears in ERSPAN encapsulation.
    if gre.get_routing_present() == 1 {
        return Err(DecodeError::Gre);
    }
    let mut gre_len = 4usize;
    if gre.get_checksum_present() == 1 {
        gre_len += 4;
    }
    if gre.get_key_present() == 1 {
        gre_len += 4;
    }
    if gre.get_sequence_present() == 1 {
        gre_len += 4;
    }

    let erspan = gre_bytes.get(gre_len..).ok_or(DecodeError::Gre)?;
    if erspan.len() < ERSPAN_II_HEADER_LEN {
        return Err(DecodeError::Erspan);
    }
    let ver = erspan[0] >> 4;
    if ver != ERSPAN_II_VER {
        return Err(DecodeError::UnsupportedVersion(ver));
    }
    let session_id = u16::from_be_bytes([erspan[2], erspan[3]]) & 0x03FF;

    Ok(ErspanFrame {
        session_id,
        version: 2,
        inner: &erspan[ERSPAN_II_HEADER_LEN..],
    })
}
