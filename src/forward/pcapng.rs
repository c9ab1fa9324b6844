use std::io::{self, Write};
use std::time::SystemTime;

use bytes::{BufMut, BytesMut};

use crate::types::StreamKey;

const SHB_TYPE: u32 = 0x0A0D_0D0A;
const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
const IDB_TYPE: u32 = 0x0000_0001;
const EPB_TYPE: u32 = 0x0000_0006;

const LINKTYPE_ETHERNET: u16 = 1;

const OPT_SHB_HARDWARE: u16 = 2;
const OPT_SHB_OS: u16 = 3;
const OPT_SHB_USERAPPL: u16 = 4;
const OPT_IF_NAME: u16 = 2;
const OPT_IF_DESCRIPTION: u16 = 3;
const OPT_IF_TSRESOL: u16 = 9;
const OPT_IF_FILTER: u16 = 11;
const OPT_IF_OS: u16 = 12;

const APPLICATION: &str = "erspan-hub";

/// Metadata for the single interface description block of a section.
pub struct InterfaceSpec {
    pub name: String,
    pub description: String,
    pub filter: String,
}

impl InterfaceSpec {
    pub fn for_stream(key: StreamKey, filter: &str) -> InterfaceSpec {
        InterfaceSpec {
            name: format!("erspan-{}-{}", key.src_ip, key.erspan_id),
            description: "erspan-hub mirrored stream".to_string(),
            filter: filter.to_string(),
        }
    }
}

/// Serializes a pcapng stream into an arbitrary byte sink: one section header
/// block, one interface description block, then an enhanced packet block per
/// frame. Timestamps are nanoseconds since the epoch; capture length equals
/// original length. A reused scratch buffer keeps the per-packet path free of
/// allocations.
pub struct PcapNgWriter<W: Write> {
    sink: W,
    scratch: BytesMut,
}

impl<W: Write> PcapNgWriter<W> {
    /// Writes the section header and interface description immediately.
    pub fn new(sink: W, iface: &InterfaceSpec) -> io::Result<Self> {
        let mut writer = PcapNgWriter {
            sink,
            scratch: BytesMut::with_capacity(4096),
        };
        writer.write_section_header()?;
        writer.write_interface_description(iface)?;
        Ok(writer)
    }

    pub fn write_packet(&mut self, ts: SystemTime, frame: &[u8]) -> io::Result<()> {
        let nanos = ts
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let (sink, scratch) = (&mut self.sink, &mut self.scratch);
        write_block(sink, scratch, EPB_TYPE, |body| {
            body.put_u32_le(0); // interface id
            body.put_u32_le((nanos >> 32) as u32);
            body.put_u32_le(nanos as u32);
            body.put_u32_le(frame.len() as u32); // captured length
            body.put_u32_le(frame.len() as u32); // original length
            body.put_slice(frame);
            body.put_bytes(0, pad_len(frame.len()));
        })
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }

    pub fn sink_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    fn write_section_header(&mut self) -> io::Result<()> {
        let (sink, scratch) = (&mut self.sink, &mut self.scratch);
        write_block(sink, scratch, SHB_TYPE, |body| {
            body.put_u32_le(BYTE_ORDER_MAGIC);
            body.put_u16_le(1); // major version
            body.put_u16_le(0); // minor version
            body.put_u64_le(u64::MAX); // section length: unspecified
            put_option(body, OPT_SHB_HARDWARE, std::env::consts::ARCH.as_bytes());
            put_option(body, OPT_SHB_OS, std::env::consts::OS.as_bytes());
            put_option(body, OPT_SHB_USERAPPL, APPLICATION.as_bytes());
            put_end_of_options(body);
        })
    }

    fn write_interface_description(&mut self, iface: &InterfaceSpec) -> io::Result<()> {
        let (sink, scratch) = (&mut self.sink, &mut self.scratch);
        write_block(sink, scratch, IDB_TYPE, |body| {
            body.put_u16_le(LINKTYPE_ETHERNET);
            body.put_u16_le(0); // reserved
            body.put_u32_le(0); // snap length: unlimited
            put_option(body, OPT_IF_NAME, iface.name.as_bytes());
            put_option(body, OPT_IF_DESCRIPTION, iface.description.as_bytes());
            put_option(body, OPT_IF_TSRESOL, &[9]); // 10^-9 seconds
            put_option(body, OPT_IF_OS, std::env::consts::OS.as_bytes());
            if !iface.filter.is_empty() {
                // First value octet 0 marks a capture filter string.
                let mut value = Vec::with_capacity(iface.filter.len() + 1);
                value.push(0);
                value.extend_from_slice(iface.filter.as_bytes());
                put_option(body, OPT_IF_FILTER, &value);
            }
            put_end_of_options(body);
        })
    }
}

/// Frame one block: type, total length, body, trailing total length. The
/// total length includes the 12 bytes of framing and is always a multiple of
/// four because every body is padded to 32 bits.
fn write_block<W: Write>(
    sink: &mut W,
    scratch: &mut BytesMut,
    block_type: u32,
    build: impl FnOnce(&mut BytesMut),
) -> io::Result<()> {
    scratch.clear();
    scratch.put_u32_le(block_type);
    scratch.put_u32_le(0); // patched once the body length is known
    build(scratch);
    let total = (scratch.len() + 4) as u32;
    scratch[4..8].copy_from_slice(&total.to_le_bytes());
    scratch.put_u32_le(total);
    sink.write_all(scratch)
}

fn put_option(body: &mut BytesMut, code: u16, value: &[u8]) {
    body.put_u16_le(code);
    body.put_u16_le(value.len() as u16);
    body.put_slice(value);
    body.put_bytes(0, pad_len(value.len()));
}

fn put_end_of_options(body: &mut BytesMut) {
    body.put_u16_le(0);
    body.put_u16_le(0);
}

fn pad_len(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn spec() -> InterfaceSpec {
        InterfaceSpec::for_stream(StreamKey::new(Ipv4Addr::new(10, 0, 0, 1), 7), "tcp")
    }

    /// Split an output buffer into (type, block bytes) pairs, verifying the
    /// redundant trailing lengths along the way.
    fn blocks(data: &[u8]) -> Vec<(u32, &[u8])> {
        let mut out = Vec::new();
        let mut off = 0;
        while off < data.len() {
            let block_type = u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
            let total = u32::from_le_bytes(data[off + 4..off + 8].try_into().unwrap()) as usize;
            assert_eq!(total % 4, 0, "block length must be 32-bit aligned");
            let trailer =
                u32::from_le_bytes(data[off + total - 4..off + total].try_into().unwrap());
            assert_eq!(trailer as usize, total, "leading and trailing lengths agree");
            out.push((block_type, &data[off..off + total]));
            off += total;
        }
        out
    }

    #[test]
    fn test_header_blocks() {
        let mut out = Vec::new();
        PcapNgWriter::new(&mut out, &spec()).unwrap();
        let blocks = blocks(&out);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, SHB_TYPE);
        assert_eq!(blocks[1].0, IDB_TYPE);

        let shb = blocks[0].1;
        assert_eq!(&shb[8..12], &[0x4D, 0x3C, 0x2B, 0x1A]);
        // link type Ethernet in the interface block
        let idb = blocks[1].1;
        assert_eq!(u16::from_le_bytes(idb[8..10].try_into().unwrap()), 1);
        // snap length unlimited
        assert_eq!(u32::from_le_bytes(idb[12..16].try_into().unwrap()), 0);
        // the filter text is embedded
        let text = String::from_utf8_lossy(idb);
        assert!(text.contains("tcp"));
        assert!(text.contains("erspan-10.0.0.1-7"));
    }

    #[test]
    fn test_packet_block_fields() {
        let mut out = Vec::new();
        let mut writer = PcapNgWriter::new(&mut out, &spec()).unwrap();
        let ts = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let frame = [0xAB_u8; 61]; // odd length exercises the padding
        writer.write_packet(ts, &frame).unwrap();
        writer.flush().unwrap();

        let blocks = blocks(&out);
        assert_eq!(blocks.len(), 3);
        let (block_type, epb) = blocks[2];
        assert_eq!(block_type, EPB_TYPE);

        assert_eq!(u32::from_le_bytes(epb[8..12].try_into().unwrap()), 0);
        let hi = u32::from_le_bytes(epb[12..16].try_into().unwrap());
        let lo = u32::from_le_bytes(epb[16..20].try_into().unwrap());
        let nanos = ((hi as u64) << 32) | lo as u64;
        assert_eq!(nanos, 1_700_000_000 * 1_000_000_000 + 123_456_789);
        // capture length equals original length; no truncation
        assert_eq!(u32::from_le_bytes(epb[20..24].try_into().unwrap()), 61);
        assert_eq!(u32::from_le_bytes(epb[24..28].try_into().unwrap()), 61);
        assert_eq!(&epb[28..28 + 61], &frame[..]);
    }

    #[test]
    fn test_packets_append_without_new_headers() {
        let mut out = Vec::new();
        let mut writer = PcapNgWriter::new(&mut out, &spec()).unwrap();
        for _ in 0..3 {
            writer.write_packet(SystemTime::now(), &[0u8; 64]).unwrap();
        }
        let blocks = blocks(&out);
        assert_eq!(blocks.len(), 5);
        assert!(blocks[2..].iter().all(|(t, _)| *t == EPB_TYPE));
    }

    #[test]
    fn test_empty_filter_omits_filter_option() {
        let mut out = Vec::new();
        let iface = InterfaceSpec::for_stream(StreamKey::new(Ipv4Addr::new(10, 0, 0, 1), 7), "");
        PcapNgWriter::new(&mut out, &iface).unwrap();
        let blocks = blocks(&out);
        let idb = blocks[1].1;
        // option code 11 never appears
        let mut off = 16; // past type/len/linktype/reserved/snaplen
        while off + 4 <= idb.len() - 4 {
            let code = u16::from_le_bytes(idb[off..off + 2].try_into().unwrap());
            let len = u16::from_le_bytes(idb[off + 2..off + 4].try_into().unwrap()) as usize;
            assert_ne!(code, OPT_IF_FILTER);
            if code == 0 {
                break;
            }
            off += 4 + len + super::pad_len(len);
        }
    }
}
