use std::sync::Mutex;

use pcap::{Capture, Linktype};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("bad filter: {0}")]
    Compile(String),
}

/// One compiled BPF instruction as exposed to the validate RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u32,
    pub jt: u32,
    pub jf: u32,
    pub k: u32,
}

/// A tcpdump-syntax filter compiled once against link-type Ethernet.
///
/// Evaluation is pure and allocation-free; the mutex only exists because the
/// pcap crate's compiled program is not `Sync`, and it is uncontended (each
/// session's filter is evaluated from the single fan-out task).
pub struct BpfFilter {
    source: String,
    program: Mutex<pcap::BpfProgram>,
}

impl std::fmt::Debug for BpfFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpfFilter")
            .field("source", &self.source)
            .finish()
    }
}

impl BpfFilter {
    /// Compile `expr` for link-type Ethernet. The expression text is retained
    /// for reporting.
    pub fn compile(expr: &str) -> Result<BpfFilter, FilterError> {
        let program = compile_program(expr)?;
        Ok(BpfFilter {
            source: expr.to_string(),
            program: Mutex::new(program),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, frame: &[u8]) -> bool {
        match self.program.lock() {
            Ok(program) => program.filter(frame),
            Err(_) => false,
        }
    }

    pub fn instructions(&self) -> Vec<BpfInsn> {
        match self.program.lock() {
            Ok(program) => program.get_instructions().iter().map(parse_insn).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn compile_program(expr: &str) -> Result<pcap::BpfProgram, FilterError> {
    // A dead capture carries the 65535 snap length filters are compiled for.
    let cap = Capture::dead(Linktype::ETHERNET).map_err(|e| FilterError::Compile(e.to_string()))?;
    cap.compile(expr, true)
        .map_err(|e| FilterError::Compile(e.to_string()))
}

// The pcap crate only exposes compiled instructions through Display
// ("code jt jf k").
fn parse_insn(raw: &pcap::BpfInstruction) -> BpfInsn {
    let text = raw.to_string();
    let mut parts = text.split_whitespace().filter_map(|p| p.parse::<u32>().ok());
    BpfInsn {
        code: parts.next().unwrap_or(0),
        jt: parts.next().unwrap_or(0),
        jf: parts.next().unwrap_or(0),
        k: parts.next().unwrap_or(0),
    }
}

/// Compile without attaching. Returns `(valid, error_message, instructions)`;
/// the message is suitable for echoing back to the RPC caller verbatim.
pub fn validate(expr: &str) -> (bool, String, Vec<BpfInsn>) {
    match BpfFilter::compile(expr) {
        Ok(filter) => (true, String::new(), filter.instructions()),
        Err(e) => (false, e.to_string(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ethernet_ipv4_frame(protocol: u8, l4: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(14 + 20 + l4.len());
        frame.extend_from_slice(&[0x00; 6]); // dst MAC
        frame.extend_from_slice(&[0x01; 6]); // src MAC
        frame.extend_from_slice(&[0x08, 0x00]); // EtherType = IPv4
        let total_len = (20 + l4.len()) as u16;
        frame.extend_from_slice(&[0x45, 0x00]);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 0x40, protocol, 0x00, 0x00]);
        frame.extend_from_slice(&[10, 0, 0, 1]); // src IP
        frame.extend_from_slice(&[10, 0, 0, 2]); // dst IP
        frame.extend_from_slice(l4);
        frame
    }

    fn tcp_frame(dst_port: u16) -> Vec<u8> {
        let mut tcp = Vec::with_capacity(20);
        tcp.extend_from_slice(&1234u16.to_be_bytes());
        tcp.extend_from_slice(&dst_port.to_be_bytes());
        tcp.extend_from_slice(&[0x00; 8]); // seq + ack
        tcp.extend_from_slice(&[0x50, 0x02, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00]);
        ethernet_ipv4_frame(6, &tcp)
    }

    fn udp_frame() -> Vec<u8> {
        let mut udp = Vec::with_capacity(8);
        udp.extend_from_slice(&1234u16.to_be_bytes());
        udp.extend_from_slice(&5678u16.to_be_bytes());
        udp.extend_from_slice(&8u16.to_be_bytes());
        udp.extend_from_slice(&[0x00, 0x00]);
        ethernet_ipv4_frame(17, &udp)
    }

    #[test]
    fn test_compile_and_match_tcp() {
        let filter = BpfFilter::compile("tcp").unwrap();
        assert_eq!(filter.source(), "tcp");
        assert!(filter.matches(&tcp_frame(80)));
        assert!(!filter.matches(&udp_frame()));
    }

    #[test]
    fn test_match_tcp_port() {
        let filter = BpfFilter::compile("tcp port 80").unwrap();
        assert!(filter.matches(&tcp_frame(80)));
        assert!(!filter.matches(&tcp_frame(443)));
    }

    #[test]
    fn test_validate_good_filter() {
        let (valid, msg, bpf) = validate("tcp port 80");
        assert!(valid);
        assert!(msg.is_empty());
        assert!(!bpf.is_empty());
    }

    #[test]
    fn test_validate_bad_filter() {
        let (valid, msg, bpf) = validate("bad syntax (");
        assert!(!valid);
        assert!(!msg.is_empty());
        assert!(bpf.is_empty());
    }

    #[test]
    fn test_validate_is_pure() {
        let a = validate("tcp port 80");
        let b = validate("tcp port 80");
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
        assert_eq!(a.2, b.2);
    }
}
