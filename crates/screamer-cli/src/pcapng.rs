//! Minimal PCAPNG capture writer.
//!
//! Writes one section with one interface of link type USER0 (147) carrying
//! raw TLP bytes, which is what the companion Wireshark dissector expects.
//! Timestamps are microseconds since the Unix epoch.

use std::io::{self, Write};

const LINKTYPE_USER0: u16 = 147;

const SHB_TYPE: u32 = 0x0A0D_0D0A;
const IDB_TYPE: u32 = 0x0000_0001;
const EPB_TYPE: u32 = 0x0000_0006;

const OPT_END: u16 = 0;
const OPT_SHB_USERAPPL: u16 = 4;
const OPT_IF_TSRESOL: u16 = 9;

/// Streams PCAPNG blocks to `out`; the section header and interface
/// description are written up front.
pub struct Capture<W: Write> {
    out: W,
}

impl<W: Write> Capture<W> {
    pub fn create(mut out: W) -> io::Result<Self> {
        out.write_all(&section_header_block("screamer scope"))?;
        out.write_all(&interface_description_block())?;
        Ok(Capture { out })
    }

    /// Append one captured TLP.
    pub fn record(&mut self, timestamp_us: u64, tlp: &[u8]) -> io::Result<()> {
        self.out.write_all(&enhanced_packet_block(timestamp_us, tlp))?;
        self.out.flush()
    }
}

fn section_header_block(user_appl: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x1A2B_3C4Du32.to_le_bytes()); // byte-order magic
    body.extend_from_slice(&1u16.to_le_bytes()); // major
    body.extend_from_slice(&0u16.to_le_bytes()); // minor
    body.extend_from_slice(&u64::MAX.to_le_bytes()); // section length: unspecified
    write_opt(&mut body, OPT_SHB_USERAPPL, user_appl.as_bytes());
    write_opt(&mut body, OPT_END, &[]);
    build_block(SHB_TYPE, &body)
}

fn interface_description_block() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&LINKTYPE_USER0.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // reserved
    body.extend_from_slice(&0u32.to_le_bytes()); // snaplen: unlimited
    write_opt(&mut body, OPT_IF_TSRESOL, &[6]); // 10^-6
    write_opt(&mut body, OPT_END, &[]);
    build_block(IDB_TYPE, &body)
}

fn enhanced_packet_block(timestamp_us: u64, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // interface id
    body.extend_from_slice(&((timestamp_us >> 32) as u32).to_le_bytes());
    body.extend_from_slice(&(timestamp_us as u32).to_le_bytes());
    let len = u32::try_from(payload.len()).expect("oversized capture payload");
    body.extend_from_slice(&len.to_le_bytes()); // captured length
    body.extend_from_slice(&len.to_le_bytes()); // original length
    body.extend_from_slice(payload);
    pad_to_32(&mut body);
    build_block(EPB_TYPE, &body)
}

fn build_block(block_type: u32, body: &[u8]) -> Vec<u8> {
    let total_len = (12 + body.len()) as u32;
    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(&block_type.to_le_bytes());
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&total_len.to_le_bytes());
    out
}

fn write_opt(out: &mut Vec<u8>, code: u16, val: &[u8]) {
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&u16::try_from(val.len()).expect("oversized option").to_le_bytes());
    out.extend_from_slice(val);
    pad_to_32(out);
}

fn pad_to_32(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}
