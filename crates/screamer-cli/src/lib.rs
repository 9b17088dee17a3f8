#![forbid(unsafe_code)]

//! Application layer for the capture tools: the console completion logic and
//! the sinks the `sac` and `scope` binaries forward TLPs to.

pub mod console;
pub mod hexdump;
pub mod netdump;
pub mod pcapng;
pub mod term;

/// Flatten big-endian-decoded TLP dwords back into wire bytes.
pub fn wire_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for &w in words {
        out.extend_from_slice(&screamer_tlp::dword_to_wire(w));
    }
    out
}
