//! Register access to the capture device's internal 4KB configuration space.
//!
//! Register reads and writes travel over the same bulk pipes as the TLP
//! stream but use a simpler request/response protocol: each access is an
//! 8-byte record written to the device, and read responses come back inside
//! the interleaved status/data framing, matched by a 2-bit channel flag and a
//! big-endian address field rather than by the TLP state machine.

use std::thread;
use std::time::Duration;

use screamer_frame::{
    BulkTransport, TransportError, FILLER_WORD, RECORD_TRAILER, STATUS_MARKER, STATUS_MARKER_MASK,
};
use thiserror::Error;
use tracing::{debug, trace};

/// Size of the register space; addresses plus counts must stay inside it.
pub const REG_SPACE_BYTES: usize = 0x1000;

/// Region flags, carried in the top two bits of the wire address.
pub const REG_READONLY: u16 = 0x0000;
pub const REG_READWRITE: u16 = 0x8000;
pub const REG_SHADOWCFGSPACE: u16 = 0xC000;

/// Channel flags, carried in the low two bits of the command byte and echoed
/// back in the response status nibbles.
pub const CHANNEL_PCIE: u16 = 0x0001;
pub const CHANNEL_CORE: u16 = 0x0003;

const REGION_MASK: u16 = 0xC000;
const CHANNEL_MASK: u16 = 0x0003;

const CMD_READ: u8 = 0x10;
const CMD_WRITE: u8 = 0x20;

/// Request batches are flushed once they reach this many bytes.
const BATCH_FLUSH_BYTES: usize = 0x3F0;

/// One bulk-in transfer's worth of response stream to scan per read attempt.
const RESPONSE_BUF_BYTES: usize = 0x20000;

/// The device offers no completion signal for register reads; this delay is a
/// latency heuristic, not a protocol guarantee.
const RESPONSE_DELAY: Duration = Duration::from_millis(10);

/// How many bulk-in transfers to scan before giving up on missing responses.
const RESPONSE_READ_LIMIT: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("register range {address:#06x}+{count} exceeds the 4096-byte space")]
    OutOfRange { address: u16, count: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("short bulk write: {written}/{len} bytes")]
    Short { written: usize, len: usize },
    /// Fewer response bytes matched than were requested. The matched bytes
    /// are already in the output buffer; the rest are zero.
    #[error("incomplete register read: {filled}/{requested} bytes matched")]
    Incomplete { filled: usize, requested: usize },
}

/// Append one 8-byte request record.
fn push_record(batch: &mut Vec<u8>, data: [u8; 2], enables: [u8; 2], addr: u16, cmd: u8, flags: u16) {
    let flagged = addr | (flags & REGION_MASK);
    batch.extend_from_slice(&[
        data[0],
        data[1],
        enables[0],
        enables[1],
        (flagged >> 8) as u8,
        (flagged & 0xFF) as u8,
        cmd | (flags & CHANNEL_MASK) as u8,
        RECORD_TRAILER,
    ]);
}

fn flush<T: BulkTransport>(transport: &mut T, batch: &mut Vec<u8>) -> Result<(), ConfigError> {
    if batch.is_empty() {
        return Ok(());
    }
    let written = transport.write(batch)?;
    if written != batch.len() {
        return Err(ConfigError::Short {
            written,
            len: batch.len(),
        });
    }
    batch.clear();
    Ok(())
}

/// Write `data` to the register space starting at `address`.
///
/// Registers are addressed in 2-byte pairs; an odd starting address is
/// handled by an aligned-down record that byte-enables only the high lane.
pub fn config_write<T: BulkTransport>(
    transport: &mut T,
    address: u16,
    data: &[u8],
    flags: u16,
) -> Result<(), ConfigError> {
    let count = data.len();
    if count == 0 || address as usize + count > REG_SPACE_BYTES {
        return Err(ConfigError::OutOfRange { address, count });
    }

    let mut batch = Vec::with_capacity(BATCH_FLUSH_BYTES);
    let mut i = 0usize;
    if address % 2 != 0 {
        push_record(
            &mut batch,
            [0x00, data[0]],
            [0x00, 0xFF],
            address - 1,
            CMD_WRITE,
            flags,
        );
        i = 1;
    }
    while i < count {
        let last = i + 1 == count;
        push_record(
            &mut batch,
            [data[i], if last { 0 } else { data[i + 1] }],
            [0xFF, if last { 0 } else { 0xFF }],
            address + i as u16,
            CMD_WRITE,
            flags,
        );
        i += 2;
        if batch.len() >= BATCH_FLUSH_BYTES {
            flush(transport, &mut batch)?;
        }
    }
    flush(transport, &mut batch)
}

/// Read `out.len()` bytes of the register space starting at `address`.
///
/// Issues one read request per 2-byte-aligned register pair, waits out the
/// device's response latency, then scans bulk-in transfers for matching
/// response words. Bytes that never get a matching response are left zeroed
/// and reported via [`ConfigError::Incomplete`].
pub fn config_read<T: BulkTransport>(
    transport: &mut T,
    address: u16,
    out: &mut [u8],
    flags: u16,
) -> Result<(), ConfigError> {
    let count = out.len();
    if count == 0 || address as usize + count > REG_SPACE_BYTES {
        return Err(ConfigError::OutOfRange { address, count });
    }
    out.fill(0);

    let mut batch = Vec::with_capacity(BATCH_FLUSH_BYTES);
    let mut cur = address & 0xFFFE;
    while (cur as usize) < address as usize + count {
        push_record(&mut batch, [0, 0], [0, 0], cur, CMD_READ, flags);
        cur += 2;
        if batch.len() >= BATCH_FLUSH_BYTES {
            flush(transport, &mut batch)?;
        }
    }
    flush(transport, &mut batch)?;

    thread::sleep(RESPONSE_DELAY);

    let mut filled = vec![false; count];
    let mut buf = vec![0u8; RESPONSE_BUF_BYTES];
    for attempt in 0..RESPONSE_READ_LIMIT {
        let n = transport.read(&mut buf)?;
        scan_responses(&buf[..n], address, flags, out, &mut filled);
        if filled.iter().all(|&f| f) {
            return Ok(());
        }
        trace!(attempt, "register read responses still incomplete");
        if n == 0 {
            break;
        }
    }
    Err(ConfigError::Incomplete {
        filled: filled.iter().filter(|&&f| f).count(),
        requested: count,
    })
}

/// Scan one raw bulk-in transfer for register-read responses.
///
/// The stream is the usual 8-word framing: a status word (marker nibble 0xE)
/// followed by seven data words. A data word is a response for us when its
/// status nibble's low bits equal the request's channel flag; it then carries
/// a big-endian flagged address in its first two bytes and the register pair's
/// value in the last two. The address relative to the request base places the
/// bytes in `out`; the sentinel offset `0xFFFF` is the aligned-down pair of an
/// odd-address read, whose high lane is the caller's first byte.
fn scan_responses(raw: &[u8], address: u16, flags: u16, out: &mut [u8], filled: &mut [bool]) {
    let count = out.len();
    let base = (flags & REGION_MASK).wrapping_add(address);
    let mut i = 0usize;
    while i + 32 <= raw.len() {
        let word = u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        if word == FILLER_WORD {
            i += 4;
            continue;
        }
        if word & STATUS_MARKER_MASK != STATUS_MARKER {
            i += 32;
            continue;
        }
        let mut status = word;
        for j in 0..7 {
            let rec = &raw[i + 4 + j * 4..i + 8 + j * 4];
            let matched = (status & 0x0F) as u16 == flags & CHANNEL_MASK;
            status >>= 4;
            if !matched {
                continue;
            }
            let addr = u16::from_be_bytes([rec[0], rec[1]]);
            let rel = addr.wrapping_sub(base) as usize;
            if rel == 0xFFFF {
                // Aligned-down pair of an odd-address read: only the high
                // lane belongs to the caller, as the first output byte.
                out[0] = rec[3];
                filled[0] = true;
                continue;
            }
            if rel >= count {
                debug!(addr, rel, "register response out of requested range");
                continue;
            }
            out[rel] = rec[2];
            filled[rel] = true;
            if rel + 1 < count {
                out[rel + 1] = rec[3];
                filled[rel + 1] = true;
            }
        }
        i += 32;
    }
}
