#![forbid(unsafe_code)]

//! Frame de-interleaver for the FPGA capture device's bulk stream.
//!
//! The device interleaves two substreams into its USB3 bulk-in pipe: framing
//! "status" words and raw data words. Words arrive in groups of eight; the
//! first word of each group is a status word whose low-order nibbles (4 bits
//! per following word, least-significant nibble first) classify each of the up
//! to seven words after it. [`TlpReceiver`] runs a four-state machine over
//! that stream and reassembles complete big-endian TLP word sequences,
//! surviving transport-buffer boundaries at any point.
//!
//! Framing-layer words (status words, filler) are little-endian on the wire;
//! TLP data words are big-endian and are accumulated as big-endian-decoded
//! dwords, which is what [`screamer_tlp`] consumes.

use std::num::NonZeroU32;

use thiserror::Error;
use tracing::{debug, warn};

pub mod testing;

/// One maximal TLP (16 header/digest bytes + 1024 payload bytes); also the
/// size of a single bulk-in transfer.
pub const RX_BUF_BYTES: usize = 16 + 1024;
pub const RX_BUF_DWS: usize = RX_BUF_BYTES / 4;

/// Reserved filler word the device pads the stream with; may appear before
/// any status word and consumes no status slot.
pub const FILLER_WORD: u32 = 0x5555_6666;

pub const STATUS_MARKER_MASK: u32 = 0xF000_0000;
pub const STATUS_MARKER: u32 = 0xE000_0000;

/// Slot nibble with the low two bits clear tags the word as PCIe TLP data.
const SLOT_TLP_MASK: u32 = 0b011;
/// Slot nibble pattern tagging the word as TLP data and last word of the TLP.
const SLOT_LAST_MASK: u32 = 0b111;
const SLOT_LAST: u32 = 0b100;

const SLOTS_PER_STATUS: u8 = 7;

/// Trailer byte closing every 8-byte record written to the device.
pub const RECORD_TRAILER: u8 = 0x77;
/// Command-byte flag marking the final dword of an outgoing TLP.
pub const TX_LAST_FLAG: u8 = 0x04;

/// Synchronous byte-in/byte-out bulk transport.
///
/// `read` fills as much of `buf` as one bulk transfer yields and may return 0
/// on a device-side timeout; that is not an error.
pub trait BulkTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bulk transfer failed: {0}")]
    Transfer(String),
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The transport kept returning zero bytes while a TLP was mid-accumulation
    /// and the configured [`EmptyReadPolicy`] bound was reached.
    #[error("transport stalled mid-TLP after {empty_reads} empty reads")]
    Stalled { empty_reads: u32 },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("TLP wire image length {len} is not dword-aligned or empty")]
    Unaligned { len: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("short bulk write: {written}/{len} bytes")]
    Short { written: usize, len: usize },
}

/// What to do when a bulk read returns zero bytes while a TLP is partially
/// accumulated. The capture hardware never signals "TLP abandoned", so the
/// reference implementation retried forever; `FailAfter` bounds that so the
/// process can shut down cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyReadPolicy {
    #[default]
    RetryForever,
    FailAfter(NonZeroU32),
}

/// Outcome of one [`TlpReceiver::receive`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlpEvent {
    /// Stream idle: the transport returned no bytes and no TLP was in flight.
    NoData,
    /// A status word's marker nibble was not 0xE. The receiver is back in the
    /// awaiting-status state; callers recover by simply calling again.
    OutOfSync,
    /// One complete TLP, as big-endian-decoded dwords.
    Complete(Vec<u32>),
    /// The collected word count disagreed with the header-declared length.
    /// The words are returned so callers can forward them to a diagnostic
    /// sink; the accumulator has been reset.
    Corrupt { words: Vec<u32>, expected: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingStatus,
    InData,
    InRemainder,
    TlpComplete,
}

/// TLP receive state machine.
///
/// Owns the raw transfer buffer and the word accumulator; the only state that
/// survives across transport reads is the small (state, status-field, slot)
/// triple, exactly as the framing requires.
pub struct TlpReceiver {
    state: State,
    status_field: u32,
    slot: u8,
    buf: Box<[u8; RX_BUF_BYTES]>,
    /// Word cursor into `buf`: consumed vs available.
    read: usize,
    end: usize,
    words: Vec<u32>,
    empty_policy: EmptyReadPolicy,
}

impl Default for TlpReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl TlpReceiver {
    pub fn new() -> Self {
        TlpReceiver {
            state: State::AwaitingStatus,
            status_field: 0,
            slot: 0,
            buf: Box::new([0u8; RX_BUF_BYTES]),
            read: 0,
            end: 0,
            words: Vec::with_capacity(RX_BUF_DWS),
            empty_policy: EmptyReadPolicy::default(),
        }
    }

    pub fn with_empty_read_policy(mut self, policy: EmptyReadPolicy) -> Self {
        self.empty_policy = policy;
        self
    }

    /// Framing-layer view of the word at cursor position `idx`.
    fn frame_word(&self, idx: usize) -> u32 {
        let b = &self.buf[idx * 4..idx * 4 + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// TLP data view of the word at cursor position `idx`.
    fn data_word(&self, idx: usize) -> u32 {
        let b = &self.buf[idx * 4..idx * 4 + 4];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Run the state machine until one TLP completes, the stream goes idle,
    /// or a framing problem is detected.
    ///
    /// Exactly one [`TlpEvent`] is produced per call. A zero-byte transport
    /// read is "stream idle" only when no TLP is being accumulated; mid-TLP it
    /// retries the transport per the configured [`EmptyReadPolicy`].
    pub fn receive<T: BulkTransport>(
        &mut self,
        transport: &mut T,
    ) -> Result<TlpEvent, ReceiveError> {
        self.words.clear();
        let mut expected_dws = 0usize;
        let mut header_seen = false;
        let mut overflowed = false;

        loop {
            if self.read == self.end {
                let mut empty_reads = 0u32;
                loop {
                    let n = transport.read(&mut self.buf[..])?;
                    if n % 4 != 0 {
                        warn!(bytes = n, "transfer size not aligned to 32 bits");
                    }
                    self.read = 0;
                    self.end = n / 4;
                    if self.end > 0 {
                        break;
                    }
                    if self.words.is_empty() {
                        // No partial TLP in flight: the stream is idle.
                        return Ok(TlpEvent::NoData);
                    }
                    empty_reads += 1;
                    if let EmptyReadPolicy::FailAfter(limit) = self.empty_policy {
                        if empty_reads >= limit.get() {
                            return Err(ReceiveError::Stalled { empty_reads });
                        }
                    }
                }
            }

            loop {
                match self.state {
                    State::AwaitingStatus => {
                        self.slot = 0;
                        while self.read < self.end && self.frame_word(self.read) == FILLER_WORD {
                            self.read += 1;
                        }
                        if self.read == self.end {
                            break;
                        }
                        let status = self.frame_word(self.read);
                        self.read += 1;
                        if status & STATUS_MARKER_MASK != STATUS_MARKER {
                            debug!(status = format_args!("{status:#010x}"), "status marker mismatch");
                            return Ok(TlpEvent::OutOfSync);
                        }
                        self.status_field = status;
                        self.state = State::InData;
                    }
                    State::InData => {
                        if self.slot == SLOTS_PER_STATUS {
                            self.state = State::AwaitingStatus;
                            continue;
                        }
                        if self.read == self.end {
                            break;
                        }
                        self.slot += 1;
                        if self.status_field & SLOT_TLP_MASK == 0 {
                            let dw = self.data_word(self.read);
                            self.read += 1;
                            if self.words.len() < RX_BUF_DWS {
                                self.words.push(dw);
                            } else {
                                overflowed = true;
                            }
                            if !header_seen {
                                let leader = screamer_tlp::leader_info(dw);
                                expected_dws += leader.len_dws();
                                if !leader.is_prefix() {
                                    header_seen = true;
                                }
                            }
                        }
                        if self.status_field & SLOT_LAST_MASK == SLOT_LAST {
                            self.state = State::TlpComplete;
                        }
                        self.status_field >>= 4;
                    }
                    State::InRemainder => {
                        if self.slot == SLOTS_PER_STATUS {
                            self.state = State::AwaitingStatus;
                            continue;
                        }
                        if self.read == self.end {
                            break;
                        }
                        // Word positions not tagged as PCIe traffic are
                        // consumed and dropped.
                        self.read += 1;
                        self.slot += 1;
                        self.status_field >>= 4;
                    }
                    State::TlpComplete => {
                        self.state = if self.status_field & SLOT_TLP_MASK == 0 {
                            State::InData
                        } else {
                            State::InRemainder
                        };
                        let words = std::mem::take(&mut self.words);
                        if !overflowed && words.len() == expected_dws {
                            return Ok(TlpEvent::Complete(words));
                        }
                        warn!(
                            expected = expected_dws,
                            actual = words.len(),
                            overflowed,
                            "TLP size disagrees with header-declared length"
                        );
                        return Ok(TlpEvent::Corrupt {
                            words,
                            expected: expected_dws,
                        });
                    }
                }
            }
        }
    }
}

/// Frame an already wire-ordered TLP byte image into the device's outgoing
/// 8-byte record format and submit it as one bulk write.
///
/// Each dword becomes `[d0 d1 d2 d3, 00, 00, cmd, 0x77]` where `cmd` carries
/// [`TX_LAST_FLAG`] on the final dword, mirroring the "last word" pattern the
/// receive framing uses.
pub fn send_tlp<T: BulkTransport>(transport: &mut T, wire: &[u8]) -> Result<(), SendError> {
    if wire.is_empty() || wire.len() % 4 != 0 {
        return Err(SendError::Unaligned { len: wire.len() });
    }
    let dwords = wire.len() / 4;
    let mut out = Vec::with_capacity(dwords * 8);
    for (i, chunk) in wire.chunks_exact(4).enumerate() {
        out.extend_from_slice(chunk);
        out.push(0x00);
        out.push(0x00);
        out.push(if i == dwords - 1 { TX_LAST_FLAG } else { 0x00 });
        out.push(RECORD_TRAILER);
    }
    let written = transport.write(&out)?;
    if written != out.len() {
        return Err(SendError::Short {
            written,
            len: out.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::testing::{status_word, ScriptedTransport};
    use super::*;

    /// A 3-dword CfgWr0 header with length 1, followed by one payload dword.
    fn cfg_wr_words(payload: u32) -> Vec<u32> {
        vec![0x4400_0001, 0x0100_0C0F, 0x0100_0800, payload]
    }

    /// Lay `words` out as one status group: status word then the data words,
    /// with the last word's slot tagged as last-of-TLP.
    fn one_group(words: &[u32]) -> Vec<u8> {
        assert!(words.len() <= 7);
        let mut nibbles = [0u8; 7];
        nibbles[words.len() - 1] = 0x4;
        let mut out = status_word(&nibbles).to_le_bytes().to_vec();
        for &w in words {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out
    }

    #[test]
    fn single_group_tlp_completes() {
        let words = cfg_wr_words(0x4100_0000);
        let mut t = ScriptedTransport::new();
        t.push_read(one_group(&words));

        let mut rx = TlpReceiver::new();
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::Complete(words));
    }

    #[test]
    fn filler_words_are_skipped() {
        let words = cfg_wr_words(0x0000_0000);
        let mut frame = Vec::new();
        frame.extend_from_slice(&FILLER_WORD.to_le_bytes());
        frame.extend_from_slice(&FILLER_WORD.to_le_bytes());
        frame.extend_from_slice(&one_group(&words));
        let mut t = ScriptedTransport::new();
        t.push_read(frame);

        let mut rx = TlpReceiver::new();
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::Complete(words));
    }

    #[test]
    fn tlp_split_across_transport_reads() {
        let words = cfg_wr_words(0xAABB_CCDD);
        let frame = one_group(&words);
        // Split mid-TLP, on a word boundary.
        let (a, b) = frame.split_at(8);
        let mut t = ScriptedTransport::new();
        t.push_read(a.to_vec());
        t.push_read(b.to_vec());

        let mut rx = TlpReceiver::new();
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::Complete(words));
    }

    #[test]
    fn empty_read_mid_tlp_retries() {
        let words = cfg_wr_words(0x0102_0304);
        let frame = one_group(&words);
        let (a, b) = frame.split_at(12);
        let mut t = ScriptedTransport::new();
        t.push_read(a.to_vec());
        t.push_read(Vec::new());
        t.push_read(Vec::new());
        t.push_read(b.to_vec());

        let mut rx = TlpReceiver::new();
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::Complete(words));
    }

    #[test]
    fn stall_bound_is_enforced() {
        let words = cfg_wr_words(0);
        let frame = one_group(&words);
        let mut t = ScriptedTransport::new();
        t.push_read(frame[..8].to_vec());
        // ScriptedTransport yields zero-byte reads once the script runs dry.

        let mut rx = TlpReceiver::new()
            .with_empty_read_policy(EmptyReadPolicy::FailAfter(NonZeroU32::new(3).unwrap()));
        match rx.receive(&mut t) {
            Err(ReceiveError::Stalled { empty_reads: 3 }) => {}
            other => panic!("expected stall, got {other:?}"),
        }
    }

    #[test]
    fn idle_stream_is_no_data() {
        let mut t = ScriptedTransport::new();
        let mut rx = TlpReceiver::new();
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::NoData);
    }

    #[test]
    fn bad_status_marker_is_out_of_sync_then_recovers() {
        let words = cfg_wr_words(0x4100_0000);
        let mut frame = 0x1234_5678u32.to_le_bytes().to_vec(); // marker nibble != 0xE
        frame.extend_from_slice(&one_group(&words));
        let mut t = ScriptedTransport::new();
        t.push_read(frame);

        let mut rx = TlpReceiver::new();
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::OutOfSync);
        // The very next call must decode the following well-formed TLP.
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::Complete(words));
    }

    #[test]
    fn length_mismatch_is_corrupt_and_state_recovers() {
        // Header declares one payload dword but "last" fires one word early.
        let bad = [0x4400_0001u32, 0x0100_0C0F, 0x0100_0800];
        let good = cfg_wr_words(0x5544_3322);
        // Slots after the truncated TLP are tagged non-PCIe; the remainder
        // state discards one raw word per remaining slot, so the group
        // carries four dummy words before the next status word.
        let mut frame = status_word(&[0, 0, 0x4, 1, 1, 1, 1]).to_le_bytes().to_vec();
        for &w in &bad {
            frame.extend_from_slice(&w.to_be_bytes());
        }
        for _ in 0..4 {
            frame.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        }
        frame.extend_from_slice(&one_group(&good));
        let mut t = ScriptedTransport::new();
        t.push_read(frame);

        let mut rx = TlpReceiver::new();
        match rx.receive(&mut t).unwrap() {
            TlpEvent::Corrupt { words, expected } => {
                assert_eq!(words, bad.to_vec());
                assert_eq!(expected, 4);
            }
            other => panic!("expected corrupt, got {other:?}"),
        }
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::Complete(good));
    }

    #[test]
    fn status_words_recur_every_eight_words() {
        // A 10-dword TLP (3 header + 7 payload) spans two status groups.
        let mut words = vec![0x4400_0007u32, 0x0100_0C0F, 0x0100_0800];
        words.extend((0..7).map(|i| 0x1000_0000 + i));

        let mut frame = status_word(&[0, 0, 0, 0, 0, 0, 0]).to_le_bytes().to_vec();
        for &w in &words[..7] {
            frame.extend_from_slice(&w.to_be_bytes());
        }
        let mut nibbles = [0u8; 7];
        nibbles[2] = 0x4; // last word of the TLP is the third of the group
        nibbles[3] = 0x1; // positions after the TLP are not PCIe traffic
        nibbles[4] = 0x1;
        frame.extend_from_slice(&status_word(&nibbles).to_le_bytes());
        for &w in &words[7..] {
            frame.extend_from_slice(&w.to_be_bytes());
        }
        // Two remainder words consumed by the InRemainder state.
        frame.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        frame.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());

        let mut t = ScriptedTransport::new();
        t.push_read(frame);

        let mut rx = TlpReceiver::new();
        assert_eq!(rx.receive(&mut t).unwrap(), TlpEvent::Complete(words));
    }

    #[test]
    fn send_tlp_frames_each_dword() {
        let mut t = ScriptedTransport::new();
        let wire = [0x44u8, 0x00, 0x00, 0x01, 0xAA, 0xBB, 0xCC, 0xDD];
        send_tlp(&mut t, &wire).unwrap();

        assert_eq!(t.writes.len(), 1);
        assert_eq!(
            t.writes[0],
            vec![
                0x44, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, RECORD_TRAILER, //
                0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00, TX_LAST_FLAG, RECORD_TRAILER,
            ]
        );
    }

    #[test]
    fn send_tlp_rejects_unaligned_images() {
        let mut t = ScriptedTransport::new();
        assert!(matches!(
            send_tlp(&mut t, &[1, 2, 3]),
            Err(SendError::Unaligned { len: 3 })
        ));
        assert!(matches!(
            send_tlp(&mut t, &[]),
            Err(SendError::Unaligned { len: 0 })
        ));
    }
}
