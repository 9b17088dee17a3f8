#![forbid(unsafe_code)]

//! PCI Express Transaction Layer Packet (TLP) codec.
//!
//! Wire TLPs are sequences of big-endian 32-bit words. Throughout this crate a
//! "dword" `u32` is the big-endian decode of four wire bytes, so byte lane 0
//! of the packet sits in bits 31:24. Header fields are accessed with explicit
//! shift/mask helpers; payload dwords are carried through opaquely.
//!
//! The codec never trusts caller-supplied totals: the header word count and
//! payload length are always recomputed from the leading header word.

/// Maximum TLP payload length in dwords (length field value 0 encodes 1024).
pub const MAX_PAYLOAD_DWS: usize = 1024;

/// fmt/type byte values (bits 31:24 of the first header dword).
pub const FMT_TYPE_MRD32: u8 = 0x00;
pub const FMT_TYPE_MRD64: u8 = 0x20;
pub const FMT_TYPE_MWR32: u8 = 0x40;
pub const FMT_TYPE_MWR64: u8 = 0x60;
pub const FMT_TYPE_IORD: u8 = 0x02;
pub const FMT_TYPE_IOWR: u8 = 0x42;
pub const FMT_TYPE_CFG_RD0: u8 = 0x04;
pub const FMT_TYPE_CFG_WR0: u8 = 0x44;
pub const FMT_TYPE_CPL: u8 = 0x0A;
pub const FMT_TYPE_CPL_D: u8 = 0x4A;

/// Completion status codes (bits 15:13 of the completion header's second dword).
pub const CPL_STATUS_SUCCESS: u8 = 0b000;
pub const CPL_STATUS_UNSUPPORTED_REQUEST: u8 = 0b001;
pub const CPL_STATUS_COMPLETER_ABORT: u8 = 0b100;

const FMT_PREFIX: u32 = 0b100;
const FMT_4DW: u32 = 0b001;
const FMT_WITH_DATA: u32 = 0b010;

/// Decode four wire bytes into a host-order dword.
pub fn dword_from_wire(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Encode a host-order dword back into wire byte order.
pub fn dword_to_wire(dw: u32) -> [u8; 4] {
    dw.to_be_bytes()
}

/// Byte lane `lane` (0..4) of a dword; lane 0 is the first byte on the wire.
pub fn byte_lane(dw: u32, lane: usize) -> u8 {
    debug_assert!(lane < 4);
    (dw >> (24 - 8 * lane)) as u8
}

/// Structural classification of a TLP's leading dword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leader {
    /// A TLP prefix dword. Consumes one word and carries no payload; the real
    /// header follows.
    Prefix,
    Header {
        /// Header length in dwords (3 or 4).
        header_dws: usize,
        /// Payload length in dwords (0 for formats without data).
        payload_dws: usize,
        /// Whether a trailing end-to-end CRC dword follows the payload.
        digest: bool,
    },
}

impl Leader {
    /// Total dwords this leader accounts for: 1 for a prefix, otherwise
    /// header + payload + optional digest.
    pub fn len_dws(&self) -> usize {
        match *self {
            Leader::Prefix => 1,
            Leader::Header {
                header_dws,
                payload_dws,
                digest,
            } => header_dws + payload_dws + usize::from(digest),
        }
    }

    pub fn is_prefix(&self) -> bool {
        matches!(self, Leader::Prefix)
    }
}

/// Classify a leading header dword without decoding the full TLP.
///
/// Callable repeatedly over a word stream: every `Prefix` result consumes one
/// word and the next word must be classified again until a `Header` is found.
pub fn leader_info(dw0: u32) -> Leader {
    let fmt = (dw0 >> 29) & 0b111;
    if fmt == FMT_PREFIX {
        return Leader::Prefix;
    }

    let header_dws = if fmt & FMT_4DW != 0 { 4 } else { 3 };
    let payload_dws = if fmt & FMT_WITH_DATA != 0 {
        match (dw0 & 0x3ff) as usize {
            0 => MAX_PAYLOAD_DWS,
            len => len,
        }
    } else {
        0
    };

    Leader::Header {
        header_dws,
        payload_dws,
        digest: dw0 & (1 << 15) != 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer words available than the header (or its prefixes) declare.
    Truncated { have: usize, need: usize },
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::Truncated { have, need } => {
                write!(f, "truncated TLP: {have} dwords available, {need} needed")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Destination buffer smaller than the computed header span.
    BufferTooSmall { have: usize, need: usize },
    /// The struct's fmt field encodes a prefix, which is not an encodable
    /// header.
    PrefixFmt,
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EncodeError::BufferTooSmall { have, need } => {
                write!(f, "encode buffer too small: {have} bytes, {need} needed")
            }
            EncodeError::PrefixFmt => write!(f, "fmt field encodes a TLP prefix, not a header"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// A host-order TLP header (3 or 4 dwords; the unused fourth dword of a
/// 3-dword header is zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tlp {
    dw: [u32; 4],
}

impl Tlp {
    pub fn new(fmt_type: u8) -> Self {
        let mut tlp = Tlp::default();
        tlp.set_fmt_type(fmt_type);
        tlp
    }

    pub fn from_dws(dw: [u32; 4]) -> Self {
        Tlp { dw }
    }

    pub fn dws(&self) -> &[u32; 4] {
        &self.dw
    }

    /// Header length in dwords, recomputed from the fmt field.
    pub fn header_dws(&self) -> Result<usize, EncodeError> {
        match leader_info(self.dw[0]) {
            Leader::Prefix => Err(EncodeError::PrefixFmt),
            Leader::Header { header_dws, .. } => Ok(header_dws),
        }
    }

    // Common header fields (first dword).

    pub fn fmt_type(&self) -> u8 {
        (self.dw[0] >> 24) as u8
    }

    pub fn set_fmt_type(&mut self, fmt_type: u8) {
        self.dw[0] = (self.dw[0] & 0x00ff_ffff) | (u32::from(fmt_type) << 24);
    }

    pub fn tc(&self) -> u8 {
        ((self.dw[0] >> 20) & 0x7) as u8
    }

    pub fn set_tc(&mut self, tc: u8) {
        self.dw[0] = (self.dw[0] & !(0x7 << 20)) | (u32::from(tc & 0x7) << 20);
    }

    pub fn td(&self) -> bool {
        self.dw[0] & (1 << 15) != 0
    }

    pub fn set_td(&mut self, td: bool) {
        if td {
            self.dw[0] |= 1 << 15;
        } else {
            self.dw[0] &= !(1 << 15);
        }
    }

    pub fn attr(&self) -> u8 {
        ((self.dw[0] >> 12) & 0x3) as u8
    }

    pub fn set_attr(&mut self, attr: u8) {
        self.dw[0] = (self.dw[0] & !(0x3 << 12)) | (u32::from(attr & 0x3) << 12);
    }

    /// Payload length field in dwords. The on-wire value 0 encodes 1024; this
    /// accessor returns the raw field.
    pub fn length(&self) -> u16 {
        (self.dw[0] & 0x3ff) as u16
    }

    pub fn set_length(&mut self, len: u16) {
        self.dw[0] = (self.dw[0] & !0x3ff) | u32::from(len & 0x3ff);
    }

    // Configuration request view (second and third dwords).

    pub fn cfg_requester_id(&self) -> u16 {
        (self.dw[1] >> 16) as u16
    }

    pub fn set_cfg_requester_id(&mut self, rid: u16) {
        self.dw[1] = (self.dw[1] & 0x0000_ffff) | (u32::from(rid) << 16);
    }

    pub fn cfg_tag(&self) -> u8 {
        (self.dw[1] >> 8) as u8
    }

    pub fn set_cfg_tag(&mut self, tag: u8) {
        self.dw[1] = (self.dw[1] & !0xff00) | (u32::from(tag) << 8);
    }

    pub fn cfg_last_be(&self) -> u8 {
        ((self.dw[1] >> 4) & 0xf) as u8
    }

    pub fn cfg_first_be(&self) -> u8 {
        (self.dw[1] & 0xf) as u8
    }

    pub fn set_cfg_byte_enables(&mut self, first: u8, last: u8) {
        self.dw[1] =
            (self.dw[1] & !0xff) | (u32::from(last & 0xf) << 4) | u32::from(first & 0xf);
    }

    pub fn cfg_completer_id(&self) -> u16 {
        (self.dw[2] >> 16) as u16
    }

    pub fn set_cfg_completer_id(&mut self, cid: u16) {
        self.dw[2] = (self.dw[2] & 0x0000_ffff) | (u32::from(cid) << 16);
    }

    /// Byte offset into the 4096-byte configuration space:
    /// `(ext_reg_num << 8) | (reg_num << 2)`.
    pub fn cfg_register_offset(&self) -> u16 {
        (self.dw[2] & 0xffc) as u16
    }

    pub fn set_cfg_register_offset(&mut self, offset: u16) {
        self.dw[2] = (self.dw[2] & !0xfff) | u32::from(offset & 0xffc);
    }

    // Completion view (second and third dwords).

    pub fn cpl_completer_id(&self) -> u16 {
        (self.dw[1] >> 16) as u16
    }

    pub fn set_cpl_completer_id(&mut self, cid: u16) {
        self.dw[1] = (self.dw[1] & 0x0000_ffff) | (u32::from(cid) << 16);
    }

    pub fn cpl_status(&self) -> u8 {
        ((self.dw[1] >> 13) & 0x7) as u8
    }

    pub fn set_cpl_status(&mut self, status: u8) {
        self.dw[1] = (self.dw[1] & !(0x7 << 13)) | (u32::from(status & 0x7) << 13);
    }

    pub fn cpl_byte_count(&self) -> u16 {
        (self.dw[1] & 0xfff) as u16
    }

    pub fn set_cpl_byte_count(&mut self, count: u16) {
        self.dw[1] = (self.dw[1] & !0xfff) | u32::from(count & 0xfff);
    }

    pub fn cpl_requester_id(&self) -> u16 {
        (self.dw[2] >> 16) as u16
    }

    pub fn set_cpl_requester_id(&mut self, rid: u16) {
        self.dw[2] = (self.dw[2] & 0x0000_ffff) | (u32::from(rid) << 16);
    }

    pub fn cpl_tag(&self) -> u8 {
        (self.dw[2] >> 8) as u8
    }

    pub fn set_cpl_tag(&mut self, tag: u8) {
        self.dw[2] = (self.dw[2] & !0xff00) | (u32::from(tag) << 8);
    }

    pub fn cpl_lower_address(&self) -> u8 {
        (self.dw[2] & 0x7f) as u8
    }

    /// Decode a reconstructed wire word sequence.
    ///
    /// Skips leading prefix dwords, byte-order-converts exactly the header
    /// span into the returned struct and borrows the payload (still opaque
    /// dwords) from the input.
    pub fn decode(words: &[u32]) -> Result<Decoded<'_>, DecodeError> {
        let mut idx = 0;
        loop {
            let Some(&leader) = words.get(idx) else {
                return Err(DecodeError::Truncated {
                    have: words.len(),
                    need: idx + 1,
                });
            };
            match leader_info(leader) {
                Leader::Prefix => idx += 1,
                Leader::Header {
                    header_dws,
                    payload_dws,
                    digest,
                } => {
                    let need = idx + header_dws + payload_dws + usize::from(digest);
                    if words.len() < need {
                        return Err(DecodeError::Truncated {
                            have: words.len(),
                            need,
                        });
                    }
                    let mut dw = [0u32; 4];
                    dw[..header_dws].copy_from_slice(&words[idx..idx + header_dws]);
                    let payload_start = idx + header_dws;
                    return Ok(Decoded {
                        prefixes: &words[..idx],
                        tlp: Tlp { dw },
                        payload: &words[payload_start..payload_start + payload_dws],
                        digest: digest.then(|| words[need - 1]),
                    });
                }
            }
        }
    }

    /// Write the header span in wire byte order; returns the number of bytes
    /// written so the caller can append payload words after it.
    pub fn write_header(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        let header_dws = self.header_dws()?;
        let need = header_dws * 4;
        if out.len() < need {
            return Err(EncodeError::BufferTooSmall {
                have: out.len(),
                need,
            });
        }
        for (i, chunk) in out[..need].chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&self.dw[i].to_be_bytes());
        }
        Ok(need)
    }

    /// Encode header plus payload into a fresh wire byte vector.
    pub fn encode(&self, payload: &[u32]) -> Result<Vec<u8>, EncodeError> {
        let header_dws = self.header_dws()?;
        let mut out = vec![0u8; (header_dws + payload.len()) * 4];
        let written = self.write_header(&mut out)?;
        for (i, &dw) in payload.iter().enumerate() {
            out[written + i * 4..written + i * 4 + 4].copy_from_slice(&dw.to_be_bytes());
        }
        Ok(out)
    }
}

/// Result of [`Tlp::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded<'a> {
    /// Prefix dwords preceding the header, in wire order.
    pub prefixes: &'a [u32],
    pub tlp: Tlp,
    /// Payload dwords, byte-order-opaque.
    pub payload: &'a [u32],
    /// Trailing end-to-end CRC dword, if the TD bit was set.
    pub digest: Option<u32>,
}
