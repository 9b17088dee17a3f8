//! Scripted transport and frame-building helpers shared by the unit tests of
//! this crate and by downstream crates' integration tests.

use std::collections::VecDeque;

use crate::{BulkTransport, TransportError, STATUS_MARKER};

/// A [`BulkTransport`] driven by a script of canned read buffers.
///
/// Reads pop the next scripted buffer; an exhausted script yields zero-byte
/// reads (a device-side timeout). All writes are recorded.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub reads: VecDeque<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&mut self, bytes: Vec<u8>) {
        self.reads.push_back(bytes);
    }
}

impl BulkTransport for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.reads.pop_front() {
            Some(bytes) => {
                assert!(
                    bytes.len() <= buf.len(),
                    "scripted read of {} bytes exceeds the {}-byte transfer buffer",
                    bytes.len(),
                    buf.len()
                );
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Ok(0),
        }
    }
}

/// Build a status word from up to seven slot nibbles (slot 0 first).
pub fn status_word(nibbles: &[u8]) -> u32 {
    assert!(nibbles.len() <= 7);
    let mut word = STATUS_MARKER;
    for (i, &nibble) in nibbles.iter().enumerate() {
        word |= u32::from(nibble & 0xF) << (4 * i);
    }
    word
}
