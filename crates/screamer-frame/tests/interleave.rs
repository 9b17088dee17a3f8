//! Property test: for arbitrary interleavings of 1..=7 TLP words per status
//! group, with filler words and transport-read splits at arbitrary word
//! boundaries, the receiver emits exactly one `Complete` carrying the injected
//! data words in order, excluding all status and filler words.

use proptest::prelude::*;
use screamer_frame::testing::{status_word, ScriptedTransport};
use screamer_frame::{TlpEvent, TlpReceiver, FILLER_WORD};

/// A CfgWr0-shaped TLP: 3 header dwords plus `payload`.
fn tlp_words(payload: &[u32]) -> Vec<u32> {
    let mut words = vec![
        0x4400_0000 | payload.len() as u32,
        0x0100_0C0F,
        0x0100_0200,
    ];
    words.extend_from_slice(payload);
    words
}

/// Interleave `words` into status groups. Group `g` carries
/// `data_per_group[g % ..]` TLP words in its leading slots; the remaining
/// slots are tagged non-PCIe (and carry no raw word). A filler word may
/// precede any status word. The final data word's slot is tagged "last".
fn build_stream(words: &[u32], data_per_group: &[u8], fillers: &[bool]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut idx = 0;
    let mut group = 0usize;
    while idx < words.len() {
        let k = usize::from(data_per_group[group % data_per_group.len()]).min(words.len() - idx);
        if fillers[group % fillers.len()] {
            out.extend_from_slice(&FILLER_WORD.to_le_bytes());
        }
        let mut nibbles = [1u8; 7];
        for slot in nibbles.iter_mut().take(k) {
            *slot = 0;
        }
        if idx + k == words.len() {
            nibbles[k - 1] = 0x4;
        }
        out.extend_from_slice(&status_word(&nibbles).to_le_bytes());
        for &w in &words[idx..idx + k] {
            out.extend_from_slice(&w.to_be_bytes());
        }
        idx += k;
        group += 1;
    }
    out
}

proptest! {
    #[test]
    fn interleaving_reconstructs_the_tlp(
        payload in proptest::collection::vec(any::<u32>(), 1..=20),
        data_per_group in proptest::collection::vec(1u8..=7, 1..=8),
        fillers in proptest::collection::vec(any::<bool>(), 1..=8),
        splits in proptest::collection::vec(1usize..=6, 0..=6),
    ) {
        let words = tlp_words(&payload);
        let stream = build_stream(&words, &data_per_group, &fillers);

        // Deliver the stream over several transport reads, split at word
        // boundaries.
        let mut transport = ScriptedTransport::new();
        let total_words = stream.len() / 4;
        let mut cursor = 0usize;
        for &step in &splits {
            if cursor >= total_words {
                break;
            }
            let take = step.min(total_words - cursor);
            transport.push_read(stream[cursor * 4..(cursor + take) * 4].to_vec());
            cursor += take;
        }
        if cursor < total_words {
            transport.push_read(stream[cursor * 4..].to_vec());
        }

        let mut rx = TlpReceiver::new();
        prop_assert_eq!(rx.receive(&mut transport)?, TlpEvent::Complete(words));
    }
}
