//! Firmware console relay: completion synthesis for configuration accesses
//! to the console register window.
//!
//! The firmware-side adapter moves console bytes as single-dword config
//! writes and reads to offset 0x200. Writes carry one output byte in byte
//! lane 0; reads expect a data completion whose payload holds one input byte
//! in lane 0 with the remaining lanes at 0xFF (also the value when no input
//! is pending).

use screamer_tlp::{
    byte_lane, Tlp, CPL_STATUS_UNSUPPORTED_REQUEST, FMT_TYPE_CFG_RD0, FMT_TYPE_CFG_WR0,
    FMT_TYPE_CPL, FMT_TYPE_CPL_D,
};
use tracing::{debug, warn};

/// Config-space byte offset the firmware console reads and writes through.
pub const CONSOLE_REG_OFFSET: u16 = 0x200;

/// Byte source/sink behind the relay. `get_byte` must not block; `None`
/// means no input is pending.
pub trait ConsoleIo {
    fn put_byte(&mut self, byte: u8);
    fn get_byte(&mut self) -> Option<u8>;
}

/// Inspect one reconstructed TLP and produce the completion to inject, if
/// any, as a wire byte image.
///
/// Only CfgRd0/CfgWr0 requests get completions, echoing the request's tag,
/// requester id and completer id with a byte count of 4. A single-dword
/// access to the console offset with only the first byte lane enabled relays
/// one byte of console I/O and completes successfully; any other config
/// access completes as an unsupported request. Non-config TLPs produce
/// nothing.
pub fn completion_for(words: &[u32], console: &mut dyn ConsoleIo) -> Option<Vec<u8>> {
    let decoded = match Tlp::decode(words) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(%err, "undecodable TLP");
            return None;
        }
    };
    let req = decoded.tlp;
    if req.fmt_type() != FMT_TYPE_CFG_WR0 && req.fmt_type() != FMT_TYPE_CFG_RD0 {
        return None;
    }

    let mut cpl = Tlp::new(FMT_TYPE_CPL);
    cpl.set_tc(req.tc());
    cpl.set_attr(req.attr());
    cpl.set_cpl_completer_id(req.cfg_completer_id());
    cpl.set_cpl_byte_count(4);
    cpl.set_cpl_requester_id(req.cfg_requester_id());
    cpl.set_cpl_tag(req.cfg_tag());

    let console_target = req.cfg_last_be() == 0
        && req.cfg_first_be() & 0x1 == 0x1
        && req.cfg_register_offset() == CONSOLE_REG_OFFSET;

    let mut payload = Vec::new();
    if !console_target {
        debug!(
            offset = req.cfg_register_offset(),
            first_be = req.cfg_first_be(),
            last_be = req.cfg_last_be(),
            "config access outside the console window"
        );
        cpl.set_cpl_status(CPL_STATUS_UNSUPPORTED_REQUEST);
    } else if req.fmt_type() == FMT_TYPE_CFG_WR0 && decoded.payload.len() == 1 {
        console.put_byte(byte_lane(decoded.payload[0], 0));
    } else if req.fmt_type() == FMT_TYPE_CFG_RD0 && decoded.payload.is_empty() {
        cpl.set_fmt_type(FMT_TYPE_CPL_D);
        cpl.set_length(1);
        let byte = console.get_byte().unwrap_or(0xFF);
        payload.push((u32::from(byte) << 24) | 0x00FF_FFFF);
    } else {
        // Console-window access with an impossible payload shape.
        cpl.set_cpl_status(CPL_STATUS_UNSUPPORTED_REQUEST);
    }

    cpl.encode(&payload).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use screamer_tlp::{dword_from_wire, CPL_STATUS_SUCCESS, FMT_TYPE_MWR32};

    use super::*;

    #[derive(Default)]
    struct MockConsole {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl ConsoleIo for MockConsole {
        fn put_byte(&mut self, byte: u8) {
            self.output.push(byte);
        }

        fn get_byte(&mut self) -> Option<u8> {
            self.input.pop_front()
        }
    }

    fn cfg_request(fmt_type: u8, offset: u16, first_be: u8, last_be: u8) -> Tlp {
        let mut req = Tlp::new(fmt_type);
        if fmt_type == FMT_TYPE_CFG_WR0 {
            req.set_length(1);
        }
        req.set_cfg_requester_id(0x0100);
        req.set_cfg_tag(0x0C);
        req.set_cfg_byte_enables(first_be, last_be);
        req.set_cfg_completer_id(0x0200);
        req.set_cfg_register_offset(offset);
        req
    }

    fn decode_cpl(wire: &[u8]) -> (Tlp, Vec<u32>) {
        let words: Vec<u32> = wire
            .chunks_exact(4)
            .map(|c| dword_from_wire([c[0], c[1], c[2], c[3]]))
            .collect();
        let decoded = Tlp::decode(&words).unwrap();
        (decoded.tlp, decoded.payload.to_vec())
    }

    #[test]
    fn console_write_emits_the_byte_and_succeeds() {
        let req = cfg_request(FMT_TYPE_CFG_WR0, CONSOLE_REG_OFFSET, 0x1, 0x0);
        let mut words = req.dws()[..3].to_vec();
        words.push(0x4100_0000); // 'A' in byte lane 0

        let mut console = MockConsole::default();
        let wire = completion_for(&words, &mut console).unwrap();

        assert_eq!(console.output, b"A");
        let (cpl, payload) = decode_cpl(&wire);
        assert_eq!(cpl.fmt_type(), FMT_TYPE_CPL);
        assert_eq!(cpl.cpl_status(), CPL_STATUS_SUCCESS);
        assert_eq!(cpl.cpl_byte_count(), 4);
        assert_eq!(cpl.cpl_requester_id(), 0x0100);
        assert_eq!(cpl.cpl_tag(), 0x0C);
        assert_eq!(cpl.cpl_completer_id(), 0x0200);
        assert!(payload.is_empty());
    }

    #[test]
    fn console_read_supplies_pending_input() {
        let req = cfg_request(FMT_TYPE_CFG_RD0, CONSOLE_REG_OFFSET, 0x1, 0x0);
        let mut console = MockConsole {
            input: VecDeque::from([b'x']),
            ..MockConsole::default()
        };
        let wire = completion_for(&req.dws()[..3], &mut console).unwrap();

        let (cpl, payload) = decode_cpl(&wire);
        assert_eq!(cpl.fmt_type(), FMT_TYPE_CPL_D);
        assert_eq!(cpl.cpl_status(), CPL_STATUS_SUCCESS);
        assert_eq!(cpl.length(), 1);
        assert_eq!(payload, vec![0x78FF_FFFF]);
    }

    #[test]
    fn console_read_without_input_returns_all_ff() {
        let req = cfg_request(FMT_TYPE_CFG_RD0, CONSOLE_REG_OFFSET, 0x1, 0x0);
        let mut console = MockConsole::default();
        let wire = completion_for(&req.dws()[..3], &mut console).unwrap();

        let (_, payload) = decode_cpl(&wire);
        assert_eq!(payload, vec![0xFFFF_FFFF]);
    }

    #[test]
    fn other_register_offsets_are_unsupported() {
        let req = cfg_request(FMT_TYPE_CFG_WR0, 0x100, 0x1, 0x0);
        let mut words = req.dws()[..3].to_vec();
        words.push(0x4100_0000);

        let mut console = MockConsole::default();
        let wire = completion_for(&words, &mut console).unwrap();

        assert!(console.output.is_empty());
        let (cpl, payload) = decode_cpl(&wire);
        assert_eq!(cpl.cpl_status(), CPL_STATUS_UNSUPPORTED_REQUEST);
        assert!(payload.is_empty());
    }

    #[test]
    fn partial_byte_enables_are_unsupported() {
        let req = cfg_request(FMT_TYPE_CFG_WR0, CONSOLE_REG_OFFSET, 0xF, 0xF);
        let mut words = req.dws()[..3].to_vec();
        words.push(0x4100_0000);

        let mut console = MockConsole::default();
        let wire = completion_for(&words, &mut console).unwrap();

        assert!(console.output.is_empty());
        let (cpl, _) = decode_cpl(&wire);
        assert_eq!(cpl.cpl_status(), CPL_STATUS_UNSUPPORTED_REQUEST);
    }

    #[test]
    fn non_config_tlps_produce_no_completion() {
        let mut req = Tlp::new(FMT_TYPE_MWR32);
        req.set_length(1);
        let mut words = req.dws()[..3].to_vec();
        words.push(0x1234_5678);

        let mut console = MockConsole::default();
        assert!(completion_for(&words, &mut console).is_none());
        assert!(console.output.is_empty());
    }
}
