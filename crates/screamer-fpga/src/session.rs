//! Capture session: one transport, one receive state machine, and the
//! start-up handshake that brings the FPGA into a usable state.

use screamer_frame::{
    send_tlp, BulkTransport, EmptyReadPolicy, ReceiveError, SendError, TlpEvent, TlpReceiver,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{
    config_read, config_write, ConfigError, CHANNEL_CORE, REG_READONLY, REG_READWRITE,
};

/// Core register holding the firmware version byte.
const VERSION_REG: u16 = 0x0008;
const SUPPORTED_VERSION: u8 = 4;

/// PCIe core control register.
const PCIE_CORE_REG: u16 = 0x0019;
/// When set, the Xilinx IP filters config TLPs away from the user stream;
/// it must be clear for us to see accesses beyond the IP-managed space.
const CFG_FILTER_BIT: u8 = 0x10;

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unsupported FPGA version {found:#04x}, expected {SUPPORTED_VERSION:#04x}")]
    UnsupportedVersion { found: u8 },
    #[error("couldn't clear the config-TLP capture filter")]
    FilterStuck,
}

/// Owns a [`BulkTransport`] and the TLP receive state for its lifetime.
pub struct Session<T: BulkTransport> {
    transport: T,
    receiver: TlpReceiver,
}

impl<T: BulkTransport> Session<T> {
    pub fn new(transport: T) -> Self {
        Session {
            transport,
            receiver: TlpReceiver::new(),
        }
    }

    pub fn with_empty_read_policy(mut self, policy: EmptyReadPolicy) -> Self {
        self.receiver = self.receiver.with_empty_read_policy(policy);
        self
    }

    /// Validate the firmware version and clear the capture filter. Must run
    /// once before streaming TLPs.
    pub fn init(&mut self) -> Result<(), InitError> {
        let mut version = [0u8; 1];
        config_read(
            &mut self.transport,
            VERSION_REG,
            &mut version,
            REG_READONLY | CHANNEL_CORE,
        )?;
        if version[0] != SUPPORTED_VERSION {
            return Err(InitError::UnsupportedVersion { found: version[0] });
        }
        info!(version = version[0], "FPGA firmware version ok");

        let mut core = [0u8; 1];
        config_read(
            &mut self.transport,
            PCIE_CORE_REG,
            &mut core,
            REG_READWRITE | CHANNEL_CORE,
        )?;
        core[0] &= !CFG_FILTER_BIT;
        config_write(
            &mut self.transport,
            PCIE_CORE_REG,
            &core,
            REG_READWRITE | CHANNEL_CORE,
        )?;
        config_read(
            &mut self.transport,
            PCIE_CORE_REG,
            &mut core,
            REG_READWRITE | CHANNEL_CORE,
        )?;
        if core[0] & CFG_FILTER_BIT != 0 {
            return Err(InitError::FilterStuck);
        }
        debug!(core = core[0], "config-TLP capture filter cleared");
        Ok(())
    }

    /// Pull the next TLP event off the stream.
    pub fn receive_tlp(&mut self) -> Result<TlpEvent, ReceiveError> {
        self.receiver.receive(&mut self.transport)
    }

    /// Inject one wire-ordered TLP byte image into the link.
    pub fn send_tlp(&mut self, wire: &[u8]) -> Result<(), SendError> {
        send_tlp(&mut self.transport, wire)
    }

    pub fn config_read(&mut self, address: u16, out: &mut [u8], flags: u16) -> Result<(), ConfigError> {
        config_read(&mut self.transport, address, out, flags)
    }

    pub fn config_write(&mut self, address: u16, data: &[u8], flags: u16) -> Result<(), ConfigError> {
        config_write(&mut self.transport, address, data, flags)
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
