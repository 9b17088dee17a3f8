#![forbid(unsafe_code)]

//! Device layer for the FPGA PCIe capture board.
//!
//! Three pieces: [`ft60x`] opens and drives the FT60x USB3 FIFO bridge the
//! board streams through, [`config`] speaks the 8-byte-record protocol for
//! the board's internal register space, and [`session`] ties a transport and
//! a TLP receiver together with the start-up handshake.

pub mod config;
pub mod ft60x;
pub mod session;

pub use config::{
    config_read, config_write, ConfigError, CHANNEL_CORE, CHANNEL_PCIE, REG_READONLY,
    REG_READWRITE, REG_SHADOWCFGSPACE,
};
pub use ft60x::{Ft60xConfig, Ft60xDevice, Ft60xError};
pub use session::{InitError, Session};
