//! FT60x USB3 FIFO bridge transport.
//!
//! The capture board exposes its bulk stream through an FTDI FT601 in FIFO
//! 245 mode. This module finds and opens the device over libusb, validates
//! (and if needed repairs) the chip configuration via the vendor control
//! endpoint, and implements [`BulkTransport`] on top of its bulk pipes. Bulk
//! reads must be preceded by a 20-byte read command on the session pipe.

use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};
use screamer_frame::{BulkTransport, TransportError};
use thiserror::Error;
use tracing::{info, warn};

pub const FT60X_VENDOR_ID: u16 = 0x0403;
pub const FT60X_PRODUCT_ID: u16 = 0x601F;

const COMMUNICATION_INTERFACE: u8 = 0x00;
const DATA_INTERFACE: u8 = 0x01;
const ENDPOINT_SESSION_OUT: u8 = 0x01;
const ENDPOINT_OUT: u8 = 0x02;
const ENDPOINT_IN: u8 = 0x82;

/// Vendor control request moving the 152-byte chip configuration.
const REQUEST_CHIP_CONFIG: u8 = 0xCF;
const CHIP_CONFIG_SET: u16 = 0;
const CHIP_CONFIG_GET: u16 = 1;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

pub const FIFO_MODE_245: u8 = 0;
pub const CHANNEL_CONFIG_1: u8 = 2;
pub const OPTIONAL_FEATURE_DISABLE_ALL: u16 = 0;

pub const FT60X_CONFIG_BYTES: usize = 152;

#[derive(Debug, Error)]
pub enum Ft60xError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
    #[error("no FT60x device at index {index}")]
    NotFound { index: usize },
    #[error("interface {interface} already claimed by a kernel driver")]
    InterfaceBusy { interface: u8 },
    #[error("chip configuration transfer moved {len} bytes, expected {FT60X_CONFIG_BYTES}")]
    ConfigSize { len: usize },
}

/// The FT60x chip configuration block, stored little-endian on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ft60xConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub string_descriptors: [u8; 128],
    pub reserved: u8,
    pub power_attributes: u8,
    pub power_consumption: u16,
    pub reserved_2: u8,
    pub fifo_clock: u8,
    pub fifo_mode: u8,
    pub channel_config: u8,
    pub optional_feature_support: u16,
    pub battery_charging_gpio_config: u8,
    pub ro_flash_eeprom_detection: u8,
    pub msio_control: u32,
    pub gpio_control: u32,
}

impl Ft60xConfig {
    pub fn from_bytes(raw: &[u8; FT60X_CONFIG_BYTES]) -> Self {
        let mut string_descriptors = [0u8; 128];
        string_descriptors.copy_from_slice(&raw[4..132]);
        Ft60xConfig {
            vendor_id: u16::from_le_bytes([raw[0], raw[1]]),
            product_id: u16::from_le_bytes([raw[2], raw[3]]),
            string_descriptors,
            reserved: raw[132],
            power_attributes: raw[133],
            power_consumption: u16::from_le_bytes([raw[134], raw[135]]),
            reserved_2: raw[136],
            fifo_clock: raw[137],
            fifo_mode: raw[138],
            channel_config: raw[139],
            optional_feature_support: u16::from_le_bytes([raw[140], raw[141]]),
            battery_charging_gpio_config: raw[142],
            ro_flash_eeprom_detection: raw[143],
            msio_control: u32::from_le_bytes([raw[144], raw[145], raw[146], raw[147]]),
            gpio_control: u32::from_le_bytes([raw[148], raw[149], raw[150], raw[151]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; FT60X_CONFIG_BYTES] {
        let mut raw = [0u8; FT60X_CONFIG_BYTES];
        raw[0..2].copy_from_slice(&self.vendor_id.to_le_bytes());
        raw[2..4].copy_from_slice(&self.product_id.to_le_bytes());
        raw[4..132].copy_from_slice(&self.string_descriptors);
        raw[132] = self.reserved;
        raw[133] = self.power_attributes;
        raw[134..136].copy_from_slice(&self.power_consumption.to_le_bytes());
        raw[136] = self.reserved_2;
        raw[137] = self.fifo_clock;
        raw[138] = self.fifo_mode;
        raw[139] = self.channel_config;
        raw[140..142].copy_from_slice(&self.optional_feature_support.to_le_bytes());
        raw[142] = self.battery_charging_gpio_config;
        raw[143] = self.ro_flash_eeprom_detection;
        raw[144..148].copy_from_slice(&self.msio_control.to_le_bytes());
        raw[148..152].copy_from_slice(&self.gpio_control.to_le_bytes());
        raw
    }

    /// Whether the transfer configuration matches what the bulk framing
    /// requires: FIFO 245 mode, one channel, no optional features.
    pub fn is_stream_ready(&self) -> bool {
        self.fifo_mode == FIFO_MODE_245
            && self.channel_config == CHANNEL_CONFIG_1
            && self.optional_feature_support == OPTIONAL_FEATURE_DISABLE_ALL
    }
}

/// An open, claimed, stream-configured FT60x. Interfaces are released on
/// drop.
pub struct Ft60xDevice {
    handle: DeviceHandle<Context>,
}

impl Ft60xDevice {
    /// Open the `index`-th FT60x on the bus and prepare it for streaming.
    pub fn open(index: usize) -> Result<Self, Ft60xError> {
        let context = Context::new()?;
        let mut remaining = index;
        for device in context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(err) => {
                    warn!(%err, "skipping device with unreadable descriptor");
                    continue;
                }
            };
            if desc.vendor_id() != FT60X_VENDOR_ID || desc.product_id() != FT60X_PRODUCT_ID {
                continue;
            }
            if remaining > 0 {
                remaining -= 1;
                continue;
            }
            info!(
                bus = device.bus_number(),
                address = device.address(),
                "using FT60x device {:04x}:{:04x}",
                desc.vendor_id(),
                desc.product_id()
            );
            let handle = device.open()?;
            for interface in [COMMUNICATION_INTERFACE, DATA_INTERFACE] {
                if handle.kernel_driver_active(interface)? {
                    return Err(Ft60xError::InterfaceBusy { interface });
                }
                handle.claim_interface(interface)?;
            }
            let mut device = Ft60xDevice { handle };
            device.ensure_stream_config()?;
            return Ok(device);
        }
        Err(Ft60xError::NotFound { index })
    }

    pub fn chip_config(&self) -> Result<Ft60xConfig, Ft60xError> {
        let mut raw = [0u8; FT60X_CONFIG_BYTES];
        let len = self.handle.read_control(
            rusb::request_type(
                rusb::Direction::In,
                rusb::RequestType::Vendor,
                rusb::Recipient::Device,
            ),
            REQUEST_CHIP_CONFIG,
            CHIP_CONFIG_GET,
            0,
            &mut raw,
            CONTROL_TIMEOUT,
        )?;
        if len != FT60X_CONFIG_BYTES {
            return Err(Ft60xError::ConfigSize { len });
        }
        Ok(Ft60xConfig::from_bytes(&raw))
    }

    pub fn set_chip_config(&mut self, config: &Ft60xConfig) -> Result<(), Ft60xError> {
        let raw = config.to_bytes();
        let len = self.handle.write_control(
            rusb::request_type(
                rusb::Direction::Out,
                rusb::RequestType::Vendor,
                rusb::Recipient::Device,
            ),
            REQUEST_CHIP_CONFIG,
            CHIP_CONFIG_SET,
            0,
            &raw,
            CONTROL_TIMEOUT,
        )?;
        if len != FT60X_CONFIG_BYTES {
            return Err(Ft60xError::ConfigSize { len });
        }
        Ok(())
    }

    fn ensure_stream_config(&mut self) -> Result<(), Ft60xError> {
        let mut config = self.chip_config()?;
        if config.is_stream_ready() {
            return Ok(());
        }
        warn!("fixing bad FT60x chip configuration");
        config.fifo_mode = FIFO_MODE_245;
        config.channel_config = CHANNEL_CONFIG_1;
        config.optional_feature_support = OPTIONAL_FEATURE_DISABLE_ALL;
        self.set_chip_config(&config)
    }

    /// Ask the device to push up to `len` bytes at the bulk-in pipe. Must
    /// precede every bulk read.
    fn send_read_command(&mut self, len: usize) -> Result<(), TransportError> {
        let mut req = [0u8; 20];
        req[0..4].copy_from_slice(&1u32.to_le_bytes());
        req[4] = ENDPOINT_IN;
        req[5] = 1; // read command
        req[8..12].copy_from_slice(&(len as u32).to_le_bytes());
        self.handle
            .write_bulk(ENDPOINT_SESSION_OUT, &req, CONTROL_TIMEOUT)
            .map_err(transfer_err)?;
        Ok(())
    }
}

impl BulkTransport for Ft60xDevice {
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.handle
            .write_bulk(ENDPOINT_OUT, buf, WRITE_TIMEOUT)
            .map_err(transfer_err)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.send_read_command(buf.len())?;
        match self.handle.read_bulk(ENDPOINT_IN, buf, READ_TIMEOUT) {
            Ok(n) => Ok(n),
            // Nothing captured within the timeout; the stream is just idle.
            Err(rusb::Error::Timeout) => Ok(0),
            Err(err) => Err(transfer_err(err)),
        }
    }
}

impl Drop for Ft60xDevice {
    fn drop(&mut self) {
        for interface in [DATA_INTERFACE, COMMUNICATION_INTERFACE] {
            if let Err(err) = self.handle.release_interface(interface) {
                warn!(interface, %err, "failed to release interface");
            }
        }
    }
}

fn transfer_err(err: rusb::Error) -> TransportError {
    TransportError::Transfer(err.to_string())
}
