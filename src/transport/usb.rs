//! I2C through a CH341A USB bridge.
use std::{fmt::Display, time::Duration};

use anyhow::Result;
use clap::{ValueEnum, builder::PossibleValue};
use rusb::{Context, DeviceHandle, UsbContext};

use super::{BusKind, Transport};

const CH341A_VID: u16 = 0x1a86;
const CH341A_PID: u16 = 0x5512;

const ENDPOINT_OUT: u8 = 0x02;
const ENDPOINT_IN: u8 = 0x82;

const TIMEOUT_MS: u64 = 1000;

/// One USB packet of the I2C stream interface.
const PACKET_LENGTH: usize = 32;

const CMD_I2C_STREAM: u8 = 0xaa;
const I2C_STM_STA: u8 = 0x74;
const I2C_STM_STO: u8 = 0x75;
const I2C_STM_OUT: u8 = 0x80;
const I2C_STM_IN: u8 = 0xc0;
const I2C_STM_SET: u8 = 0x60;
const I2C_STM_END: u8 = 0x00;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum I2cSpeed {
    Speed20k,
    #[default]
    Speed100k,
    Speed400k,
    Speed750k,
}

impl I2cSpeed {
    fn stream_bits(self) -> u8 {
        match self {
            I2cSpeed::Speed20k => 0,
            I2cSpeed::Speed100k => 1,
            I2cSpeed::Speed400k => 2,
            I2cSpeed::Speed750k => 3,
        }
    }
}

impl Display for I2cSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let khz = match self {
            I2cSpeed::Speed20k => 20,
            I2cSpeed::Speed100k => 100,
            I2cSpeed::Speed400k => 400,
            I2cSpeed::Speed750k => 750,
        };
        write!(f, "{}kHz", khz)
    }
}

impl ValueEnum for I2cSpeed {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            I2cSpeed::Speed20k,
            I2cSpeed::Speed100k,
            I2cSpeed::Speed400k,
            I2cSpeed::Speed750k,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            I2cSpeed::Speed20k => Some(PossibleValue::new("20k").aliases(["20000"])),
            I2cSpeed::Speed100k => Some(PossibleValue::new("100k").aliases(["100000"])),
            I2cSpeed::Speed400k => Some(PossibleValue::new("400k").aliases(["400000"])),
            I2cSpeed::Speed750k => Some(PossibleValue::new("750k").aliases(["750000"])),
        }
    }
}

/// I2C master on a CH341A, talking to one slave address.
pub struct Ch341aI2c {
    device_handle: DeviceHandle<rusb::Context>,
    addr: u8,
}

fn is_ch341a<T: UsbContext>(device: &rusb::Device<T>) -> bool {
    device
        .device_descriptor()
        .map(|desc| desc.vendor_id() == CH341A_VID && desc.product_id() == CH341A_PID)
        .unwrap_or(false)
}

impl Ch341aI2c {
    pub fn scan_devices() -> Result<usize> {
        let context = Context::new()?;

        let n = context
            .devices()?
            .iter()
            .filter(is_ch341a)
            .enumerate()
            .map(|(i, device)| {
                log::debug!("Found CH341A #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    pub fn open_nth(nth: usize, addr: u8, speed: I2cSpeed) -> Result<Ch341aI2c> {
        anyhow::ensure!(addr < 0x80, "invalid 7-bit I2C address 0x{:02x}", addr);
        let context = Context::new()?;

        let device = context
            .devices()?
            .iter()
            .filter(is_ch341a)
            .nth(nth)
            .ok_or(anyhow::format_err!(
                "No CH341A found({:04x}:{:04x} device not found at index #{})",
                CH341A_VID,
                CH341A_PID,
                nth
            ))?;
        log::debug!("Found USB Device {:?}", device);

        let mut device_handle = device.open()?;

        let config = device.config_descriptor(0)?;

        let mut endpoint_out_found = false;
        let mut endpoint_in_found = false;
        if let Some(intf) = config.interfaces().next() {
            if let Some(desc) = intf.descriptors().next() {
                for endpoint in desc.endpoint_descriptors() {
                    if endpoint.address() == ENDPOINT_OUT {
                        endpoint_out_found = true;
                    }
                    if endpoint.address() == ENDPOINT_IN {
                        endpoint_in_found = true;
                    }
                }
            }
        }

        if !(endpoint_out_found && endpoint_in_found) {
            anyhow::bail!("USB Endpoints not found");
        }

        if let Ok(true) = device_handle.kernel_driver_active(0) {
            device_handle.detach_kernel_driver(0)?;
        }
        device_handle.claim_interface(0)?;

        let mut transport = Ch341aI2c {
            device_handle,
            addr,
        };
        transport.bulk_write(&[CMD_I2C_STREAM, I2C_STM_SET | speed.stream_bits(), I2C_STM_END])?;
        log::info!("CH341A #{} configured for I2C @ {}, slave 0x{:02x}", nth, speed, addr);

        Ok(transport)
    }

    pub fn open_any(addr: u8, speed: I2cSpeed) -> Result<Ch341aI2c> {
        Self::open_nth(0, addr, speed)
    }

    fn bulk_write(&mut self, raw: &[u8]) -> Result<()> {
        anyhow::ensure!(raw.len() <= PACKET_LENGTH, "CH341A packet too long: {}", raw.len());
        let n = self
            .device_handle
            .write_bulk(ENDPOINT_OUT, raw, Duration::from_millis(TIMEOUT_MS))?;
        anyhow::ensure!(n == raw.len(), "short USB write: {} of {}", n, raw.len());
        Ok(())
    }

}

/// Build one I2C stream packet: START, address + write, the frame, then
/// either STOP or a repeated START + read of `read_len` bytes.
fn stream_packet(addr: u8, write: &[u8], read_len: usize) -> Result<Vec<u8>> {
    // 6-bit length field includes the address byte
    anyhow::ensure!(write.len() < 0x3f, "I2C write too long: {}", write.len());
    anyhow::ensure!(read_len <= 0x20, "I2C read too long: {}", read_len);

    let mut buf = Vec::with_capacity(PACKET_LENGTH);
    buf.push(CMD_I2C_STREAM);
    buf.push(I2C_STM_STA);
    buf.push(I2C_STM_OUT | (write.len() as u8 + 1));
    buf.push(addr << 1);
    buf.extend_from_slice(write);
    if read_len > 0 {
        buf.push(I2C_STM_STA);
        buf.push(I2C_STM_OUT | 1);
        buf.push((addr << 1) | 1);
        if read_len > 1 {
            // ACK all but the last byte
            buf.push(I2C_STM_IN | (read_len as u8 - 1));
        }
        buf.push(I2C_STM_IN);
    }
    buf.push(I2C_STM_STO);
    buf.push(I2C_STM_END);
    anyhow::ensure!(buf.len() <= PACKET_LENGTH, "CH341A packet too long: {}", buf.len());
    Ok(buf)
}

impl Transport for Ch341aI2c {
    fn bus_kind(&self) -> BusKind {
        BusKind::Addressed
    }

    fn transfer_raw(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        let packet = stream_packet(self.addr, write, read.len())?;
        self.bulk_write(&packet)?;

        if !read.is_empty() {
            let mut buf = [0u8; PACKET_LENGTH];
            let nread = self.device_handle.read_bulk(
                ENDPOINT_IN,
                &mut buf,
                Duration::from_millis(TIMEOUT_MS),
            )?;
            anyhow::ensure!(
                nread >= read.len(),
                "I2C read returned {} of {} bytes",
                nread,
                read.len()
            );
            read.copy_from_slice(&buf[..read.len()]);
        }
        Ok(())
    }
}

impl Drop for Ch341aI2c {
    fn drop(&mut self) {
        let _ = self.device_handle.release_interface(0);
    }
}
