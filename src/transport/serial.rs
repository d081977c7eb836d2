//! SPI through a serprog programmer on a serial port.
use std::{
    fmt::Display,
    io::{Read, Write},
    time::Duration,
};

use anyhow::{Error, Result};
use clap::{ValueEnum, builder::PossibleValue};
use scroll::{LE, Pread};
use serialport::SerialPort;

use super::{BusKind, Transport};

const SERIAL_TIMEOUT_MS: u64 = 1000;

const S_ACK: u8 = 0x06;
const S_NAK: u8 = 0x15;

const S_CMD_Q_IFACE: u8 = 0x01;
const S_CMD_SYNCNOP: u8 = 0x10;
const S_CMD_S_BUSTYPE: u8 = 0x12;
const S_CMD_O_SPIOP: u8 = 0x13;
const S_CMD_S_SPI_FREQ: u8 = 0x14;

const BUS_SPI: u8 = 1 << 3;
const SERPROG_PROTOCOL_VERSION: u16 = 1;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    #[default]
    Baud115200,
    Baud1m,
    Baud2m,
    Baud4m,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud1m => 1000000,
            Baudrate::Baud2m => 2000000,
            Baudrate::Baud4m => 4000000,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Baudrate::Baud115200,
            Baudrate::Baud1m,
            Baudrate::Baud2m,
            Baudrate::Baud4m,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud115200 => Some(PossibleValue::new("Baud115200").aliases(["115200"])),
            Baudrate::Baud1m => {
                Some(PossibleValue::new("Baud1m").aliases(["1000000", "1_000_000", "1m"]))
            }
            Baudrate::Baud2m => {
                Some(PossibleValue::new("Baud2m").aliases(["2000000", "2_000_000", "2m"]))
            }
            Baudrate::Baud4m => {
                Some(PossibleValue::new("Baud4m").aliases(["4000000", "4_000_000", "4m"]))
            }
        }
    }
}

/// SPI master behind a serprog-speaking programmer.
pub struct SerprogSpi {
    serial_port: Box<dyn SerialPort>,
}

impl SerprogSpi {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate.into())
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        let mut transport = SerprogSpi { serial_port: port };
        transport.synchronize()?;

        let iface = transport.command(S_CMD_Q_IFACE, &[], 2)?;
        let version = iface.pread_with::<u16>(0, LE)?;
        anyhow::ensure!(
            version == SERPROG_PROTOCOL_VERSION,
            "unsupported serprog interface version {}",
            version
        );
        transport.command(S_CMD_S_BUSTYPE, &[BUS_SPI], 0)?;
        Ok(transport)
    }

    pub fn open_nth(nth: usize, baudrate: Baudrate) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baudrate),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any(baudrate: Baudrate) -> Result<Self> {
        Self::open_nth(0, baudrate)
    }

    /// Request an SPI clock, returns the frequency the programmer picked.
    pub fn set_spi_freq(&mut self, freq_hz: u32) -> Result<u32> {
        let actual = self.command(S_CMD_S_SPI_FREQ, &freq_hz.to_le_bytes(), 4)?;
        let actual = actual.pread_with::<u32>(0, LE)?;
        log::info!("SPI clock {} Hz (requested {} Hz)", actual, freq_hz);
        Ok(actual)
    }

    fn synchronize(&mut self) -> Result<()> {
        for _ in 0..8 {
            self.serial_port.write_all(&[S_CMD_SYNCNOP])?;
            self.serial_port.flush()?;
            let mut reply = [0u8; 2];
            if self.serial_port.read_exact(&mut reply).is_ok() && reply == [S_NAK, S_ACK] {
                return Ok(());
            }
            self.serial_port.clear(serialport::ClearBuffer::Input)?;
        }
        anyhow::bail!("serprog synchronization failed")
    }

    fn command(&mut self, cmd: u8, params: &[u8], ret_len: usize) -> Result<Vec<u8>> {
        let mut v = Vec::with_capacity(1 + params.len());
        v.push(cmd);
        v.extend_from_slice(params);
        self.serial_port.write_all(&v)?;
        self.serial_port.flush()?;

        let mut status = [0u8; 1];
        self.serial_port.read_exact(&mut status)?;
        match status[0] {
            S_ACK => (),
            S_NAK => anyhow::bail!("serprog command 0x{:02x} NAKed", cmd),
            other => anyhow::bail!(
                "invalid serprog response 0x{:02x} to command 0x{:02x}",
                other,
                cmd
            ),
        }

        let mut ret = vec![0u8; ret_len];
        self.serial_port.read_exact(&mut ret)?;
        Ok(ret)
    }
}

fn u24_le(n: usize) -> Result<[u8; 3]> {
    anyhow::ensure!(n < 1 << 24, "SPI operation too long: {}", n);
    Ok([n as u8, (n >> 8) as u8, (n >> 16) as u8])
}

/// Parameters of `O_SPIOP`: WRITE_LEN(3), READ_LEN(3), DATA
fn spiop_params(write: &[u8], read_len: usize) -> Result<Vec<u8>> {
    let mut params = Vec::with_capacity(6 + write.len());
    params.extend_from_slice(&u24_le(write.len())?);
    params.extend_from_slice(&u24_le(read_len)?);
    params.extend_from_slice(write);
    Ok(params)
}

impl Transport for SerprogSpi {
    fn bus_kind(&self) -> BusKind {
        BusKind::Clocked
    }

    fn transfer_raw(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        let params = spiop_params(write, read.len())?;
        let ret = self.command(S_CMD_O_SPIOP, &params, read.len())?;
        read.copy_from_slice(&ret);
        Ok(())
    }
}
