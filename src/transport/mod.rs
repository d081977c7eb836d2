//! Abstract bus transport interface.
use std::{fmt, thread::sleep, time::Duration};

use anyhow::Result;

use crate::{
    constants::commands,
    protocol::{Command, Response},
};

pub use self::serial::{Baudrate, SerprogSpi};
pub use self::usb::{Ch341aI2c, I2cSpeed};

mod serial;
mod usb;

/// The two physical bindings of the configuration port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// Multi-drop bus with a slave address (I2C).
    Addressed,
    /// Point-to-point bus with chip select and clock (SPI).
    Clocked,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Addressed => write!(f, "I2C"),
            BusKind::Clocked => write!(f, "SPI"),
        }
    }
}

/// Abstraction of the transport layer.
/// Might be an I2C adapter, an SPI programmer, or a test double.
pub trait Transport {
    /// Which kind of bus this transport drives.
    fn bus_kind(&self) -> BusKind;

    /// Write `write`, then fill `read` in the same bus transaction.
    ///
    /// An empty `read` performs a write-only transaction.
    fn transfer_raw(&mut self, write: &[u8], read: &mut [u8]) -> Result<()>;

    fn transfer(&mut self, cmd: Command) -> Result<Response> {
        let mut resp = vec![0u8; cmd.response_len()];
        let req = cmd.into_raw();
        log::debug!("=> {}", hex::encode(&req));
        self.transfer_raw(&req, &mut resp)?;
        if !resp.is_empty() {
            log::debug!("<= {}", hex::encode(&resp));
        }
        Ok(Response::from_raw(resp))
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn bus_kind(&self) -> BusKind {
        (**self).bus_kind()
    }

    fn transfer_raw(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        (**self).transfer_raw(write, read)
    }
}

/// How often a failed transaction is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the n-th retry is `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Retries failed transactions of the wrapped transport.
///
/// Frames that advance the address pointer (page program and page reads) are
/// sent once: the device may have latched a frame whose transfer failed.
pub struct Retry<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: Transport> Retry<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Retry { inner, policy }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Transport> Transport for Retry<T> {
    fn bus_kind(&self) -> BusKind {
        self.inner.bus_kind()
    }

    fn transfer_raw(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        if write.first().is_some_and(|&op| advances_pointer(op)) {
            return self.inner.transfer_raw(write, read);
        }
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.transfer_raw(write, read) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "transfer {:02x} failed (attempt {}/{}): {:#}",
                        write.first().copied().unwrap_or_default(),
                        attempt,
                        attempts,
                        e
                    );
                    sleep(self.policy.backoff * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("transfer failed after {} attempts", attempts)));
                }
            }
        }
    }
}

fn advances_pointer(opcode: u8) -> bool {
    matches!(
        opcode,
        commands::PROGRAM_PAGE | commands::READ_FLASH | commands::READ_UFM
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        failures: u32,
        calls: u32,
    }

    impl Transport for Flaky {
        fn bus_kind(&self) -> BusKind {
            BusKind::Addressed
        }

        fn transfer_raw(&mut self, _write: &[u8], read: &mut [u8]) -> Result<()> {
            self.calls += 1;
            if self.calls <= self.failures {
                anyhow::bail!("NACK");
            }
            read.fill(0x5a);
            Ok(())
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn retry_recovers_from_transient_failures() {
        let mut t = Retry::new(
            Flaky {
                failures: 2,
                calls: 0,
            },
            policy(3),
        );
        let resp = t.transfer(Command::ReadOtpFuses).unwrap();
        assert_eq!(resp.payload(), &[0x5a]);
        assert_eq!(t.into_inner().calls, 3);
    }

    #[test]
    fn retry_gives_up() {
        let mut t = Retry::new(
            Flaky {
                failures: 5,
                calls: 0,
            },
            policy(2),
        );
        let err = t.transfer(Command::Refresh).unwrap_err();
        assert!(format!("{:#}", err).contains("after 2 attempts"));
        assert_eq!(t.into_inner().calls, 2);
    }

    #[test]
    fn pointer_advancing_frames_are_not_repeated() {
        let mut t = Retry::new(
            Flaky {
                failures: 1,
                calls: 0,
            },
            policy(3),
        );
        let page = crate::protocol::PageBuffer::new();
        assert!(t.transfer(Command::ProgramPage(page)).is_err());
        assert!(t.transfer(Command::ReadFlash).is_ok());
        assert_eq!(t.inner.calls, 2);

        t.inner.failures = 3;
        assert!(t.transfer(Command::ReadUfm).is_err());
        assert!(t.transfer(Command::ReadStatus).is_ok());
        assert_eq!(t.into_inner().calls, 5);
    }

    #[test]
    fn write_only_commands_read_nothing() {
        let mut t = Flaky {
            failures: 0,
            calls: 0,
        };
        let resp = t.transfer(Command::ProgramDone).unwrap();
        assert!(resp.payload().is_empty());
    }
}
