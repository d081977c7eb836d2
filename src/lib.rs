//! Lattice MachXO2/3 configuration port driver.

pub mod constants;
pub mod device;
pub mod flashing;
pub mod format;
pub mod loader;
pub mod machxo;
pub mod protocol;
pub mod transport;

pub use self::device::Chip;
pub use self::flashing::Flashing;
pub use self::machxo::{MachXO, Phase, WaitOptions};
pub use self::protocol::{Command, EraseFlags, PageBuffer, Region, Response};
pub use self::transport::Transport;
