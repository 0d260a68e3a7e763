//! Construction-time failures. Runtime faults the hardware itself
//! tolerates (bus contention, unknown opcodes, unmapped I/O) are not
//! represented here — see `Soc::halted_on_fault` and the `log` call
//! sites scattered through the driver instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad cartridge: {0}")]
    BadCart(String),

    #[error("could not read ROM file")]
    BadFile(#[from] std::io::Error),
}
