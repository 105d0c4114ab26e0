use thiserror::Error;

/// Why a configuration cycle ended in `ConfigFailed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoadError {
    #[error("FPGA did not raise INIT_B after reset")]
    HandshakeTimeout,
    #[error("no bitstream data within the chunk deadline")]
    BufferTimeout,
    #[error("serial configuration link fault")]
    TransferFault,
    #[error("DONE not asserted after the last byte")]
    HandshakeFailed,
    #[error("FPGA already ready while reset was held")]
    AlreadyConfigured,
    #[error("load cancelled before completion")]
    Aborted,
}

/// Failure reported by a chunk source to the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SourceError {
    #[error("timed out waiting for a buffer")]
    Timeout,
    #[error("buffer could not be returned to the producer")]
    Release,
    #[error("channel handle no longer valid")]
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipelineError {
    #[error("DMA region cannot hold the requested pool")]
    PoolExhausted,
    #[error("invalid channel parameters")]
    InvalidSpec,
    #[error("endpoint already owned by a live channel")]
    EndpointBusy,
    #[error("channel handle refers to a destroyed channel")]
    StaleHandle,
    #[error("no free channel slot")]
    NoSlot,
    #[error("DMA backend fault")]
    Backend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EepromError {
    #[error("transfer exceeds the EP0 buffer")]
    TooLong,
    #[error("I2C bus error")]
    Bus,
    #[error("device did not acknowledge after a page write")]
    WriteTimeout,
}

/// Outcome of a vendor request handler other than success.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    #[error("unknown request code")]
    UnknownCommand,
    #[error("bad data stage length")]
    BadLength,
    #[error("EEPROM access failed: {0}")]
    Eeprom(#[from] EepromError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_page(fail: bool) -> Result<(), EepromError> {
        if fail {
            Err(EepromError::WriteTimeout)
        } else {
            Ok(())
        }
    }

    fn handle(fail: bool) -> Result<(), CommandError> {
        read_page(fail)?;
        Ok(())
    }

    #[test]
    fn eeprom_errors_lift_into_command_errors() {
        assert_eq!(handle(false), Ok(()));
        assert_eq!(
            handle(true),
            Err(CommandError::Eeprom(EepromError::WriteTimeout))
        );
    }
}
