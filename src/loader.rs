// Slave-serial bitstream loader.
//
// Pulls bitstream chunks from the configuration channel and shifts them into
// the FPGA over the serial link (CCLK/DIN), framed by the PROG_B / INIT_B /
// DONE handshake.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiBus;

use crate::config::{CHUNK_TIMEOUT_MS, DONE_SETTLE_MS, FPGA_BOOT_MS, RESET_PULSE_MS};
use crate::error::{LoadError, SourceError};
use crate::events::SessionToken;
use crate::handshake::{ConfigPins, HandshakeGate};
use crate::log::{debug, info, warn};

/// Producer side of the bitstream path.
#[allow(async_fn_in_trait)]
pub trait ChunkSource {
    /// Next filled buffer. A buffer that arrives exactly at `timeout_ms` is
    /// not a timeout.
    async fn acquire(&mut self, timeout_ms: u32) -> Result<&[u8], SourceError>;

    /// Hand the last acquired buffer back to the producer.
    fn release(&mut self) -> Result<(), SourceError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitstreamTransfer {
    pub total_length: u32,
    pub packet_size: u16,
    pub bytes_transferred: u32,
}

#[derive(Default)]
pub struct Loader {
    transfer: BitstreamTransfer,
}

impl Loader {
    pub const fn new() -> Self {
        Self {
            transfer: BitstreamTransfer {
                total_length: 0,
                packet_size: 0,
                bytes_transferred: 0,
            },
        }
    }

    pub fn transfer(&self) -> BitstreamTransfer {
        self.transfer
    }

    pub fn clear(&mut self) {
        self.transfer = BitstreamTransfer::default();
    }

    /// Run one configuration cycle.
    ///
    /// Never returns `Ok` unless every byte was shifted and DONE is high.
    /// A low DONE wins over any error seen while streaming.
    pub async fn load<P, D, S, L>(
        &mut self,
        total_length: u32,
        packet_size: u16,
        gate: &mut HandshakeGate<P, D>,
        source: &mut S,
        link: &mut L,
        session: SessionToken<'_>,
    ) -> Result<(), LoadError>
    where
        P: ConfigPins,
        D: DelayNs,
        S: ChunkSource,
        L: SpiBus<u8>,
    {
        self.transfer = BitstreamTransfer {
            total_length,
            packet_size,
            bytes_transferred: 0,
        };
        info!("bitstream load: {} bytes, packet {}", total_length, packet_size);

        gate.hold_reset();
        if gate.is_ready() {
            warn!("INIT_B high while PROG_B held");
            gate.release_reset();
            return Err(LoadError::AlreadyConfigured);
        }
        gate.settle(RESET_PULSE_MS).await;
        gate.release_reset();
        gate.settle(FPGA_BOOT_MS).await;
        if !gate.is_ready() {
            warn!("INIT_B stayed low after reset");
            return Err(LoadError::HandshakeTimeout);
        }

        let streamed = self.stream(source, link, &session).await;
        let flushed = link.flush().await;
        let streamed = match (streamed, flushed) {
            (Ok(()), Err(_)) => Err(LoadError::TransferFault),
            (streamed, _) => streamed,
        };

        gate.settle(DONE_SETTLE_MS).await;
        if !gate.is_done() {
            warn!(
                "DONE low after {}/{} bytes",
                self.transfer.bytes_transferred,
                total_length
            );
            return Err(LoadError::HandshakeFailed);
        }
        streamed?;
        if self.transfer.bytes_transferred < total_length {
            warn!("load cancelled at {} bytes", self.transfer.bytes_transferred);
            return Err(LoadError::Aborted);
        }
        info!("bitstream load complete");
        Ok(())
    }

    async fn stream<S, L>(
        &mut self,
        source: &mut S,
        link: &mut L,
        session: &SessionToken<'_>,
    ) -> Result<(), LoadError>
    where
        S: ChunkSource,
        L: SpiBus<u8>,
    {
        let packet = usize::from(self.transfer.packet_size.max(1));
        while self.transfer.bytes_transferred < self.transfer.total_length && session.is_live() {
            let chunk = match source.acquire(CHUNK_TIMEOUT_MS).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("bitstream chunk: {}", e);
                    return Err(LoadError::BufferTimeout);
                }
            };

            let owed = (self.transfer.total_length - self.transfer.bytes_transferred) as usize;
            let mut fault = false;
            for piece in chunk[..chunk.len().min(owed)].chunks(packet) {
                if link.write(piece).await.is_err() {
                    fault = true;
                    break;
                }
                self.transfer.bytes_transferred += piece.len() as u32;
            }
            debug!("shifted {} bytes", self.transfer.bytes_transferred);

            let released = source.release();
            if fault {
                return Err(LoadError::TransferFault);
            }
            if released.is_err() {
                return Err(LoadError::BufferTimeout);
            }
        }
        Ok(())
    }
}
