//! The transceiver's sixteen-bit command vocabulary and the port it is
//! spoken through.
//!
//! Every interaction with the chip is one full-duplex exchange: shift a
//! command word out, get the status-or-data word back. [`TransceiverPort`]
//! reduces the hardware to exactly that. [`SpiPort`] implements it over a
//! sixteen-bit SPI bus and a select pin; platforms whose bus is fallible
//! implement the trait themselves next to their pin wiring.

use core::convert::Infallible;

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::spi::FullDuplex;
use nb::block;

/// Plain status read, also clears the pending interrupt.
pub const CMD_STATUS: u16 = 0x0000;
/// Power management: receiver chain on.
pub const CMD_RECEIVER_ON: u16 = 0x82DD;
/// Power management: transmitter chain on.
pub const CMD_TRANSMITTER_ON: u16 = 0x823D;
/// Power management: both chains off, oscillator running.
pub const CMD_IDLE: u16 = 0x820D;
/// Power management: everything off.
pub const CMD_SLEEP: u16 = 0x8205;
/// Transmit register write; the data byte lives in the low eight bits.
pub const CMD_TX_WRITE: u16 = 0xB800;
/// Receiver FIFO read; the data byte comes back in the low eight bits.
pub const CMD_FIFO_READ: u16 = 0xB000;
/// FIFO control with the sync-start condition released.
pub const CMD_FIFO_SYNC_HOLD: u16 = 0xCA81;
/// FIFO control armed to fill on the next sync-pattern match.
pub const CMD_FIFO_SYNC_ARM: u16 = 0xCA83;

/// Status bit: a byte is ready in the FIFO, or the transmit register is free.
pub const STATUS_FIFO: u16 = 0x8000;
/// Status bit: received signal strength above threshold, channel occupied.
pub const STATUS_RSSI: u16 = 0x0100;

/// One synchronous command exchange with the transceiver.
///
/// The exchange is total: implementations busy-wait until the hardware has
/// accepted the word and produced its reply.
pub trait TransceiverPort {
    fn command(&mut self, word: u16) -> u16;
}

/// [`TransceiverPort`] over a sixteen-bit full-duplex SPI bus plus the
/// select pin, for buses whose error type is `Infallible`.
pub struct SpiPort<SPI, NSS> {
    spi: SPI,
    nsel: NSS,
}

impl<SPI, NSS> SpiPort<SPI, NSS> {
    pub fn new(spi: SPI, nsel: NSS) -> Self {
        SpiPort { spi, nsel }
    }

    pub fn release(self) -> (SPI, NSS) {
        (self.spi, self.nsel)
    }
}

impl<SPI, NSS> TransceiverPort for SpiPort<SPI, NSS>
where
    SPI: FullDuplex<u16, Error = Infallible>,
    NSS: OutputPin<Error = Infallible>,
{
    fn command(&mut self, word: u16) -> u16 {
        infallible(self.nsel.set_low());
        infallible(block!(self.spi.send(word)));
        let reply = infallible(block!(self.spi.read()));
        infallible(self.nsel.set_high());
        reply
    }
}

fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct ScriptedSpi {
        sent: std::vec::Vec<u16>,
        reply: u16,
    }

    impl FullDuplex<u16> for ScriptedSpi {
        type Error = Infallible;

        fn send(&mut self, word: u16) -> nb::Result<(), Infallible> {
            self.sent.push(word);
            Ok(())
        }

        fn read(&mut self) -> nb::Result<u16, Infallible> {
            Ok(self.reply)
        }
    }

    #[derive(Default)]
    struct SelectPin {
        transitions: std::vec::Vec<bool>,
    }

    impl OutputPin for SelectPin {
        type Error = Infallible;

        fn set_low(&mut self) -> Result<(), Infallible> {
            self.transitions.push(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.transitions.push(true);
            Ok(())
        }
    }

    #[test]
    fn one_word_per_select_window() {
        let spi = ScriptedSpi {
            reply: STATUS_FIFO | STATUS_RSSI,
            ..ScriptedSpi::default()
        };
        let mut port = SpiPort::new(spi, SelectPin::default());

        assert_eq!(port.command(CMD_RECEIVER_ON), STATUS_FIFO | STATUS_RSSI);

        let (spi, nsel) = port.release();
        assert_eq!(spi.sent, [CMD_RECEIVER_ON]);
        assert_eq!(nsel.transitions, [false, true]);
    }
}
