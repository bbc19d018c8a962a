//! Link-layer packet driver for the RFM12B radio transceiver.
//!
//! Turns the byte-oriented, FIFO-buffered radio into a small addressed
//! datagram network: nodes carry an id within a group, frames carry a
//! destination, a sender, up to 63 payload bytes and a 16-bit checksum,
//! and carrier sense keeps two nodes from keying up at once. Delivery is
//! best effort and single hop; there are no acknowledgements and no
//! retransmission.
//!
//! The hardware side is reduced to one synchronous 16-bit exchange,
//! [`TransceiverPort`]. Wire one up (or use [`SpiPort`] over a 16-bit SPI
//! bus), hand it to [`Link::new`] and route the radio's interrupt line
//! into [`Link::on_interrupt`]:
//!
//! ```ignore
//! let link = Link::new(
//!     NodeConfig { band: Band::Mhz868, group: 212, node: 5 },
//!     port,
//! );
//! link.begin();
//!
//! link.write_frame(9, b"hi", false)?;
//!
//! // from the radio's interrupt handler:
//! link.on_interrupt();
//!
//! // back in the main loop:
//! if let Some(frame) = link.poll_frame() {
//!     // frame.sender, frame.payload
//! }
//! ```
//!
//! Everything the interrupt path touches sits behind a critical section,
//! so a `Link` can be shared between the handler and the foreground.

#![cfg_attr(not(test), no_std)]

pub mod cmd;
pub mod crc;
pub mod frame;
pub mod link;

pub use cmd::{SpiPort, TransceiverPort};
pub use frame::{Header, ReceivedFrame, MAX_MESSAGE, MAX_PACKET, MAX_SIGNAL};
pub use link::{Band, Link, LinkState, NodeConfig, TxError};
