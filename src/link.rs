//! The link controller and the two interrupt-driven state machines.
//!
//! One [`Link`] owns the port, the state word and both frame buffers. The
//! interrupt handler and the foreground touch the same state, so all of it
//! sits in a [`critical_section::Mutex`]; every access is one short masked
//! section, foreground and handler alike. Methods take `&self`, which makes
//! a `Link` shareable with an interrupt handler (the type is `Sync`
//! whenever the port is `Send`).
//!
//! The sections are kept short on purpose: while one is held the radio's
//! byte-ready line goes unserviced, and at 57.6 kbps the FIFO gives the
//! handler roughly 140 microseconds per byte before it overruns.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::cmd::{
    TransceiverPort, CMD_FIFO_READ, CMD_FIFO_SYNC_ARM, CMD_FIFO_SYNC_HOLD, CMD_IDLE,
    CMD_RECEIVER_ON, CMD_SLEEP, CMD_STATUS, CMD_TRANSMITTER_ON, CMD_TX_WRITE, STATUS_FIFO,
    STATUS_RSSI,
};
use crate::frame::{ReceivedFrame, RxFrame, TxFrame, PREAMBLE};

/// Carrier band the transceiver is tuned to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Band {
    Mhz433 = 1,
    Mhz868 = 2,
    Mhz915 = 3,
}

/// Per-device identity, fixed at construction.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    pub band: Band,
    /// Network group, embedded in the second sync byte of every frame.
    pub group: u8,
    /// Node id within the group, 1..=31. Zero is the broadcast address.
    pub node: u8,
}

/// What the link is doing right now.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// Both chains off.
    Idle,
    /// Receiver on, waiting for a sync match.
    Listening,
    /// A frame is being assembled byte by byte.
    Receiving,
    /// A sealed frame is waiting for the foreground to collect it.
    ReceiveComplete,
    /// The transmit buffer is being drained byte by byte.
    Sending,
}

/// Why a transmit attempt did not start.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    /// Another transmitter is on the air. Retry later.
    ChannelBusy,
    /// An in-flight reception or drain did not finish within the wait
    /// bound. Retry later.
    ReceiveStall,
}

/// How many state peeks `write_frame` spends waiting for an in-flight
/// frame before giving up. At one peek per few cycles this comfortably
/// covers a worst-case 74-byte frame on the air.
const WAIT_PEEKS: u32 = 0x0002_0000;

struct Shared<P> {
    port: P,
    state: LinkState,
    rx: RxFrame,
    rx_available: bool,
    tx: TxFrame,
}

/// The driver. One instance per transceiver.
pub struct Link<P: TransceiverPort> {
    config: NodeConfig,
    shared: Mutex<RefCell<Shared<P>>>,
}

impl<P: TransceiverPort> Link<P> {
    /// Panics if the node id is outside 1..=31.
    pub fn new(config: NodeConfig, port: P) -> Self {
        assert!(
            config.node >= 1 && config.node <= 31,
            "node id must be 1..=31"
        );
        Link {
            config,
            shared: Mutex::new(RefCell::new(Shared {
                port,
                state: LinkState::Idle,
                rx: RxFrame::new(),
                rx_available: false,
                tx: TxFrame::empty(),
            })),
        }
    }

    /// Runs the one-time configuration script: band, bit rate, filters,
    /// sync pattern and power, with the group id patched into the sync
    /// pattern. Leaves the link idle; the first [`poll_frame`] call turns
    /// the receiver on.
    ///
    /// [`poll_frame`]: Link::poll_frame
    pub fn begin(&self) {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow_ref_mut(cs);

            shared.port.command(CMD_STATUS);
            shared.port.command(CMD_SLEEP);
            // the oscillator keeps the interrupt line asserted until it has
            // settled; each status read clears one pending flag
            let mut waits = 0;
            while shared.port.command(CMD_STATUS) & STATUS_FIFO != 0 && waits < 1000 {
                waits += 1;
            }

            let band = self.config.band as u16;
            shared.port.command(0x80C7 | band << 4); // TX on, RX FIFO on, 12.0 pF
            shared.port.command(0xA640); // center frequency
            shared.port.command(0xC606); // 57.6 kbps
            shared.port.command(0x94A2); // VDI, fast, 134 kHz, 0 dBm, -91 dBm
            shared.port.command(0xC2AC); // data filter: auto lock, digital, DQD4
            shared.port.command(CMD_FIFO_SYNC_ARM); // FIFO depth 8, two-byte sync
            shared.port.command(0xCE00 | u16::from(self.config.group)); // sync pattern 2D + group
            shared.port.command(0xC483); // AFC: keep offset, no restriction
            shared.port.command(0x9850); // 90 kHz deviation, max output
            shared.port.command(0xCC77); // PLL settings
            shared.port.command(0xE000); // wake-up timer off
            shared.port.command(0xC800); // low duty-cycle off
            shared.port.command(0xC049); // clock output 1.66 MHz, low-battery 3.1 V

            // drop whatever the FIFO framed while the radio settled
            let mut flushes = 0;
            while shared.port.command(CMD_STATUS) & STATUS_FIFO != 0 && flushes < 8 {
                shared.port.command(CMD_TX_WRITE);
                shared.port.command(CMD_FIFO_READ);
                flushes += 1;
            }

            shared.state = LinkState::Idle;
        });
    }

    /// Pre-flight carrier sense. `false` means another transmitter is on
    /// the air; `true` means the channel was clear and the link has been
    /// idled ready for [`write_frame`](Link::write_frame).
    pub fn can_transmit(&self) -> bool {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow_ref_mut(cs);
            if shared.port.command(CMD_STATUS) & STATUS_RSSI != 0 {
                return false;
            }
            shared.port.command(CMD_IDLE);
            shared.port.command(CMD_STATUS);
            shared.port.command(CMD_FIFO_READ);
            // a half-assembled frame is stale once the receiver is off
            shared.rx.reset();
            shared.rx_available = false;
            shared.state = LinkState::Idle;
            true
        })
    }

    /// Builds a frame and arms the transmit state machine.
    ///
    /// Waits out an in-flight reception or a previous drain (bounded, see
    /// [`TxError::ReceiveStall`]), then re-checks the carrier under the
    /// same masked section that arms the transmitter. Returns as soon as
    /// the state machine is armed; completion shows up as the state going
    /// back to [`LinkState::Idle`].
    ///
    /// An `anonymous` frame carries sender id zero.
    pub fn write_frame(
        &self,
        destination: u8,
        payload: &[u8],
        anonymous: bool,
    ) -> Result<(), TxError> {
        // interrupts stay enabled between peeks so the state machine can
        // actually finish what it is doing
        let mut peeks: u32 = 0;
        loop {
            let busy = critical_section::with(|cs| {
                matches!(
                    self.shared.borrow_ref(cs).state,
                    LinkState::Receiving | LinkState::Sending
                )
            });
            if !busy {
                break;
            }
            peeks += 1;
            if peeks >= WAIT_PEEKS {
                return Err(TxError::ReceiveStall);
            }
        }

        critical_section::with(|cs| {
            let mut shared = self.shared.borrow_ref_mut(cs);
            if shared.port.command(CMD_STATUS) & STATUS_RSSI != 0 {
                // carrier sensed, leave state and buffers untouched
                return Err(TxError::ChannelBusy);
            }
            shared.port.command(CMD_IDLE);
            shared.port.command(CMD_STATUS);
            shared.port.command(CMD_FIFO_READ);
            shared.port.command(CMD_FIFO_READ);

            let sender = if anonymous { 0 } else { self.config.node };
            shared.tx = TxFrame::encode(self.config.group, destination, sender, payload);
            shared.state = LinkState::Sending;
            shared.port.command(CMD_STATUS);
            shared.port.command(CMD_TRANSMITTER_ON);
            Ok(())
        })
    }

    /// Collects a received frame, if one is waiting and addressed here.
    ///
    /// From [`LinkState::Idle`] this arms the receiver instead. A sealed
    /// frame that fails its checksum or names another node is dropped
    /// silently; in every case the receiver is re-armed afterwards.
    pub fn poll_frame(&self) -> Option<ReceivedFrame> {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow_ref_mut(cs);
            match shared.state {
                LinkState::Idle => {
                    // a frame sealed but never collected is stale by now
                    shared.rx.reset();
                    shared.rx_available = false;
                    shared.port.command(CMD_STATUS);
                    shared.port.command(CMD_RECEIVER_ON);
                    shared.state = LinkState::Listening;
                    None
                }
                LinkState::ReceiveComplete if shared.rx_available => {
                    let frame = shared.rx.accept(self.config.node);
                    shared.rx.reset();
                    shared.rx_available = false;
                    shared.port.command(CMD_STATUS);
                    shared.port.command(CMD_RECEIVER_ON);
                    shared.state = LinkState::Listening;
                    frame
                }
                _ => None,
            }
        })
    }

    /// Snapshot of the link state.
    pub fn state(&self) -> LinkState {
        critical_section::with(|cs| self.shared.borrow_ref(cs).state)
    }

    /// The single interrupt entry point. Call once per byte-ready event
    /// from the transceiver's interrupt line.
    pub fn on_interrupt(&self) {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow_ref_mut(cs);
            let shared = &mut *shared;
            // reading the status word also drops the interrupt line
            let status = shared.port.command(CMD_STATUS);
            match shared.state {
                LinkState::Listening => {
                    // the event that reports the sync match already carries
                    // the first frame byte, so consume it in the same pass
                    shared.state = LinkState::Receiving;
                    receive_byte(shared, status);
                }
                LinkState::Receiving => receive_byte(shared, status),
                LinkState::Sending => transmit_byte(shared),
                LinkState::ReceiveComplete | LinkState::Idle => {}
            }
        });
    }
}

fn receive_byte<P: TransceiverPort>(shared: &mut Shared<P>, status: u16) {
    if status & STATUS_FIFO == 0 {
        return;
    }
    let byte = (shared.port.command(CMD_FIFO_READ) & 0x00FF) as u8;
    if shared.rx.push(byte) {
        shared.port.command(CMD_STATUS);
        shared.port.command(CMD_IDLE);
        // re-arm the sync detector so the FIFO frames the next packet
        shared.port.command(CMD_FIFO_SYNC_HOLD);
        shared.port.command(CMD_FIFO_SYNC_ARM);
        shared.rx_available = true;
        shared.state = LinkState::ReceiveComplete;
    }
}

fn transmit_byte<P: TransceiverPort>(shared: &mut Shared<P>) {
    match shared.tx.next() {
        Some(byte) => {
            shared.port.command(CMD_TX_WRITE | u16::from(byte));
        }
        None => {
            shared.port.command(CMD_STATUS);
            shared.port.command(CMD_IDLE);
            // one more pad byte pushes the frame tail out of the shift
            // register before the transmitter goes quiet
            shared.port.command(CMD_TX_WRITE | u16::from(PREAMBLE));
            shared.state = LinkState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Header;

    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Default)]
    struct MockState {
        status: u16,
        fifo: VecDeque<u8>,
        log: Vec<u16>,
    }

    /// Scripted transceiver: a settable status word, a FIFO byte queue and
    /// a log of every command word it was given.
    #[derive(Clone, Default)]
    struct MockPort(Rc<RefCell<MockState>>);

    impl MockPort {
        fn set_status(&self, status: u16) {
            self.0.borrow_mut().status = status;
        }

        fn queue_byte(&self, byte: u8) {
            self.0.borrow_mut().fifo.push_back(byte);
        }

        fn log(&self) -> Vec<u16> {
            self.0.borrow().log.clone()
        }

        /// Every data byte pushed at the transmit register, in order.
        fn tx_bytes(&self) -> Vec<u8> {
            self.0
                .borrow()
                .log
                .iter()
                .filter(|&&word| word & 0xFF00 == CMD_TX_WRITE)
                .map(|&word| (word & 0x00FF) as u8)
                .collect()
        }
    }

    impl TransceiverPort for MockPort {
        fn command(&mut self, word: u16) -> u16 {
            let mut state = self.0.borrow_mut();
            state.log.push(word);
            match word {
                CMD_STATUS => state.status,
                CMD_FIFO_READ => u16::from(state.fifo.pop_front().unwrap_or(0)),
                _ => 0,
            }
        }
    }

    fn test_link(node: u8) -> (Link<MockPort>, MockPort) {
        let port = MockPort::default();
        let link = Link::new(
            NodeConfig {
                band: Band::Mhz915,
                group: 212,
                node,
            },
            port.clone(),
        );
        (link, port)
    }

    /// One byte-ready event delivering one FIFO byte.
    fn feed(link: &Link<MockPort>, port: &MockPort, byte: u8) {
        port.set_status(STATUS_FIFO);
        port.queue_byte(byte);
        link.on_interrupt();
    }

    /// Runs the transmitter to completion, returning the wire bytes.
    fn transmit(link: &Link<MockPort>, port: &MockPort) -> Vec<u8> {
        let mut events = 0;
        while link.state() == LinkState::Sending {
            link.on_interrupt();
            events += 1;
            assert!(events < 100, "transmitter never went idle");
        }
        port.tx_bytes()
    }

    #[test]
    fn begin_runs_the_setup_script_and_idles() {
        let (link, port) = test_link(5);
        link.begin();

        let log = port.log();
        assert!(log.contains(&0x80F7)); // band 3 patched into the config word
        assert!(log.contains(&(0xCE00 | 212))); // group patched into the sync pattern
        assert!(log.contains(&0xC606));
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn poll_arms_the_receiver_from_idle() {
        let (link, port) = test_link(5);
        assert_eq!(link.poll_frame(), None);
        assert_eq!(link.state(), LinkState::Listening);
        assert!(port.log().contains(&CMD_RECEIVER_ON));

        // already listening: nothing to do, nothing to hand out
        assert_eq!(link.poll_frame(), None);
        assert_eq!(link.state(), LinkState::Listening);
    }

    #[test]
    fn carrier_detect_refuses_to_transmit() {
        let (link, port) = test_link(5);
        port.set_status(STATUS_RSSI);

        assert_eq!(link.write_frame(9, b"hi", false), Err(TxError::ChannelBusy));
        assert_eq!(link.state(), LinkState::Idle);
        assert!(!port.log().contains(&CMD_TRANSMITTER_ON));
        assert!(port.tx_bytes().is_empty());
    }

    #[test]
    fn can_transmit_reports_the_carrier() {
        let (link, port) = test_link(5);
        port.set_status(STATUS_RSSI);
        assert!(!link.can_transmit());

        port.set_status(0);
        assert!(link.can_transmit());
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn transmit_drains_the_whole_frame_then_idles() {
        let (link, port) = test_link(5);
        link.write_frame(9, b"hi", false).unwrap();
        assert_eq!(link.state(), LinkState::Sending);

        let wire = port.tx_bytes();
        assert!(wire.is_empty(), "arming must not push data bytes");

        let wire = transmit(&link, &port);
        // 14 frame bytes plus the final flush pad
        assert_eq!(wire.len(), 15);
        assert_eq!(&wire[..5], [0xAA, 0xAA, 0xAA, 0x2D, 212]);
        assert_eq!(*wire.last().unwrap(), 0xAA);
        assert_eq!(link.state(), LinkState::Idle);

        let header = Header::from_bytes([wire[5], wire[6]]);
        assert_eq!((header.destination, header.sender, header.length), (9, 5, 2));
    }

    #[test]
    fn anonymous_frames_carry_sender_zero() {
        let (link, port) = test_link(5);
        link.write_frame(9, b"hi", true).unwrap();
        let wire = transmit(&link, &port);

        let header = Header::from_bytes([wire[5], wire[6]]);
        assert_eq!(header.sender, 0);
        assert_eq!(header.destination, 9);
    }

    #[test]
    fn frames_cross_between_nodes() {
        let (tx_link, tx_port) = test_link(5);
        tx_link.write_frame(9, b"hi", false).unwrap();
        let wire = transmit(&tx_link, &tx_port);

        let (rx_link, rx_port) = test_link(9);
        assert_eq!(rx_link.poll_frame(), None); // arms the receiver
        assert_eq!(rx_link.state(), LinkState::Listening);

        // the radio strips preamble and both sync bytes before the FIFO,
        // so delivery starts at the first header byte
        for &byte in &wire[5..11] {
            feed(&rx_link, &rx_port, byte);
        }
        assert_eq!(rx_link.state(), LinkState::ReceiveComplete);

        let received = rx_link.poll_frame().expect("frame should surface");
        assert_eq!(received.sender, 5);
        assert_eq!(received.destination, 9);
        assert_eq!(&received.payload[..], b"hi");

        // collecting the frame re-arms listening
        assert_eq!(rx_link.state(), LinkState::Listening);
    }

    #[test]
    fn frames_for_other_nodes_are_dropped_silently() {
        let (tx_link, tx_port) = test_link(5);
        tx_link.write_frame(9, b"hi", false).unwrap();
        let wire = transmit(&tx_link, &tx_port);

        let (rx_link, rx_port) = test_link(7);
        rx_link.poll_frame();
        for &byte in &wire[5..11] {
            feed(&rx_link, &rx_port, byte);
        }

        assert_eq!(rx_link.poll_frame(), None);
        assert_eq!(rx_link.state(), LinkState::Listening);
    }

    #[test]
    fn broadcast_frames_reach_every_node() {
        let (tx_link, tx_port) = test_link(5);
        tx_link.write_frame(0, b"all", false).unwrap();
        let wire = transmit(&tx_link, &tx_port);

        for node in [7, 31] {
            let (rx_link, rx_port) = test_link(node);
            rx_link.poll_frame();
            for &byte in &wire[5..12] {
                feed(&rx_link, &rx_port, byte);
            }
            let received = rx_link.poll_frame().expect("broadcast should surface");
            assert_eq!(&received.payload[..], b"all");
        }
    }

    #[test]
    fn corrupt_frames_are_dropped_silently() {
        let (tx_link, tx_port) = test_link(5);
        tx_link.write_frame(9, b"hi", false).unwrap();
        let mut wire = transmit(&tx_link, &tx_port);
        wire[7] ^= 0x10; // first payload byte

        let (rx_link, rx_port) = test_link(9);
        rx_link.poll_frame();
        for &byte in &wire[5..11] {
            feed(&rx_link, &rx_port, byte);
        }

        assert_eq!(rx_link.poll_frame(), None);
        assert_eq!(rx_link.state(), LinkState::Listening);
    }

    #[test]
    fn interrupts_while_complete_leave_the_frame_alone() {
        let (tx_link, tx_port) = test_link(5);
        tx_link.write_frame(9, b"hi", false).unwrap();
        let wire = transmit(&tx_link, &tx_port);

        let (rx_link, rx_port) = test_link(9);
        rx_link.poll_frame();
        for &byte in &wire[5..11] {
            feed(&rx_link, &rx_port, byte);
        }
        assert_eq!(rx_link.state(), LinkState::ReceiveComplete);

        // stray events before the foreground collects the frame
        feed(&rx_link, &rx_port, 0xAA);
        feed(&rx_link, &rx_port, 0xAA);
        assert_eq!(rx_link.state(), LinkState::ReceiveComplete);

        let received = rx_link.poll_frame().expect("frame should survive");
        assert_eq!(&received.payload[..], b"hi");
    }

    #[test]
    fn transmit_during_reception_times_out() {
        let (link, port) = test_link(5);
        link.poll_frame();
        feed(&link, &port, 0x48); // first header byte only
        assert_eq!(link.state(), LinkState::Receiving);

        port.set_status(0);
        assert_eq!(link.write_frame(9, b"x", false), Err(TxError::ReceiveStall));
        assert_eq!(link.state(), LinkState::Receiving);
    }

    #[test]
    fn spurious_events_while_listening_consume_nothing() {
        let (link, port) = test_link(5);
        link.poll_frame();
        port.set_status(0); // byte-ready not set
        link.on_interrupt();

        // no FIFO read happened
        assert!(!port.log().contains(&CMD_FIFO_READ));
    }

    #[test]
    #[should_panic]
    fn node_id_zero_is_rejected() {
        let port = MockPort::default();
        Link::new(
            NodeConfig {
                band: Band::Mhz433,
                group: 212,
                node: 0,
            },
            port,
        );
    }
}
