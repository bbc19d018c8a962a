#![deny(unsafe_code)]
#![deny(warnings)]
#![no_main]
#![no_std]

extern crate panic_semihosting;

use cortex_m_semihosting::hprintln;

use rfm12b::{Band, Link, LinkState, NodeConfig, TransceiverPort};

use stm32f1xx_hal::{
    self,
    gpio::{
        gpioa::{PA5, PA6, PA7},
        gpiob::{PB1, PB10},
        gpioc::PC13,
        Alternate, Edge, ExtiPin, Floating, Input, Output, PullUp, PushPull, State,
    },
    pac,
    prelude::*,
    spi::{Mode, Phase, Polarity, Spi, Spi1NoRemap},
    timer::{CountDownTimer, Event, Timer},
};

type RadioSel = PB1<Output<PushPull>>;
type RadioIrq = PB10<Input<PullUp>>;

type RadioSpi = Spi<
    pac::SPI1,
    Spi1NoRemap,
    (
        PA5<Alternate<PushPull>>,
        PA6<Input<Floating>>,
        PA7<Alternate<PushPull>>,
    ),
>;

const GROUP: u8 = 212;
const NODE: u8 = 9;

pub struct RadioPort {
    spi: RadioSpi,
    nsel: RadioSel,
}

impl TransceiverPort for RadioPort {
    fn command(&mut self, word: u16) -> u16 {
        self.nsel.set_low().unwrap();
        let mut exchange = word.to_be_bytes();
        let reply = {
            let reply = self.spi.transfer(&mut exchange).unwrap();
            u16::from(reply[0]) << 8 | u16::from(reply[1])
        };
        self.nsel.set_high().unwrap();
        reply
    }
}

#[rtic::app(device = stm32f1xx_hal::pac, peripherals = true)]
const APP: () = {
    struct Resources {
        link: Link<RadioPort>,
        irq: RadioIrq,
        timer: CountDownTimer<pac::TIM2>,
        led: PC13<Output<PushPull>>,
    }

    #[init]
    fn init(cx: init::Context) -> init::LateResources {
        let peripherals = cx.device;

        let mut flash = peripherals.FLASH.constrain();
        let mut rcc = peripherals.RCC.constrain();

        let clocks = rcc.cfgr.use_hse(8.mhz()).freeze(&mut flash.acr);

        let mut afio = peripherals.AFIO.constrain(&mut rcc.apb2);

        let mut gpioa = peripherals.GPIOA.split(&mut rcc.apb2);
        let mut gpiob = peripherals.GPIOB.split(&mut rcc.apb2);
        let mut gpioc = peripherals.GPIOC.split(&mut rcc.apb2);

        let led = gpioc
            .pc13
            .into_push_pull_output_with_state(&mut gpioc.crh, State::High);

        let nsel = gpiob
            .pb1
            .into_push_pull_output_with_state(&mut gpiob.crl, State::High);

        let spi_pins = (
            gpioa.pa5.into_alternate_push_pull(&mut gpioa.crl),
            gpioa.pa6.into_floating_input(&mut gpioa.crl),
            gpioa.pa7.into_alternate_push_pull(&mut gpioa.crl),
        );

        let spi_mode = Mode {
            polarity: Polarity::IdleLow,
            phase: Phase::CaptureOnFirstTransition,
        };

        let spi = Spi::spi1(
            peripherals.SPI1,
            spi_pins,
            &mut afio.mapr,
            spi_mode,
            1.mhz(),
            clocks,
            &mut rcc.apb2,
        );

        let mut irq = gpiob.pb10.into_pull_up_input(&mut gpiob.crh);
        irq.make_interrupt_source(&mut afio);
        irq.trigger_on_edge(&peripherals.EXTI, Edge::FALLING);
        irq.enable_interrupt(&peripherals.EXTI);

        let link = Link::new(
            NodeConfig {
                band: Band::Mhz868,
                group: GROUP,
                node: NODE,
            },
            RadioPort { spi, nsel },
        );
        link.begin();

        hprintln!("listening as node {} in group {}", NODE, GROUP).unwrap();

        let mut timer =
            Timer::tim2(peripherals.TIM2, &clocks, &mut rcc.apb1).start_count_down(1.hz());
        timer.listen(Event::Update);

        init::LateResources {
            link,
            irq,
            timer,
            led,
        }
    }

    #[task(binds = EXTI15_10, priority = 1, resources = [ irq, link ], spawn = [ deliver ])]
    fn radio_irq(c: radio_irq::Context) {
        if c.resources.irq.is_low().unwrap() {
            c.resources.link.on_interrupt();
            if c.resources.link.state() == LinkState::ReceiveComplete {
                c.spawn.deliver().ok();
            }
        }
        c.resources.irq.clear_interrupt_pending_bit();
    }

    #[task(resources = [ link, led ])]
    fn deliver(c: deliver::Context) {
        if let Some(frame) = c.resources.link.poll_frame() {
            c.resources.led.toggle().unwrap();
            hprintln!(
                "node {} -> {}: {} bytes",
                frame.sender,
                frame.destination,
                frame.payload.len()
            )
            .unwrap();
        }
    }

    #[task(binds = TIM2, priority = 1, resources = [ link, timer ])]
    fn tick(c: tick::Context) {
        // keeps the receiver armed after begin() and between frames
        if c.resources.link.state() == LinkState::Idle {
            c.resources.link.poll_frame();
        }
        c.resources.timer.clear_update_interrupt_flag();
    }

    extern "C" {
        fn USART2();
    }
};
