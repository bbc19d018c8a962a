#![deny(unsafe_code)]
#![deny(warnings)]
#![no_main]
#![no_std]

extern crate panic_semihosting;

use rfm12b::{Band, Link, NodeConfig, TransceiverPort};

use stm32f1xx_hal::{
    self,
    gpio::{
        gpioa::{PA5, PA6, PA7},
        gpiob::{PB1, PB10, PB12},
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
const NODE: u8 = 5;
const SINK: u8 = 9;

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
        timer: CountDownTimer<pac::TIM1>,
        led: PB12<Output<PushPull>>,
        beacon: u32,
    }

    #[init]
    fn init(cx: init::Context) -> init::LateResources {
        let peripherals = cx.device;

        let mut flash = peripherals.FLASH.constrain();
        let mut rcc = peripherals.RCC.constrain();

        // Freeze the configuration of all the clocks in the system and store
        // the frozen frequencies in `clocks`
        let clocks = rcc.cfgr.use_hse(8.mhz()).freeze(&mut flash.acr);

        // Prepare the alternate function I/O registers
        let mut afio = peripherals.AFIO.constrain(&mut rcc.apb2);

        let mut gpioa = peripherals.GPIOA.split(&mut rcc.apb2);
        let mut gpiob = peripherals.GPIOB.split(&mut rcc.apb2);

        let led = gpiob
            .pb12
            .into_push_pull_output_with_state(&mut gpiob.crh, State::Low);

        // radio select idles high
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

        // nIRQ from the radio, falling edge
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

        // one beacon per second
        let mut timer =
            Timer::tim1(peripherals.TIM1, &clocks, &mut rcc.apb2).start_count_down(1.hz());
        timer.listen(Event::Update);

        init::LateResources {
            link,
            irq,
            timer,
            led,
            beacon: 0,
        }
    }

    #[task(binds = EXTI15_10, priority = 1, resources = [ irq, link ])]
    fn radio_irq(c: radio_irq::Context) {
        if c.resources.irq.is_low().unwrap() {
            c.resources.link.on_interrupt();
        }
        c.resources.irq.clear_interrupt_pending_bit();
    }

    #[task(binds = TIM1_UP, priority = 1, resources = [ link, timer, led, beacon ])]
    fn tick(c: tick::Context) {
        let payload = c.resources.beacon.to_be_bytes();
        // busy channel or an in-flight frame: skip this beat, retry next one
        if c.resources.link.write_frame(SINK, &payload, false).is_ok() {
            *c.resources.beacon += 1;
            c.resources.led.toggle().unwrap();
        }
        c.resources.timer.clear_update_interrupt_flag();
    }
};
