//
// low-level driver routines for the 16550a UART.
//
// out of scope per spec.md S1 ("the 16550a UART driver"); kept to the
// boundary the core actually crosses: a synchronous byte sink
// (putc_sync, used by printf/panic and by console.rs's echo) and a byte
// source that feeds console::consoleintr from the PLIC-routed UART IRQ.
//

use crate::memlayout::UART0;
use crate::console::CONSOLE_INSTANCE;

// the UART control registers are memory-mapped at UART0.
// this driver uses only the bits xv6 uses, with a write-side FIFO size
// of one byte (the receiver FIFO is left as the hardware default).

// the UART control registers, memory-mapped starting at UART0.
const RHR: usize = 0; // receive holding register (read)
const THR: usize = 0; // transmit holding register (write)
const IER: usize = 1; // interrupt enable register
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
const FCR: usize = 2; // FIFO control register (write)
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1; // clear the content of the two FIFOs
const ISR: usize = 2; // interrupt status register (read)
const LCR: usize = 3; // line control register
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7; // special mode to set baud rate
const LSR: usize = 5; // line status register
const LSR_RX_READY: u8 = 1 << 0; // input is waiting to be read from RHR
const LSR_TX_IDLE: u8 = 1 << 5; // THR can accept another character to send

macro_rules! reg {
    ( $r:expr ) => {
        (UART0 + $r) as *mut u8
    };
}

fn read_reg(r: usize) -> u8 {
    unsafe { reg!(r).read_volatile() }
}

fn write_reg(r: usize, v: u8) {
    unsafe { reg!(r).write_volatile(v) }
}

pub(crate) static mut UART_INSTANCE: Uart = Uart::new();

pub struct Uart;

impl Uart {
    const fn new() -> Self {
        Uart
    }

    pub fn init(&self) {
        // disable interrupts.
        write_reg(IER, 0x00);

        // special mode to set baud rate.
        write_reg(LCR, LCR_BAUD_LATCH);

        // LSB for baud rate of 38.4K.
        write_reg(0, 0x03);
        // MSB for baud rate of 38.4K.
        write_reg(1, 0x00);

        // leave set-baud mode, and set word length to 8 bits, no parity.
        write_reg(LCR, LCR_EIGHT_BITS);

        // reset and enable FIFOs.
        write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

        // enable transmit and receive interrupts.
        write_reg(IER, IER_TX_ENABLE | IER_RX_ENABLE);
    }

    // alternate version of putc that doesn't use interrupts, for use by
    // kernel printf() and to echo characters. spins until the UART's
    // output register is empty.
    pub fn putc_sync(&self, c: u8) {
        while (read_reg(LSR) & LSR_TX_IDLE) == 0 {}
        write_reg(THR, c);
    }

    // read one input character from the UART, or None if none is waiting.
    fn getc(&self) -> Option<u8> {
        if read_reg(LSR) & LSR_RX_READY != 0 {
            Some(read_reg(RHR))
        } else {
            None
        }
    }

    // handle a UART interrupt, raised because input has arrived, or the
    // UART is ready for more output, or both. called from devintr().
    pub fn intr(&mut self) {
        // read and process incoming characters.
        loop {
            match self.getc() {
                Some(c) => unsafe { CONSOLE_INSTANCE.consoleintr(c) },
                None => break,
            }
        }

        // reading ISR clears the interrupt; the sync putc path never
        // leaves bytes queued, so there's nothing further to drain here.
        let _ = read_reg(ISR);
    }
}
