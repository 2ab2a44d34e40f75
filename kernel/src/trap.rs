use crate::MAKE_SATP;
use crate::memlayout::TRAMPOLINE;
use crate::plic::{plic_claim, plic_complete};
use crate::memlayout::{UART0_IRQ, VIRTIO0_IRQ};
use crate::proc::{cpuid, exit, myproc, proc_yield, Procstate};
use crate::riscv::{
    intr_get, intr_off, intr_on, r_scause, r_sepc, r_stimecmp, r_stval, r_time, w_sepc, w_stimecmp,
    PageTable, PGSIZE, r_satp, r_sstatus, r_tp, SSTATUS_SPIE, SSTATUS_SPP, SSTATUS_SIE, w_sstatus, w_stvec,
};
use crate::spinlock::Spinlock;
use crate::uart::UART_INSTANCE;
use crate::virtio::virtio_disk::virtio_disk_intr;

// how often a hart reprograms its own timer interrupt.
const INTERVAL: u64 = 1_000_000;

pub(crate) static mut TICKS_LOCK: Option<Spinlock> = None;
pub(crate) static mut TICKS: u64 = 0;

// in kernelvec.S, calls kerneltrap().
extern {
    static kernelvec: u8;
    static trampoline: u8;
    static uservec: u8;
    static userret: u8;
}

pub fn trapinit() {
    unsafe {
        TICKS_LOCK = Some(Spinlock::init_lock("time"));
    }
}

// set up to take exceptions and traps while in the kernel.
pub fn trapinithart() {
    w_stvec((unsafe { &kernelvec } as *const u8).expose_addr());
}

//
// handle an interrupt, exception, or system call from user space.
// called from trampoline.S
//
#[no_mangle]
extern "C" fn usertrap() {
    if (r_sstatus() & SSTATUS_SPP) != 0 {
        panic!("usertrap: not from user mode");
    }

    // send interrupts and exceptions to kerneltrap(),
    // since we're now in the kernel.
    let kernelvec_addr = (unsafe { &kernelvec } as *const u8).expose_addr();
    w_stvec(kernelvec_addr);

    let p = myproc();

    // save user program counter.
    p.trapframe.as_mut().unwrap().epc = r_sepc() as u64;

    let scause = r_scause();
    if scause == 8 {
        // system call

        if p.killed() != 0 {
            exit(-1);
        }

        // sepc points to the ecall instruction,
        // but we want to return to the next instruction.
        p.trapframe.as_mut().unwrap().epc += 4;

        // an interrupt will change sepc, scause, and sstatus,
        // so enable only now that we're done with those registers.
        intr_on();

        crate::syscall::syscall();
    } else if scause == 13 || scause == 15 {
        // load/store page fault. sbrk grows a process's mapped memory
        // eagerly, so every address within p.sz is already mapped; a
        // fault here is always a genuine error, never a grow request.
        printf!(
            "usertrap(): page fault stval={:#x} pid={}\n",
            r_stval(),
            p.pid
        );
        p.setkilled();
    } else {
        let which_dev = devintr(scause);
        if which_dev == 0 {
            printf!(
                "usertrap(): unexpected scause {:#x} pid={}\n",
                scause,
                p.pid
            );
            printf!("            sepc={:#x} stval={:#x}\n", r_sepc(), r_stval());
            p.setkilled();
        } else if which_dev == 2 {
            // give up the CPU if this is a timer interrupt.
            proc_yield();
        }
    }

    if p.killed() != 0 {
        exit(-1);
    }

    usertrapret();
}

//
// return to user space
//
pub fn usertrapret() {
    let p = myproc();

    // we're about to switch the destination of traps from
    // kerneltrap() to usertrap(), so turn off interrupts until
    // we're back in user space, where usertrap() is correct.
    intr_off();

    // send syscalls, interrupts, and exceptions to uservec in trampoline.S
    let uservec_addr = (unsafe { &uservec } as *const u8).expose_addr();
    let trampoline_addr = (unsafe { &trampoline } as *const u8).expose_addr();
    let trampoline_uservec = TRAMPOLINE + uservec_addr - trampoline_addr;
    w_stvec(trampoline_uservec);

    // set up trapframe values that uservec will need when
    // the process next traps into the kernel.

    let trapframe = p.trapframe.as_deref_mut().unwrap();
    trapframe.kernel_satp = r_satp() as u64;         // kernel page table
    trapframe.kernel_sp = (p.kstack + PGSIZE) as u64; // process's kernel stack
    trapframe.kernel_trap = usertrap as u64;
    trapframe.kernel_hartid = r_tp();         // hartid for cpuid()

    // set up the registers that trampoline.S's sret will use
    // to get to user space.

    // set S Previous Privilege mode to User.
    let mut x = r_sstatus();
    x &= !SSTATUS_SPP; // clear SPP to 0 for user mode
    x |= SSTATUS_SPIE; // enable interrupts in user mode
    w_sstatus(x);

    // set S Exception Program Counter to the saved user pc.
    w_sepc(trapframe.epc as usize);

    // tell trampoline.S the user page table to switch to.
    let satp = MAKE_SATP!((p.pagetable.as_deref().unwrap() as *const PageTable).expose_addr());

    // jump to userret in trampoline.S at the top of memory, which
    // switches to the user page table, restores user registers,
    // and switches to user mode with sret.
    let userret_addr = (unsafe { &userret } as *const u8).expose_addr();
    let trampoline_userret = TRAMPOLINE + userret_addr - trampoline_addr;

    unsafe {
        let func = *(trampoline_userret as *const fn(stap: usize));
        func(satp);
    };
}

// interrupts and exceptions while in supervisor
// mode come here via kernelvec, on whatever the
// current kernel stack is.
#[no_mangle]
extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = r_sstatus();
    let scause = r_scause();

    if (sstatus & SSTATUS_SPP) == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    let which_dev = devintr(scause);
    if which_dev == 0 {
        printf!("scause {:#x}\n", scause);
        printf!(
            "sepc={:#x} stval={:#x}\n",
            sepc,
            r_stval()
        );
        panic!("kerneltrap");
    }

    // give up the CPU if this is a timer interrupt.
    if which_dev == 2 && crate::proc::has_current_proc() {
        let p = myproc();
        if p.state == Procstate::RUNNING {
            proc_yield();
        }
    }

    // the yield() may have caused some traps to occur,
    // so restore trap registers for use by kernelvec.S's sepc instruction.
    w_sepc(sepc);
    w_sstatus(sstatus);
}

// reprogram the timer interrupt to fire INTERVAL cycles from now,
// using the Sstc extension (stimecmp) rather than an M-mode SBI call.
fn clockintr() {
    if cpuid() == 0 {
        unsafe {
            if let Some(lock) = TICKS_LOCK.as_mut() {
                lock.acquire();
                TICKS += 1;
                crate::proc::wakeup(&TICKS as *const u64);
                lock.release();
            }
        }
    }

    // stimecmp is per-hart: every hart must reprogram its own, or it
    // never stops taking timer interrupts once `time` passes it.
    w_stimecmp(r_time() + INTERVAL);
}

// check if it's an external interrupt or software interrupt,
// and handle it.
// returns 2 if timer interrupt,
// 1 if other device,
// 0 if not recognized.
fn devintr(scause: u64) -> i32 {
    if scause == 0x8000000000000009 {
        // this is a supervisor external interrupt, via PLIC.

        // irq indicates which device interrupted.
        let irq = plic_claim();

        if irq as usize == UART0_IRQ {
            unsafe { UART_INSTANCE.intr(); }
        } else if irq as usize == VIRTIO0_IRQ {
            virtio_disk_intr();
        } else if irq != 0 {
            printf!("unexpected interrupt irq={}\n", irq);
        }

        // the PLIC allows each device to raise at most one
        // interrupt at a time; tell the PLIC the device is
        // now allowed to interrupt again.
        if irq != 0 {
            plic_complete(irq);
        }
        1
    } else if scause == 0x8000000000000005 {
        // timer interrupt; clockintr() itself gates the tick bump/wake
        // to CPU 0 but must run on every hart to reprogram stimecmp.
        clockintr();
        2
    } else {
        0
    }
}
