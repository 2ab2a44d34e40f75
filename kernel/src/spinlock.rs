// Mutual exclusion spin locks.
//
// acquire() disables interrupts on the current CPU before spinning, so
// that holding a lock and then taking an interrupt whose handler tries
// to reacquire the same lock cannot deadlock. release() restores the
// CPU's prior interrupt-enable state, but only once a matching number of
// push_off()/pop_off() calls have unwound (see push_off/pop_off below).

use crate::proc::mycpu;
use crate::riscv::{__sync_lock_release, __sync_lock_test_and_set, __sync_synchronize, intr_get, intr_off, intr_on};

#[derive(Copy, Clone)]
pub struct Spinlock {
    locked: u64,
    name: &'static str,
    cpu: usize, // id of the holding cpu; only meaningful while locked != 0
}

const NOCPU: usize = usize::MAX;

impl Spinlock {
    pub const fn init_lock(name: &'static str) -> Self {
        Spinlock {
            locked: 0,
            name,
            cpu: NOCPU,
        }
    }

    pub fn acquire(&mut self) {
        push_off(); // disable interrupts to avoid deadlock.
        if self.holding() {
            panic!("acquire: {}", self.name);
        }

        // amoswap.w.aq turns this into an atomic test-and-set on riscv.
        while __sync_lock_test_and_set(&mut self.locked as *mut u64, 1) != 0 {}

        // Don't let loads/stores in the critical section be reordered
        // before the lock is visibly held.
        __sync_synchronize();

        self.cpu = crate::proc::cpuid();
    }

    pub fn release(&mut self) {
        if !self.holding() {
            panic!("release: {}", self.name);
        }

        self.cpu = NOCPU;

        __sync_synchronize();
        __sync_lock_release(&self.locked as *const u64);

        pop_off();
    }

    // Caller's interrupts must be off, or the answer might change under us.
    pub fn holding(&self) -> bool {
        self.locked != 0 && self.cpu == crate::proc::cpuid()
    }
}

/// push_off/pop_off are like intr_off()/intr_on() except that they nest:
/// it takes as many pop_off()s to re-enable interrupts as there were
/// push_off()s. If interrupts were already off when the outermost
/// push_off() ran, pop_off() leaves them off.
pub fn push_off() {
    let old = intr_get();
    intr_off();

    let cpu = mycpu();
    if cpu.noff == 0 {
        cpu.intena = old;
    }
    cpu.noff += 1;
}

pub fn pop_off() {
    let cpu = mycpu();
    if intr_get() {
        panic!("pop_off: interruptible");
    }
    if cpu.noff < 1 {
        panic!("pop_off");
    }
    cpu.noff -= 1;
    if cpu.noff == 0 && cpu.intena {
        intr_on();
    }
}
