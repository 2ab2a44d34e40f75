// Thin argument-fetching wrappers around proc.rs's process-management
// primitives. The real logic (process table, scheduling, wait_lock
// discipline) lives there; this file only pulls syscall arguments out
// of the trapframe.

use crate::proc;
use crate::proc::myproc;
use crate::trap::TICKS_LOCK;
use crate::vm::{uvmalloc, uvmdealloc};
use crate::riscv::PTE_W;
use crate::syscall::syscall::{argaddr, argint};

pub(crate) fn sys_fork() -> u64 {
    proc::fork() as u64
}

pub(crate) fn sys_exit() -> u64 {
    let n = argint(0);
    proc::exit(n)
}

pub(crate) fn sys_wait() -> u64 {
    let addr = argaddr(0);
    proc::wait(addr) as u64
}

pub(crate) fn sys_kill() -> u64 {
    let pid = argint(0) as u32;
    proc::kill(pid) as u64
}

pub(crate) fn sys_getpid() -> u64 {
    myproc().pid as u64
}

// Grow or shrink the calling process's memory by n bytes (n may be
// negative). Growth is always eager: uvmalloc maps and zeroes every
// new page before returning, so there is no lazy-growth path to fault
// into later.
pub(crate) fn sys_sbrk() -> u64 {
    let p = myproc();
    let n = argint(0);
    let addr = p.sz;

    if n >= 0 {
        let newsz = uvmalloc(p.pagetable.as_mut().unwrap(), p.sz, p.sz + n as usize, PTE_W);
        if newsz == 0 && n != 0 {
            return u64::MAX;
        }
        p.sz = newsz;
    } else {
        let shrink = (-n) as usize;
        p.sz = uvmdealloc(p.pagetable.as_mut().unwrap(), p.sz, p.sz.saturating_sub(shrink));
    }

    addr as u64
}

fn sleep_ticks(n: u64) -> i32 {
    unsafe {
        let lock = TICKS_LOCK.as_mut().unwrap();
        lock.acquire();
        let start = crate::trap::TICKS;
        while crate::trap::TICKS - start < n {
            if myproc().killed() != 0 {
                lock.release();
                return -1;
            }
            proc::sleep(&crate::trap::TICKS as *const u64, lock);
        }
        lock.release();
    }
    0
}

// sys_sleep() blocks on the global tick channel, like the rest of
// user-visible sleep(2) semantics. sys_pause() is the same wait loop
// under a separate syscall number, for callers that want to nap
// without touching the tick-channel API surface sleep() implies.
pub(crate) fn sys_sleep() -> u64 {
    let n = argint(0);
    if n <= 0 {
        return 0;
    }
    sleep_ticks(n as u64) as u64
}

pub(crate) fn sys_pause() -> u64 {
    let n = argint(0);
    if n <= 0 {
        return 0;
    }
    sleep_ticks(n as u64) as u64
}

pub(crate) fn sys_uptime() -> u64 {
    unsafe {
        let lock = TICKS_LOCK.as_mut().unwrap();
        lock.acquire();
        let t = crate::trap::TICKS;
        lock.release();
        t
    }
}
