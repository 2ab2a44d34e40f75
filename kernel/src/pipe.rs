use crate::file::{File, FDType};
use crate::file::file::filealloc;
use crate::kalloc::KMEM;
use crate::proc::{either_copyin, either_copyout, myproc, sleep, wakeup};
use crate::spinlock::Spinlock;

const PIPESIZE: usize = 512;
pub struct Pipe {
    lock: Spinlock,
    data: [u8; PIPESIZE],
    nread: u32, // number of bytes read
    nwrite: u32, // number of bytes written
    readopen: bool, // read fd is still open
    writeopen: bool, // write fd is still open
}

impl Pipe {
    pub(crate) fn close(self: &mut Self, writable: bool) {
        self.lock.acquire();
        if writable {
            self.writeopen = false;
            wakeup(&self.nread as *const u32);
        } else {
            self.readopen = false;
            wakeup(&self.nwrite as *const u32);
        }
        if !self.readopen && !self.writeopen {
            self.lock.release();
            unsafe { KMEM.kfree(self as *mut Pipe); }
        } else {
            self.lock.release();
        }
    }

    // Write n bytes from the user/kernel address addr into the pipe.
    // Returns the number of bytes written, or -1 on error.
    pub(crate) fn write(self: &mut Self, addr: usize, n: usize) -> i32 {
        let mut i = 0;

        self.lock.acquire();
        while i < n {
            if !self.readopen || myproc().killed() != 0 {
                self.lock.release();
                return -1;
            }

            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                // pipe is full; wake any reader and wait for space.
                wakeup(&self.nread as *const u32);
                sleep(&self.nwrite as *const u32, &mut self.lock);
            } else {
                let mut ch: u8 = 0;
                if either_copyin(&mut ch as *mut u8, true, addr + i, 1) == -1 {
                    break;
                }
                let idx = (self.nwrite as usize) % PIPESIZE;
                self.data[idx] = ch;
                self.nwrite = self.nwrite.wrapping_add(1);
                i += 1;
            }
        }
        wakeup(&self.nread as *const u32);
        self.lock.release();

        i as i32
    }

    // Read up to n bytes from the pipe into the user/kernel address addr.
    // Blocks until at least one byte is available, EOF, or the calling
    // process is killed.
    pub(crate) fn read(self: &mut Self, addr: usize, n: usize) -> i32 {
        self.lock.acquire();

        while self.nread == self.nwrite && self.writeopen {
            if myproc().killed() != 0 {
                self.lock.release();
                return -1;
            }
            sleep(&self.nread as *const u32, &mut self.lock);
        }

        let mut i = 0;
        while i < n {
            if self.nread == self.nwrite {
                break;
            }
            let idx = (self.nread as usize) % PIPESIZE;
            let ch = self.data[idx];
            self.nread = self.nread.wrapping_add(1);

            if either_copyout(true, addr + i, &ch as *const u8, 1) == -1 {
                break;
            }
            i += 1;
        }
        wakeup(&self.nwrite as *const u32);
        self.lock.release();

        i as i32
    }
}

// Allocate a pipe: two files (read/write ends) sharing one Pipe buffer.
// On success stores the new File references through f0/f1 and returns 0;
// on failure cleans up any partial allocation and returns -1.
pub(crate) fn pipealloc(f0: &mut Option<&'static mut File>, f1: &mut Option<&'static mut File>) -> i32 {
    *f0 = None;
    *f1 = None;

    let rf = match filealloc() {
        Some(f) => f,
        None => return -1,
    };
    let wf = match filealloc() {
        Some(f) => f,
        None => {
            rf.ref_cnt = 0;
            return -1;
        }
    };

    let pipe_ptr = unsafe { KMEM.kalloc() } as *mut Pipe;
    if pipe_ptr.is_null() {
        rf.ref_cnt = 0;
        wf.ref_cnt = 0;
        return -1;
    }
    unsafe {
        (*pipe_ptr).lock = Spinlock::init_lock("pipe");
        (*pipe_ptr).readopen = true;
        (*pipe_ptr).writeopen = true;
        (*pipe_ptr).nwrite = 0;
        (*pipe_ptr).nread = 0;
    }

    rf.file_type = FDType::FD_PIPE;
    rf.readable = true;
    rf.writable = false;
    rf.pipe = Some(pipe_ptr);

    wf.file_type = FDType::FD_PIPE;
    wf.readable = false;
    wf.writable = true;
    wf.pipe = Some(pipe_ptr);

    *f0 = Some(rf);
    *f1 = Some(wf);

    0
}