#![no_std]
#![feature(start)]

extern crate kernel;

use kernel::string::strlen;
use ulib::stubs::write;

#[start]
fn main(argc: isize, argv: *const *const u8) -> isize {
    unsafe {
        let args = core::slice::from_raw_parts(argv, argc as usize);

        for i in 1..argc {
            let arg = args[i as usize];
            let len = strlen(arg);
            write(1, arg, len as i32);
            if i + 1 < argc {
                write(1, &(' ' as u8) as *const u8, 1);
            } else {
                write(1, &('\n' as u8) as *const u8, 1);
            }
        }
    }

    0
}
