// Compile-time kernel configuration.
//
// There is no runtime config file for a freestanding kernel; these
// constants are the configuration surface, sized the way upstream xv6
// sizes them for a small teaching system running under qemu -machine virt.

pub const NPROC: usize = 64; // maximum number of processes
pub const NCPU: usize = 8; // maximum number of CPUs
pub const NOFILE: usize = 16; // open files per process
pub const NFILE: usize = 100; // open files per system
pub const NINODE: usize = 50; // maximum number of active i-nodes
pub const NDEV: usize = 10; // maximum major device number
pub const ROOTDEV: u32 = 1; // device number of file system root disk
pub const MAXARG: usize = 32; // max exec arguments
pub const MAXOPBLOCKS: u32 = 10; // max # of blocks any FS op writes
pub const LOGSIZE: usize = MAXOPBLOCKS as usize * 3; // max data blocks in on-disk log
pub const NBUF: usize = MAXOPBLOCKS as usize * 3; // size of disk block cache
pub const FSSIZE: u32 = 2000; // size of file system in blocks
pub const MAXPATH: usize = 128; // maximum file path name
pub const USERSTACK: usize = 1; // user stack pages
