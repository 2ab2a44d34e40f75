// File status, shared in spirit with the userspace stat(2) analogue.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i16)]
pub enum FileType {
    NO_TYPE = 0,
    T_DIR = 1,   // directory
    T_FILE = 2,  // file
    T_DEVICE = 3, // device
}

// Result of file_stat(): what fstat() hands back to userspace.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Stat {
    pub dev: i32,         // file system's disk device
    pub ino: u32,         // inode number
    pub file_type: FileType,
    pub nlink: i16,       // number of links to file
    pub size: u64,        // size of file in bytes
}
