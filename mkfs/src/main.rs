use crate::deps::FileType::{T_DIR, T_FILE};
use crate::deps::{
    DINode, Dirent, FileType, SuperBlock, BSIZE, DIRSIZ, FSMAGIC, FSSIZE, IPB, LOGSIZE, MAXFILE,
    NDIRECT, NINDIRECT, ROOTINO,
};
use clap::Parser;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::slice::from_raw_parts;
use std::sync::atomic::{AtomicU32, Ordering};
use std::{cmp, io::Result};

mod deps;
const NINODES: u32 = 200;

// Disk layout:
// [ boot block | sb block | log | inode blocks | free bit map | data blocks ]

const NBITMAP: u32 = FSSIZE / (BSIZE as u32 * 8) + 1;
const NINODEBLOCKS: u32 = NINODES / IPB + 1;
const NLOG: u32 = LOGSIZE;

// 1 fs block = 1 disk sector
const NMETA: u32 = 2 + NLOG + NINODEBLOCKS + NBITMAP; // Number of meta blocks (boot, sb, nlog, inode, bitmap)
const NBLOCKS: u32 = FSSIZE - NMETA; // Number of data blocks

const SB: SuperBlock = SuperBlock {
    magic: FSMAGIC,
    size: FSSIZE.to_le(),
    nblocks: NBLOCKS.to_le(),
    ninodes: NINODES.to_le(),
    nlog: NLOG.to_le(),
    logstart: 2u32.to_le(),
    inodestart: (2 + NLOG).to_le(),
    bmapstart: (2 + NLOG + NINODEBLOCKS).to_le(),
};
const ZEROES: [u8; BSIZE] = [0; BSIZE];
static FREEINODE: AtomicU32 = AtomicU32::new(1);

// the first free block that we can allocate
static FREEBLOCK: AtomicU32 = AtomicU32::new(NMETA);

#[derive(Parser, Debug)]
struct Args {
    /// Name of the output img file
    #[arg(short, long)]
    output_name: String,

    /// Files that you want to be contained in the img
    #[arg(short, long)]
    files: Option<Vec<String>>,
}
fn main() -> Result<()> {
    assert_eq!(size_of::<u32>(), 4);
    assert_eq!(BSIZE % size_of::<DINode>(), 0);
    assert_eq!((BSIZE % size_of::<Dirent>()), 0);

    let args: Args = Args::parse();

    let mut img_file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(args.output_name)?;

    println!("nmeta {} (boot, super, log blocks {} inode blocks {}, bitmap blocks {}) blocks {} total {}",
           NMETA, NLOG, NINODEBLOCKS, NBITMAP, NBLOCKS, FSSIZE);

    for i in 0..FSSIZE {
        wsect(&mut img_file, i, &ZEROES)?;
    }

    let x = unsafe {
        from_raw_parts(
            &SB as *const SuperBlock as *const u8,
            size_of::<SuperBlock>(),
        )
    };
    let mut buf: [u8; BSIZE] = [0; BSIZE];
    buf[..x.len()].clone_from_slice(x);
    wsect(&mut img_file, 1, &buf)?;

    let rootino = ialloc(&mut img_file, T_DIR)?;
    assert_eq!(rootino, ROOTINO);

    let mut de = Dirent {
        inum: 0,
        name: [0; DIRSIZ],
    };
    de.inum = (rootino as u16).to_le();
    let v = ".".as_bytes();
    de.name[..v.len()].copy_from_slice(v);
    iappend(&mut img_file, rootino, &de, size_of::<Dirent>() as i32)?;

    de.inum = (rootino as u16).to_le();
    let v = "..".as_bytes();
    de.name[..v.len()].copy_from_slice(v);
    iappend(&mut img_file, rootino, &de, size_of::<Dirent>() as i32)?;

    match args.files {
        Some(files) => {
            for file_name in files.iter() {
                // get rid of "user/"
                let mut short_name = if file_name.starts_with("user/") {
                    file_name[5..].to_string()
                } else {
                    file_name.to_string()
                };

                assert_eq!(short_name.find("/"), None);

                let mut file = File::open(file_name)?;

                // Skip leading _ in name when writing to file system.
                // The binaries are named _rm, _cat, etc. to keep the
                // build operating system from trying to execute them
                // in place of system binaries like rm and cat.
                if let Some(s) = short_name.strip_prefix("_") {
                    short_name = s.to_string();
                }

                let inum = ialloc(&mut img_file, T_FILE)?;

                de.inum = (inum as u16).to_le();
                let v = short_name.as_bytes();
                de.name[..v.len()].copy_from_slice(v);
                iappend(&mut img_file, rootino, &de, size_of::<Dirent>() as i32)?;

                let mut cc = 1;
                while cc > 0 {
                    let mut buf: [u8; BSIZE] = [0; BSIZE];
                    cc = file.read(&mut buf)?;
                    iappend(&mut img_file, inum, &buf, cc as i32)?;
                }
            }
        }
        _ => {}
    }

    // fix size of root inode dir
    let mut din = rinode(&mut img_file, rootino);
    let mut off = din.size.to_le();
    off = (((off as usize / BSIZE) + 1) * BSIZE) as u32;
    din.size = off.to_le();
    winode(&mut img_file, rootino, din)?;

    balloc(&mut img_file, FREEBLOCK.load(Ordering::Relaxed) as i32)?;

    Ok(())
}

fn wsect(f: &mut File, sec: u32, buf: &[u8]) -> Result<()> {
    if f.seek(SeekFrom::Start(sec as u64 * BSIZE as u64))? != sec as u64 * BSIZE as u64 {
        panic!("lseek");
    }
    if f.write(buf)? != BSIZE {
        panic!("write");
    }

    Ok(())
}

fn rsect(f: &mut File, sec: u32, buf: &mut [u8]) -> Result<()> {
    if f.seek(SeekFrom::Start(sec as u64 * BSIZE as u64))? != sec as u64 * BSIZE as u64 {
        panic!("lseek");
    }
    if f.read(buf)? != BSIZE {
        panic!("read");
    }

    Ok(())
}

fn winode(f: &mut File, inum: u32, ip: DINode) -> Result<()> {
    let bn = IBLOCK!(inum, &SB);
    let mut buf: [u8; BSIZE] = [0; BSIZE];
    rsect(f, bn, &mut buf)?;

    let ino_sz = size_of::<DINode>();
    let x = unsafe { from_raw_parts(&ip as *const DINode as *const u8, ino_sz) };
    buf[ino_sz * (inum % IPB) as usize..ino_sz * ((inum % IPB) + 1) as usize].clone_from_slice(x);
    wsect(f, bn, &buf)?;

    Ok(())
}

fn rinode(f: &mut File, inum: u32) -> DINode {
    let bn = IBLOCK!(inum, &SB);

    let mut buf: [u8; BSIZE] = [0; BSIZE];
    rsect(f, bn, &mut buf).unwrap();
    let (_head, body, _tail) = unsafe {
        let ino_sz = size_of::<DINode>();
        buf[ino_sz * (inum % IPB) as usize..ino_sz * ((inum % IPB) + 1) as usize]
            .align_to::<DINode>()
    };

    body[0].clone()
}

fn ialloc(f: &mut File, file_type: FileType) -> Result<u32> {
    let inum = FREEINODE.fetch_add(1, Ordering::Relaxed);

    let din = DINode {
        file_type,
        major: 0,
        minor: 0,
        nlink: 1i16.to_le(),
        size: 0u32.to_le(),
        addrs: [0; NDIRECT + 1],
    };
    winode(f, inum, din)?;
    return Ok(inum);
}

fn balloc(f: &mut File, used: i32) -> Result<()> {
    println!("balloc: first {} blocks have been allocated", used);
    assert!(used < (BSIZE * 8) as i32);

    let mut buf: [u8; BSIZE] = [0; BSIZE];
    for i in 0..used as usize {
        buf[i / 8] = buf[i / 8] | (0x1 << (i % 8));
    }

    println!("balloc: write bitmap block at sector {}", &SB.bmapstart);
    wsect(f, (&SB).bmapstart, &buf)?;
    Ok(())
}

fn iappend<T>(f: &mut File, inum: u32, xp: &T, n: i32) -> Result<()> {
    let xp = unsafe { from_raw_parts(xp as *const T as *const u8, size_of::<T>()) };

    let mut din = rinode(f, inum);
    let mut off = din.size.to_le();
    // printf("append inum %d at off %d sz %d\n", inum, off, n);
    let mut n = n;
    let mut indirect: [u32; NINDIRECT] = [0; NINDIRECT];
    let mut buf: [u8; BSIZE] = [0; BSIZE];
    let mut pos = 0;
    while n > 0 {
        let fbn = off as usize / BSIZE;
        assert!(fbn < MAXFILE);
        let x = if fbn < NDIRECT {
            if din.addrs[fbn].to_le() == 0 {
                let a = FREEBLOCK.fetch_add(1, Ordering::Relaxed);
                let b = a.to_le();
                din.addrs[fbn] = b;
            }
            let c = din.addrs[fbn];
            let d = c.to_le();
            d
        } else {
            if din.addrs[NDIRECT].to_le() == 0 {
                din.addrs[NDIRECT] = FREEBLOCK.fetch_add(1, Ordering::Relaxed).to_le();
            }
            let mut buf: [u8; NINDIRECT * 4] = unsafe { std::mem::transmute(indirect) };
            rsect(f, din.addrs[NDIRECT].to_le(), &mut buf)?;
            if indirect[fbn - NDIRECT] == 0 {
                indirect[fbn - NDIRECT] = FREEBLOCK.fetch_add(1, Ordering::Relaxed).to_le();
                let mut buf: [u8; NINDIRECT * 4] = unsafe { std::mem::transmute(indirect) };
                wsect(f, din.addrs[NDIRECT].to_le(), &mut buf)?;
            }
            indirect[fbn - NDIRECT].to_le()
        };

        let n1 = cmp::min(n as usize, (fbn + 1) * BSIZE - off as usize);
        rsect(f, x, &mut buf)?;

        let start = off as usize - (fbn * BSIZE);
        buf[start..start + n1].clone_from_slice(&xp[pos..pos + n1]);
        wsect(f, x, &buf)?;
        n -= n1 as i32;
        off += n1 as u32;
        pos += n1;
    }

    din.size = off.to_le();
    winode(f, inum, din)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Re-read a file written through `iappend`, walking direct and the
    // singly-indirect block by hand the way the kernel's `bmap` does,
    // and return exactly `size` bytes starting at offset 0.
    fn readback(f: &mut File, inum: u32, size: usize) -> Vec<u8> {
        let din = rinode(f, inum);
        let mut indirect: Option<[u8; BSIZE]> = None;
        let mut out = Vec::with_capacity(size);
        let mut off = 0usize;
        while off < size {
            let fbn = off / BSIZE;
            let bn = if fbn < NDIRECT {
                din.addrs[fbn].to_le()
            } else {
                let ind = indirect.get_or_insert_with(|| {
                    let mut buf = [0u8; BSIZE];
                    rsect(f, din.addrs[NDIRECT].to_le(), &mut buf).unwrap();
                    buf
                });
                let idx = (fbn - NDIRECT) * 4;
                u32::from_le_bytes(ind[idx..idx + 4].try_into().unwrap())
            };
            let mut buf = [0u8; BSIZE];
            rsect(f, bn, &mut buf).unwrap();
            let start = off - fbn * BSIZE;
            let n = std::cmp::min(BSIZE - start, size - off);
            out.extend_from_slice(&buf[start..start + n]);
            off += n;
        }
        out
    }

    fn blank_image() -> std::fs::File {
        let tmp = tempfile::NamedTempFile::new().expect("create temp image");
        // `tmp`'s directory entry is removed once it drops at the end of
        // this function, but the reopened fd keeps the inode alive for as
        // long as the caller holds it (standard POSIX unlink-while-open).
        let mut f = tmp.reopen().expect("reopen temp image");
        for i in 0..FSSIZE {
            wsect(&mut f, i, &ZEROES).expect("zero block");
        }
        f
    }

    #[test]
    fn disk_inode_is_bit_exact() {
        // 16-bit type/major/minor/nlink, 32-bit size, NDIRECT+1 32-bit
        // addresses: the spec's §6 layout, 64 bytes total, 16 per block.
        assert_eq!(size_of::<DINode>(), 64);
        assert_eq!(IPB, 16);
        assert_eq!(BSIZE % size_of::<DINode>(), 0);
        assert_eq!(BSIZE % size_of::<Dirent>(), 0);
        assert_eq!(NINDIRECT, 256);
        assert_eq!(MAXFILE, NDIRECT + NINDIRECT);
    }

    #[test]
    fn superblock_matches_spec_magic_and_layout() {
        assert_eq!(SB.magic, FSMAGIC);
        assert_eq!(FSMAGIC, 0x10203040);
        assert_eq!(SB.logstart.to_le(), 2);
        assert_eq!(SB.inodestart.to_le(), 2 + NLOG);
        assert_eq!(SB.bmapstart.to_le(), 2 + NLOG + NINODEBLOCKS);
    }

    // `FREEINODE`/`FREEBLOCK` are process-wide statics (mkfs is a one-shot
    // CLI in real use, never re-entered). Every property that depends on
    // their absolute starting value therefore has to live in one test
    // function, so ordering relative to other `#[test]`s can't matter —
    // this is the only place in the test binary that calls `ialloc`.
    #[test]
    fn image_building_round_trips_through_direct_and_indirect_blocks() {
        let mut f = blank_image();

        let rootino = ialloc(&mut f, T_DIR).unwrap();
        assert_eq!(rootino, ROOTINO);

        let mut de = Dirent { inum: 0, name: [0; DIRSIZ] };
        de.inum = (rootino as u16).to_le();
        de.name[..1].copy_from_slice(b".");
        iappend(&mut f, rootino, &de, size_of::<Dirent>() as i32).unwrap();
        de.name = [0; DIRSIZ];
        de.name[..2].copy_from_slice(b"..");
        iappend(&mut f, rootino, &de, size_of::<Dirent>() as i32).unwrap();

        let din = rinode(&mut f, rootino);
        assert_eq!(din.size.to_le() as usize, 2 * size_of::<Dirent>());

        let bytes = readback(&mut f, rootino, 2 * size_of::<Dirent>());
        let (first, rest) = bytes.split_at(size_of::<Dirent>());
        let first_inum = u16::from_le_bytes([first[0], first[1]]);
        assert_eq!(first_inum, rootino as u16);
        assert_eq!(&first[2..3], b".");
        let second_inum = u16::from_le_bytes([rest[0], rest[1]]);
        assert_eq!(second_inum, rootino as u16);
        assert_eq!(&rest[2..4], b"..");

        // Writing exactly NDIRECT*BSIZE bytes must stay within the direct
        // block list; the indirect pointer stays unallocated.
        let file_a = ialloc(&mut f, T_FILE).unwrap();
        let exact_pattern = vec![0xA5u8; NDIRECT * BSIZE];
        let mut written = 0usize;
        while written < exact_pattern.len() {
            let chunk = std::cmp::min(BSIZE, exact_pattern.len() - written);
            let mut buf = [0u8; BSIZE];
            buf[..chunk].copy_from_slice(&exact_pattern[written..written + chunk]);
            iappend(&mut f, file_a, &buf, chunk as i32).unwrap();
            written += chunk;
        }
        let din_a = rinode(&mut f, file_a);
        assert_eq!(din_a.size.to_le() as usize, NDIRECT * BSIZE);
        for i in 0..NDIRECT {
            assert_ne!(din_a.addrs[i].to_le(), 0, "direct block {i} should be allocated");
        }
        assert_eq!(din_a.addrs[NDIRECT].to_le(), 0, "no indirect block needed yet");
        assert_eq!(readback(&mut f, file_a, exact_pattern.len()), exact_pattern);

        // One byte past that boundary must allocate the indirect block
        // (scenario 4: 13000 bytes of 0xA5 spans 12 direct blocks plus one
        // entry reached through the newly allocated indirect block).
        let file_b = ialloc(&mut f, T_FILE).unwrap();
        let total = 13000usize;
        let pattern: Vec<u8> = (0..total).map(|_| 0xA5u8).collect();
        written = 0;
        while written < total {
            let chunk = std::cmp::min(BSIZE, total - written);
            let mut buf = [0u8; BSIZE];
            buf[..chunk].copy_from_slice(&pattern[written..written + chunk]);
            iappend(&mut f, file_b, &buf, chunk as i32).unwrap();
            written += chunk;
        }
        let din_b = rinode(&mut f, file_b);
        assert_eq!(din_b.size.to_le() as usize, total);
        for i in 0..NDIRECT {
            assert_ne!(din_b.addrs[i].to_le(), 0);
        }
        assert_ne!(din_b.addrs[NDIRECT].to_le(), 0, "indirect block must be allocated");
        assert_eq!(readback(&mut f, file_b, total), pattern);

        // Allocating inodes across an inode-block boundary (IPB = 16)
        // must not panic on the reversed-range slice bug: inum % IPB == 0
        // (inum 16, 32, ...) used to compute an empty/negative end bound.
        let mut last = file_b;
        for _ in 0..20 {
            last = ialloc(&mut f, T_FILE).unwrap();
        }
        assert!(last > IPB, "should have allocated past the first inode block (IPB = {IPB})");
        let marker = Dirent { inum: 0xBEEF, name: *b"boundary-test\0" };
        iappend(&mut f, last, &marker, size_of::<Dirent>() as i32).unwrap();
        let din_last = rinode(&mut f, last);
        assert_eq!(din_last.size.to_le() as usize, size_of::<Dirent>());
        let back = readback(&mut f, last, size_of::<Dirent>());
        assert_eq!(u16::from_le_bytes([back[0], back[1]]), 0xBEEF);
    }

    #[test]
    fn fourteen_char_name_fits_dirent_exactly() {
        let name = "exactly14chars"; // 14 bytes, DIRSIZ
        assert_eq!(name.len(), DIRSIZ);
        let mut de = Dirent { inum: 1, name: [0; DIRSIZ] };
        de.name.copy_from_slice(name.as_bytes());
        // No NUL terminator fits for a full-length name; that's expected
        // and matches canonical xv6 — lookups compare exactly DIRSIZ bytes.
        assert_eq!(&de.name[..], name.as_bytes());
    }

    // The free-bitmap bit-packing formula (`buf[i/8] |= 1 << (i%8)`) is
    // shared byte-for-byte with the kernel's own `balloc`/`bfree` (see
    // `kernel/src/fs/fs.rs`); marking exactly the first `used` blocks
    // must leave every later bit clear, or the kernel sees no free space.
    #[test]
    fn balloc_bitmap_marks_exactly_the_used_blocks() {
        let mut f = blank_image();
        let used = 37i32;
        balloc(&mut f, used).unwrap();

        let mut buf = [0u8; BSIZE];
        rsect(&mut f, SB.bmapstart.to_le(), &mut buf).unwrap();

        for i in 0..BSIZE {
            let want_set = i < used as usize;
            let is_set = buf[i / 8] & (0x1 << (i % 8)) != 0;
            assert_eq!(is_set, want_set, "bit {i} should be {want_set}");
        }
    }
}
