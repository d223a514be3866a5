use crate::consts::{CRC_SIZE, HDR_SIZE, LOCK_FILE, VERSION};
use crate::errors::{BixError, Result};
use byteorder::{LittleEndian as LE, ReadBytesExt};
use std::io::{self, Read, Write};
use std::path::Path;

pub fn crc32(data: &[u8]) -> u32 { crc32fast::hash(data) }

pub fn uvarint_encode(mut n: u64, out: &mut Vec<u8>) {
    while n >= 0x80 {
        out.push((n as u8) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

/// Checked decode: `None` on a truncated or overlong varint.
pub fn uvarint_decode(mut data: &[u8]) -> Option<(u64, &[u8])> {
    let mut x = 0u64; let mut s = 0u32;
    loop {
        let (&b, rest) = data.split_first()?;
        data = rest;
        if s >= 64 || (s == 63 && b > 1) { return None; }
        if b < 0x80 { return Some((x | ((b as u64) << s), data)); }
        x |= ((b & 0x7F) as u64) << s; s += 7;
    }
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> { r.read_u64::<LE>() }
pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> { r.read_u32::<LE>() }

/// Header shared by catalog and reverse files.
pub fn write_header(out: &mut Vec<u8>, magic: &[u8; 4], count: u64) {
    out.extend_from_slice(magic);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
}

/// Check magic, version and trailing crc; returns (count, body without header and crc).
pub fn check_framed<'a>(buf: &'a [u8], magic: &[u8; 4], what: &'static str) -> Result<(u64, &'a [u8])> {
    if buf.len() < HDR_SIZE + CRC_SIZE {
        return Err(BixError::decode(what, format!("truncated: {} bytes", buf.len())));
    }
    if &buf[0..4] != magic { return Err(BixError::BadHeader); }
    let mut cur = &buf[4..];
    let ver = cur.read_u16::<LE>()?;
    if ver != VERSION { return Err(BixError::BadHeader); }
    let _reserved = cur.read_u16::<LE>()?;
    let count = read_u64(&mut cur)?;
    let end = buf.len() - CRC_SIZE;
    let want = read_u32(&mut &buf[end..])?;
    if crc32(&buf[..end]) != want {
        return Err(BixError::decode(what, "crc mismatch"));
    }
    Ok((count, &buf[HDR_SIZE..end]))
}

/// Write `bytes` next to `path` and atomically rename into place.
pub fn persist_atomic(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::Builder::new().prefix(".bix_").tempfile_in(dir)?;
    tmp.as_file_mut().write_all(bytes)?;
    if sync { tmp.as_file().sync_all()?; }
    tmp.persist(path)?;
    Ok(())
}

#[cfg(unix)]
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let f = std::fs::OpenOptions::new().read(true).custom_flags(libc::O_DIRECTORY).open(dir)?;
    f.sync_all()
}
#[cfg(not(unix))]
pub fn fsync_dir(_dir: &Path) -> io::Result<()> { Ok(()) }

/// Exclusive `flock` on `<root>/LOCK`, released on drop. Serializes writers
/// and orphan cleanup across processes.
pub struct DirLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: std::fs::File,
}

impl DirLock {
    fn open(root: &Path) -> Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        Ok(file)
    }

    /// Block until the lock is ours.
    pub fn exclusive(root: &Path) -> Result<Self> {
        let file = Self::open(root)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(Self { file })
    }

    /// `None` when another handle holds the lock.
    pub fn try_exclusive(root: &Path) -> Result<Option<Self>> {
        let file = Self::open(root)?;
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(None);
                }
                return Err(err.into());
            }
        }
        Ok(Some(Self { file }))
    }
}

#[cfg(unix)]
impl Drop for DirLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
