//! Filesystem collaborator used by exec and the per-process file table.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use hal::Errno;

/// Opaque handle returned by [`Vfs::open`].
pub type FileHandle = u32;

/// Execute permission bit.
pub const PERM_EXEC: u32 = 0o1;
/// Write permission bit.
pub const PERM_WRITE: u32 = 0o2;
/// Read permission bit.
pub const PERM_READ: u32 = 0o4;

/// Set-user-ID mode bit.
pub const MODE_SETUID: u32 = 0o4000;

/// File attributes consulted by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub len: u64,
    pub mode: u32,
    pub uid: u32,
}

impl Metadata {
    pub const fn is_setuid(&self) -> bool {
        self.mode & MODE_SETUID != 0
    }
}

/// Filesystem operations the process core depends on.
pub trait Vfs {
    fn open(&mut self, path: &str) -> Result<FileHandle, Errno>;
    fn metadata(&self, file: FileHandle) -> Result<Metadata, Errno>;
    fn read_at(&mut self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, Errno>;
    /// Checks `access` (a mask of `PERM_*` bits) for `user`.
    fn has_permission(&self, file: FileHandle, user: u32, access: u32) -> bool;
    fn dup(&mut self, file: FileHandle) -> Result<FileHandle, Errno>;
    fn close(&mut self, file: FileHandle);
}

/// Reads a whole file into memory.
pub fn read_all(vfs: &mut dyn Vfs, file: FileHandle) -> Result<Vec<u8>, Errno> {
    let len = vfs.metadata(file)?.len as usize;
    let mut data = alloc::vec![0u8; len];
    let mut done = 0;
    while done < len {
        let read = vfs.read_at(file, done as u64, &mut data[done..])?;
        if read == 0 {
            break;
        }
        done += read;
    }
    data.truncate(done);
    Ok(data)
}

/// Owner/other permission check shared by the in-memory filesystems.
pub fn mode_allows(meta: &Metadata, user: u32, access: u32) -> bool {
    if user == 0 {
        return access & PERM_EXEC == 0 || meta.mode & 0o111 != 0;
    }
    let bits = if user == meta.uid { (meta.mode >> 6) & 0o7 } else { meta.mode & 0o7 };
    bits & access == access
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    mode: u32,
    uid: u32,
}

/// In-memory filesystem keyed by absolute path.
#[derive(Debug, Default)]
pub struct MemoryVfs {
    files: BTreeMap<String, MemoryFile>,
    handles: BTreeMap<FileHandle, String>,
    next_handle: FileHandle,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file.
    pub fn insert(&mut self, path: &str, data: Vec<u8>, mode: u32, uid: u32) {
        self.files.insert(path.to_string(), MemoryFile { data, mode, uid });
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Number of handles not yet closed.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn file(&self, handle: FileHandle) -> Result<&MemoryFile, Errno> {
        let path = self.handles.get(&handle).ok_or(Errno::InvalidArg)?;
        self.files.get(path).ok_or(Errno::NotFound)
    }

    fn issue(&mut self, path: String) -> FileHandle {
        self.next_handle += 1;
        self.handles.insert(self.next_handle, path);
        self.next_handle
    }
}

impl Vfs for MemoryVfs {
    fn open(&mut self, path: &str) -> Result<FileHandle, Errno> {
        if !self.files.contains_key(path) {
            return Err(Errno::NotFound);
        }
        Ok(self.issue(path.to_string()))
    }

    fn metadata(&self, file: FileHandle) -> Result<Metadata, Errno> {
        let file = self.file(file)?;
        Ok(Metadata {
            len: file.data.len() as u64,
            mode: file.mode,
            uid: file.uid,
        })
    }

    fn read_at(&mut self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let data = &self.file(file)?.data;
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn has_permission(&self, file: FileHandle, user: u32, access: u32) -> bool {
        self.metadata(file)
            .map(|meta| mode_allows(&meta, user, access))
            .unwrap_or(false)
    }

    fn dup(&mut self, file: FileHandle) -> Result<FileHandle, Errno> {
        let path = self.handles.get(&file).cloned().ok_or(Errno::InvalidArg)?;
        Ok(self.issue(path))
    }

    fn close(&mut self, file: FileHandle) {
        self.handles.remove(&file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_file_is_not_found() {
        let mut vfs = MemoryVfs::new();
        assert_eq!(vfs.open("/bin/none"), Err(Errno::NotFound));
    }

    #[test]
    fn read_at_clamps_to_file_end() {
        let mut vfs = MemoryVfs::new();
        vfs.insert("/etc/motd", b"hello".to_vec(), 0o644, 0);
        let file = vfs.open("/etc/motd").expect("open");
        let mut buf = [0u8; 8];
        assert_eq!(vfs.read_at(file, 3, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(vfs.read_at(file, 9, &mut buf), Ok(0));
        assert_eq!(read_all(&mut vfs, file).expect("read"), b"hello".to_vec());
    }

    #[test]
    fn permission_uses_owner_or_other_bits() {
        let mut vfs = MemoryVfs::new();
        vfs.insert("/bin/tool", Vec::new(), 0o4754, 1000);
        let file = vfs.open("/bin/tool").expect("open");
        assert!(vfs.has_permission(file, 1000, PERM_EXEC));
        assert!(!vfs.has_permission(file, 1001, PERM_EXEC));
        assert!(vfs.has_permission(file, 1001, PERM_READ));
        assert!(vfs.has_permission(file, 0, PERM_EXEC));
        assert!(vfs.metadata(file).expect("meta").is_setuid());
    }

    #[test]
    fn root_needs_some_exec_bit() {
        let meta = Metadata {
            len: 0,
            mode: 0o644,
            uid: 5,
        };
        assert!(!mode_allows(&meta, 0, PERM_EXEC));
        assert!(mode_allows(&meta, 0, PERM_WRITE));
    }

    #[test]
    fn dup_and_close_track_handles() {
        let mut vfs = MemoryVfs::new();
        vfs.insert("/dev/null", Vec::new(), 0o666, 0);
        let file = vfs.open("/dev/null").expect("open");
        let copy = vfs.dup(file).expect("dup");
        assert_ne!(file, copy);
        assert_eq!(vfs.open_handles(), 2);
        vfs.close(file);
        assert_eq!(vfs.open_handles(), 1);
        assert_eq!(vfs.dup(file), Err(Errno::InvalidArg));
    }
}
