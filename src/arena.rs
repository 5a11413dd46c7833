//! Named shared-memory frame arena.
//!
//! Every frame, detector input tensor and detector output table lives in a POSIX
//! shared-memory object addressed purely by name. A producer `create`s the
//! segment, fills it, then publishes the name (never a pointer) over a bounded
//! queue. Consumers `get` the segment by that name.
//!
//! Ownership rules:
//! - `close` drops this arena's mapping. The segment survives.
//! - `delete` unlinks the segment. Deleting a missing segment is not an error.
//! - Mappings held elsewhere stay readable after `delete` until they are closed.
//!
//! No locking is done between writer and readers; the handoff-by-name protocol
//! guarantees the writer finished before any reader learns the name.

use anyhow::{anyhow, Context, Result};
use memmap2::MmapMut;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;

/// Longest segment name accepted (POSIX NAME_MAX minus the leading slash).
pub const MAX_SEGMENT_NAME: usize = 250;

const SEGMENT_MODE: libc::mode_t = 0o600;

/// Per-process view of the shared-memory arena.
///
/// Each stage owns its own `FrameArena`; segments are shared, mappings are not.
#[derive(Default)]
pub struct FrameArena {
    mappings: HashMap<String, MmapMut>,
}

impl FrameArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writable segment of `size` bytes, or attach to it if it already
    /// exists (a restarted producer may race its predecessor on the same name).
    pub fn create(&mut self, name: &str, size: usize) -> Result<&mut [u8]> {
        if size == 0 {
            return Err(anyhow!("shared memory segment {} must not be empty", name));
        }
        let stale = self
            .mappings
            .get(name)
            .is_some_and(|existing| existing.len() < size);
        if stale {
            self.mappings.remove(name);
        }
        if !self.mappings.contains_key(name) {
            let file = match open_segment(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    log::debug!("shm {} already exists, attaching", name);
                    open_segment(name, libc::O_RDWR)
                        .with_context(|| format!("attach shared memory {}", name))?
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create shared memory {}", name));
                }
            };
            let current = file
                .metadata()
                .with_context(|| format!("stat shared memory {}", name))?
                .len() as usize;
            if current < size {
                file.set_len(size as u64)
                    .with_context(|| format!("size shared memory {} to {} bytes", name, size))?;
            }
            // SAFETY: the segment is sized above and only ever accessed through
            // byte slices; concurrent writers are excluded by the naming protocol.
            let map = unsafe { MmapMut::map_mut(&file) }
                .with_context(|| format!("map shared memory {}", name))?;
            self.mappings.insert(name.to_string(), map);
        }
        let map = self
            .mappings
            .get_mut(name)
            .ok_or_else(|| anyhow!("shared memory {} vanished after mapping", name))?;
        Ok(&mut map[..size])
    }

    /// Read-only view of the first `len` bytes of a segment, or `None` if it
    /// does not exist (or is too small). Never fails.
    pub fn get(&mut self, name: &str, len: usize) -> Option<&[u8]> {
        self.attach(name, len).map(|map| &map[..len])
    }

    /// Writable view of an existing segment. Used by the side that fills a
    /// buffer somebody else created (detector output tables).
    pub fn get_mut(&mut self, name: &str, len: usize) -> Option<&mut [u8]> {
        self.attach(name, len).map(|map| &mut map[..len])
    }

    /// Release this arena's mapping without destroying the segment.
    pub fn close(&mut self, name: &str) {
        self.mappings.remove(name);
    }

    /// Unlink the segment. Idempotent.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.mappings.remove(name);
        let path = segment_path(name)?;
        // SAFETY: `path` is a valid NUL-terminated string.
        let rc = unsafe { libc::shm_unlink(path.as_ptr()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err).with_context(|| format!("unlink shared memory {}", name));
            }
        }
        Ok(())
    }

    /// Whether this arena currently holds a mapping for `name`.
    pub fn is_mapped(&self, name: &str) -> bool {
        self.mappings.contains_key(name)
    }

    fn attach(&mut self, name: &str, len: usize) -> Option<&mut MmapMut> {
        let stale = self
            .mappings
            .get(name)
            .is_some_and(|existing| existing.len() < len);
        if stale {
            self.mappings.remove(name);
        }
        if !self.mappings.contains_key(name) {
            let file = match open_segment(name, libc::O_RDWR) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
                Err(e) => {
                    log::warn!("failed to open shared memory {}: {}", name, e);
                    return None;
                }
            };
            let size = match file.metadata() {
                Ok(meta) => meta.len() as usize,
                Err(e) => {
                    log::warn!("failed to stat shared memory {}: {}", name, e);
                    return None;
                }
            };
            if size == 0 || size < len {
                log::warn!(
                    "shared memory {} holds {} bytes, expected at least {}",
                    name,
                    size,
                    len
                );
                return None;
            }
            // SAFETY: see `create`.
            let map = match unsafe { MmapMut::map_mut(&file) } {
                Ok(map) => map,
                Err(e) => {
                    log::warn!("failed to map shared memory {}: {}", name, e);
                    return None;
                }
            };
            self.mappings.insert(name.to_string(), map);
        }
        self.mappings.get_mut(name)
    }
}

fn segment_path(name: &str) -> Result<CString> {
    if name.is_empty() || name.len() > MAX_SEGMENT_NAME || name.contains('/') {
        return Err(anyhow!("invalid shared memory segment name {:?}", name));
    }
    CString::new(format!("/{}", name))
        .map_err(|_| anyhow!("shared memory segment name {:?} contains NUL", name))
}

fn open_segment(name: &str, flags: libc::c_int) -> io::Result<File> {
    let path =
        segment_path(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    // SAFETY: `path` is NUL-terminated; the returned descriptor is owned by the File.
    let fd = unsafe { libc::shm_open(path.as_ptr(), flags, SEGMENT_MODE) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}
