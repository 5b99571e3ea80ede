use std::{fs::File, io};

use memmap2::MmapMut;

pub use shmlink::unlink_if_exists;
use shmlink::{into_shm_name, shm_create_exclusive, shm_open_existing, shm_unlink};

use crate::error::SegmentError;

mod shmlink;

/// How the mapping came to exist in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Created,
    Existing,
}

/// A read/write mapping of a named POSIX shared memory object.
pub(crate) struct SharedMem {
    map: MmapMut,
}

impl SharedMem {
    /// Exclusively creates `name` sized to `len` bytes, or maps the existing
    /// object when someone else won the create race.
    pub(crate) fn create_or_open(name: &str, len: usize) -> Result<(Self, Origin), SegmentError> {
        let shm_name = into_shm_name(name)?;
        let file = match shm_create_exclusive(&shm_name) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Self::open_existing(name, len).map(|mem| (mem, Origin::Existing));
            }
            Err(source) => return Err(io_error(name, source)),
        };

        let sized = u64::try_from(len)
            .map_err(|_| io_error(name, io::ErrorKind::InvalidInput.into()))
            .and_then(|len| file.set_len(len).map_err(|e| io_error(name, e)))
            .and_then(|()| map(name, &file));
        match sized {
            Ok(map) => Ok((Self { map }, Origin::Created)),
            Err(e) => {
                // Never leave an unsized object behind for late attachers.
                let _ = shm_unlink(&shm_name);
                Err(e)
            }
        }
    }

    /// Maps an object some other process already created and sized.
    pub(crate) fn open_existing(name: &str, len: usize) -> Result<Self, SegmentError> {
        let shm_name = into_shm_name(name)?;
        let file = shm_open_existing(&shm_name).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SegmentError::Missing(name.to_string()),
            _ => io_error(name, e),
        })?;
        let actual = file.metadata().map_err(|e| io_error(name, e))?.len();
        if usize::try_from(actual).ok() != Some(len) {
            return Err(SegmentError::SizeMismatch {
                name: name.to_string(),
                actual,
                expected: len,
            });
        }
        Ok(Self {
            map: map(name, &file)?,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr().cast_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

/// Removes the named object so no future attach can find it. Existing
/// mappings stay valid until they are dropped.
pub(crate) fn destroy(name: &str) -> Result<(), SegmentError> {
    let shm_name = into_shm_name(name)?;
    shm_unlink(&shm_name).map_err(|e| io_error(name, e))
}

fn map(name: &str, file: &File) -> Result<MmapMut, SegmentError> {
    unsafe { MmapMut::map_mut(file) }.map_err(|e| io_error(name, e))
}

fn io_error(name: &str, source: io::Error) -> SegmentError {
    SegmentError::Io {
        name: name.to_string(),
        source,
    }
}
