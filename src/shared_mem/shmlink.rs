use std::{
    ffi::{CStr, CString},
    fs::File,
    io,
    os::fd::FromRawFd,
};

use libc::c_int;

use crate::error::SegmentError;

const MODE: libc::mode_t = 0o666;

pub fn shm_open(name: &CStr, options: c_int) -> io::Result<File> {
    match unsafe { libc::shm_open(name.as_ptr(), options, MODE) } {
        -1 => Err(io::Error::last_os_error()),
        fd => Ok(unsafe { File::from_raw_fd(fd) }),
    }
}

/// Fails with `AlreadyExists` when another process created `name` first.
pub fn shm_create_exclusive(name: &CStr) -> io::Result<File> {
    shm_open(name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL)
}

pub fn shm_open_existing(name: &CStr) -> io::Result<File> {
    shm_open(name, libc::O_RDWR)
}

pub fn shm_unlink(name: &CStr) -> io::Result<()> {
    match unsafe { libc::shm_unlink(name.as_ptr()) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Removes the named object. Returns `Ok(false)` when there was nothing to remove.
pub fn unlink_if_exists(name: &str) -> Result<bool, SegmentError> {
    let shm_name = into_shm_name(name)?;
    match shm_unlink(&shm_name) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(SegmentError::Io {
            name: name.to_string(),
            source,
        }),
    }
}

/// POSIX names are a single leading slash followed by a slash-free component.
pub fn into_shm_name(name: &str) -> Result<CString, SegmentError> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') {
        return Err(SegmentError::InvalidName(name.to_string()));
    }
    CString::new(format!("/{bare}")).map_err(|_| SegmentError::InvalidName(name.to_string()))
}
