// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Error handling. See [`Errno`].

use thiserror::Error;

/// Linux error numbers surfaced to the guest.
///
/// Every operation of the personality reports failure as one of these. Host
/// (PAL) failures are translated 1:1 by [`From<PalError>`](crate::pal::PalError);
/// the remaining values are produced directly by the personality (argument
/// validation, overflow guards, the host-FIFO rejection in lookup).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum Errno {
    #[error("operation not permitted")]
    EPERM = 1,
    #[error("no such file or directory")]
    ENOENT = 2,
    #[error("interrupted system call")]
    EINTR = 4,
    #[error("input/output error")]
    EIO = 5,
    #[error("bad file descriptor")]
    EBADF = 9,
    #[error("resource temporarily unavailable")]
    EAGAIN = 11,
    #[error("cannot allocate memory")]
    ENOMEM = 12,
    #[error("permission denied")]
    EACCES = 13,
    #[error("device or resource busy")]
    EBUSY = 16,
    #[error("file exists")]
    EEXIST = 17,
    #[error("not a directory")]
    ENOTDIR = 20,
    #[error("is a directory")]
    EISDIR = 21,
    #[error("invalid argument")]
    EINVAL = 22,
    #[error("file too large")]
    EFBIG = 27,
    #[error("no space left on device")]
    ENOSPC = 28,
    #[error("illegal seek")]
    ESPIPE = 29,
    #[error("read-only file system")]
    EROFS = 30,
    #[error("broken pipe")]
    EPIPE = 32,
    #[error("file name too long")]
    ENAMETOOLONG = 36,
    #[error("function not implemented")]
    ENOSYS = 38,
    #[error("value too large for defined data type")]
    EOVERFLOW = 75,
}

impl Errno {
    /// Provide the negative integer representation of the error, as expected
    /// at the syscall return boundary.
    #[must_use]
    pub fn as_neg(self) -> i32 {
        -(self as i32)
    }
}

impl From<Errno> for i32 {
    fn from(e: Errno) -> Self {
        e as i32
    }
}
