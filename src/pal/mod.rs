// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The host platform abstraction layer (PAL) underneath the personality.
//!
//! The PAL names host objects with typed stream URIs (`file:`, `dir:`,
//! `dev:`) and hands out opaque stream capabilities. The personality only
//! ever talks to the host through the [`Pal`] trait; every blocking point in
//! the personality is one of these calls.

use thiserror::Error;

use crate::errno::Errno;
use crate::fs::Mode;

#[cfg(test)]
pub(crate) mod mock;

/// URI scheme prefix for regular-file streams.
pub const URI_PREFIX_FILE: &str = "file:";
/// URI scheme prefix for directory streams.
pub const URI_PREFIX_DIR: &str = "dir:";
/// URI scheme prefix for character-device streams.
pub const URI_PREFIX_DEV: &str = "dev:";

/// How a stream may be accessed once opened.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Whether [`Pal::stream_open`] may (or must) create the underlying host
/// object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CreateMode {
    /// Never create; fail with [`PalError::StreamNotFound`] if missing.
    Never,
    /// Create if missing, open otherwise.
    Try,
    /// Create; fail with [`PalError::StreamExists`] if already present.
    Always,
}

/// Scope of a [`Pal::stream_delete`].
///
/// `Read`/`Write` are half-close semantics for bidirectional streams; host
/// files and directories only support [`DeleteMode::All`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeleteMode {
    All,
    Read,
    Write,
}

bitflags::bitflags! {
    /// Options applied to a stream at open time.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct StreamOptions: u32 {
        /// Stream operations return instead of blocking.
        const NONBLOCK = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Memory protection for [`Pal::stream_map`].
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct MapProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Copy-on-write mapping; stores are not carried through to the host
        /// object.
        const WRITECOPY = 1 << 3;
    }
}

/// Host-side classification of a stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[non_exhaustive]
pub enum StreamType {
    File,
    Dir,
    Dev,
    Pipe,
    Process,
    Socket,
}

/// Attributes reported by [`Pal::stream_attributes_query`].
#[derive(Clone, Copy, Debug)]
pub struct StreamAttributes {
    /// Host classification of the object behind the URI.
    pub stream_type: StreamType,
    /// Host-visible permission bits.
    pub share_flags: Mode,
    /// Number of bytes available on the stream; the current size for file
    /// streams.
    pub pending_size: i64,
}

/// Typed host errors, translated to guest errnos by [`From<PalError> for
/// Errno`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PalError {
    #[error("host operation not implemented")]
    NotImplemented,
    #[error("invalid argument to host call")]
    Invalid,
    #[error("host name too long")]
    TooLong,
    #[error("host denied the operation")]
    Denied,
    #[error("bad host handle")]
    BadHandle,
    #[error("host stream already exists")]
    StreamExists,
    #[error("host stream does not exist")]
    StreamNotFound,
    #[error("host stream is a file")]
    StreamIsFile,
    #[error("host stream is a directory")]
    StreamIsDir,
    #[error("host stream is a device")]
    StreamIsDevice,
    #[error("host call interrupted")]
    Interrupted,
    #[error("host buffer too small")]
    Overflow,
    #[error("host out of memory")]
    OutOfMemory,
    #[error("end of host stream")]
    EndOfStream,
    #[error("host resource busy")]
    Busy,
    #[error("host operation would block")]
    TryAgain,
}

/// The shared host-to-guest error translator. Pure and total; each host
/// error maps to exactly one errno.
impl From<PalError> for Errno {
    fn from(err: PalError) -> Self {
        match err {
            PalError::NotImplemented => Errno::ENOSYS,
            PalError::Invalid => Errno::EINVAL,
            PalError::TooLong => Errno::ENAMETOOLONG,
            PalError::Denied => Errno::EACCES,
            PalError::BadHandle => Errno::EBADF,
            PalError::StreamExists => Errno::EEXIST,
            PalError::StreamNotFound => Errno::ENOENT,
            PalError::StreamIsFile => Errno::ENOTDIR,
            PalError::StreamIsDir => Errno::EISDIR,
            PalError::StreamIsDevice => Errno::ESPIPE,
            PalError::Interrupted => Errno::EINTR,
            PalError::Overflow => Errno::EOVERFLOW,
            PalError::OutOfMemory => Errno::ENOMEM,
            PalError::EndOfStream => Errno::EPIPE,
            PalError::Busy => Errno::EBUSY,
            PalError::TryAgain => Errno::EAGAIN,
        }
    }
}

/// A provider of host streams.
///
/// Ideally a `Pal` is zero-sized and only exists to provide access to host
/// functionality; however, the provided APIs act upon `&self` to allow the
/// implementation to keep whatever per-host state it needs.
pub trait Pal: Sync {
    /// An opaque host stream capability.
    ///
    /// A capability is exclusively owned by whoever opened it and is released
    /// with [`Pal::object_close`].
    type StreamHandle: Send + Sync;

    /// Query attributes of the object behind `uri` without opening it.
    fn stream_attributes_query(&self, uri: &str) -> Result<StreamAttributes, PalError>;

    /// Open (and possibly create) the stream named by `uri`.
    ///
    /// `share_flags` are the host-visible permission bits applied when the
    /// open creates the object; they are ignored for plain opens.
    fn stream_open(
        &self,
        uri: &str,
        access: AccessMode,
        share_flags: Mode,
        create: CreateMode,
        options: StreamOptions,
    ) -> Result<Self::StreamHandle, PalError>;

    /// Read up to `buf.len()` bytes at `offset`, returning the number of
    /// bytes actually read.
    ///
    /// For directory streams, `offset` is ignored and the buffer is filled
    /// with a chunk of NUL-terminated entry names; a zero-length read
    /// signals the end of the listing, and [`PalError::Overflow`] reports a
    /// buffer too small to hold even one entry.
    fn stream_read(
        &self,
        handle: &Self::StreamHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, PalError>;

    /// Write `buf` at `offset`, returning the number of bytes actually
    /// written (at most `buf.len()`).
    fn stream_write(
        &self,
        handle: &Self::StreamHandle,
        offset: u64,
        buf: &[u8],
    ) -> Result<usize, PalError>;

    /// Map `size` bytes of the stream at `offset` into guest memory,
    /// returning the mapped address.
    fn stream_map(
        &self,
        handle: &Self::StreamHandle,
        addr_hint: Option<usize>,
        prot: MapProt,
        offset: u64,
        size: usize,
    ) -> Result<usize, PalError>;

    /// Resize the host object to exactly `size` bytes.
    fn stream_set_length(&self, handle: &Self::StreamHandle, size: u64) -> Result<(), PalError>;

    /// Commit any buffered stream state to the host.
    fn stream_flush(&self, handle: &Self::StreamHandle) -> Result<(), PalError>;

    /// Delete the host object behind the stream. The capability itself stays
    /// valid until closed.
    fn stream_delete(&self, handle: &Self::StreamHandle, mode: DeleteMode)
        -> Result<(), PalError>;

    /// Rename the host object behind the stream to `new_uri`.
    fn stream_change_name(
        &self,
        handle: &Self::StreamHandle,
        new_uri: &str,
    ) -> Result<(), PalError>;

    /// Update host-visible attributes through an open stream. Only the
    /// permission bits can be changed on host files.
    fn stream_attributes_set_by_handle(
        &self,
        handle: &Self::StreamHandle,
        share_flags: Mode,
    ) -> Result<(), PalError>;

    /// Release a stream capability.
    fn object_close(&self, handle: Self::StreamHandle);
}
