// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! File-system related functionality: the guest-visible vocabulary, the
//! open-handle object, and the operation tables a personality serves.

use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;

use crate::dcache::{DentryId, DentryTree, Inode};
use crate::errno::Errno;
use crate::pal::{AccessMode, Pal};

pub mod chroot;
pub mod generic;


/// A private module, to help support writing sealed traits. This module
/// should _itself_ never be made public.
mod private {
    /// A trait to help seal the operation-table traits.
    ///
    /// This trait is explicitly public, but unnameable, thereby preventing
    /// code outside this crate from implementing the operation tables.
    pub trait Sealed {}
}

bitflags! {
    /// `S_I*` permission constants.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct Mode: u32 {
        /// `S_IRWXU`: user (file owner) has read, write, and execute permission
        const RWXU = 0o700;
        /// `S_IRUSR`: user has read permission
        const RUSR = 0o400;
        /// `S_IWUSR`: user has write permission
        const WUSR = 0o200;
        /// `S_IXUSR`: user has execute permission
        const XUSR = 0o100;
        /// `S_IRWXG`: group has read, write, and execute permission
        const RWXG = 0o070;
        /// `S_IRGRP`: group has read permission
        const RGRP = 0o040;
        /// `S_IWGRP`: group has write permission
        const WGRP = 0o020;
        /// `S_IXGRP`: group has execute permission
        const XGRP = 0o010;
        /// `S_IRWXO`: others have read, write, and execute permission
        const RWXO = 0o007;
        /// `S_IROTH`: others have read permission
        const ROTH = 0o004;
        /// `S_IWOTH`: others have write permission
        const WOTH = 0o002;
        /// `S_IXOTH`: others have execute permission
        const XOTH = 0o001;
    }
}

bitflags! {
    /// `O_*` constants for use with open.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct OFlags: u32 {
        /// `O_RDONLY`: read-only
        const RDONLY = 0x0;
        /// `O_WRONLY`: write-only
        const WRONLY = 0x1;
        /// `O_RDWR`: read/write.
        ///
        /// This is not equal to `RDONLY | WRONLY`. It's a distinct flag.
        const RDWR = 0x2;
        /// `O_CREAT`: if path does not exist, create it as a regular file
        const CREAT = 0x40;
        /// `O_EXCL`: exclusive use
        const EXCL = 0x80;
        /// `O_NOCTTY`: do not assign controlling terminal
        const NOCTTY = 0x100;
        /// `O_TRUNC`: truncate the file to zero length
        const TRUNC = 0x200;
        /// `O_APPEND`: append mode
        const APPEND = 0x400;
        /// `O_NONBLOCK`: non-blocking mode
        const NONBLOCK = 0x800;
        /// `O_DIRECTORY`: fail if not a directory
        const DIRECTORY = 0x10000;
        /// `O_NOFOLLOW`: fail if the path is a symbolic link
        const NOFOLLOW = 0x20000;
        /// `O_CLOEXEC`: close-on-exec flag
        const CLOEXEC = 0x80000;
        /// <https://docs.rs/bitflags/*/bitflags/#externally-defined-flags>
        const _ = !0;

        /// Mask of the access-mode bits.
        const ACCMODE = 0x3;
    }
}

impl OFlags {
    /// Extract the host access mode from the `O_ACCMODE` bits.
    pub fn access_mode(self) -> Result<AccessMode, Errno> {
        match (self & Self::ACCMODE).bits() {
            0x0 => Ok(AccessMode::ReadOnly),
            0x1 => Ok(AccessMode::WriteOnly),
            0x2 => Ok(AccessMode::ReadWrite),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// Types of files served by the personality.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileType {
    RegularFile,
    Directory,
    CharacterDevice,
}

impl FileType {
    /// The `S_IFMT` bits for this type.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::RegularFile => 0o100000,
            FileType::Directory => 0o040000,
            FileType::CharacterDevice => 0o020000,
        }
    }
}

/// The origin a seek offset is relative to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SeekOrigin {
    /// The file offset is set to `offset` bytes.
    Start,
    /// The file offset is set to its current location plus `offset` bytes.
    Current,
    /// The file offset is set to the size of the file plus `offset` bytes.
    End,
}

bitflags! {
    /// Readiness classes for [`FileOps::poll`].
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PollFlags: u32 {
        /// Readable without blocking.
        const RD = 1 << 0;
        /// Writable without blocking.
        const WR = 1 << 1;
    }
}

bitflags! {
    /// Desired memory protection of a file mapping.
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct ProtFlags: u32 {
        /// Pages cannot be accessed.
        const NONE = 0;
        /// Pages can be read.
        const READ = 1 << 0;
        /// Pages can be written.
        const WRITE = 1 << 1;
        /// Pages can be executed.
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// `MAP_*` flags for [`FileOps::mmap`].
    #[repr(transparent)]
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct MapFlags: u32 {
        /// Stores are carried through to the underlying object.
        const SHARED = 0x1;
        /// Copy-on-write mapping; stores stay private.
        const PRIVATE = 0x2;
        /// Place the mapping exactly at the hinted address.
        const FIXED = 0x10;
        /// The mapping is not backed by any file.
        const ANONYMOUS = 0x20;
    }
}

/// The status of a file, inspired by `stat(3type)`.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct FileStatus {
    /// File type.
    pub file_type: FileType,
    /// Guest-visible permission bits.
    pub mode: Mode,
    /// Size of the file in bytes; zero for anything but regular files.
    pub size: i64,
    /// Synthesized link count; exact counts are not tracked.
    pub nlink: u32,
    /// Device number, derived from the mount URI.
    pub dev: u64,
}

impl FileStatus {
    /// The combined `st_mode` value: type bits or-ed with permission bits.
    #[must_use]
    pub fn posix_mode(&self) -> u32 {
        self.file_type.mode_bits() | self.mode.bits()
    }
}

/// An open file: a dentry/inode pair plus a live host stream and a cursor.
pub struct Handle<P: Pal + 'static> {
    pal: &'static P,
    dentry: DentryId,
    inode: Arc<Inode>,
    uri: String,
    flags: OFlags,
    pub(crate) state: Mutex<HandleState<P>>,
}

/// The mutable part of a handle, behind its leaf lock.
pub struct HandleState<P: Pal> {
    /// Current file position. Only meaningful for regular files.
    ///
    /// TODO: the position is not synchronized across processes sharing an
    /// inode; reintroduce position sync once the checkpoint machinery can
    /// carry it.
    pub(crate) pos: i64,
    /// The host stream, absent only between checkout and checkin.
    pub(crate) pal_handle: Option<P::StreamHandle>,
}

impl<P: Pal + 'static> Handle<P> {
    pub(crate) fn new(
        pal: &'static P,
        dentry: DentryId,
        inode: Arc<Inode>,
        uri: String,
        flags: OFlags,
        pal_handle: P::StreamHandle,
    ) -> Self {
        Self {
            pal,
            dentry,
            inode,
            uri,
            flags,
            state: Mutex::new(HandleState {
                pos: 0,
                pal_handle: Some(pal_handle),
            }),
        }
    }

    /// The dentry this handle was opened at. The dentry may since have been
    /// unlinked or renamed; the handle stays usable regardless.
    #[must_use]
    pub fn dentry(&self) -> DentryId {
        self.dentry
    }

    /// The inode this handle references.
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The exact URI the handle was opened with, preserved verbatim so the
    /// stream can be reopened after checkpoint restore.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The open flags the handle was created with.
    #[must_use]
    pub fn flags(&self) -> OFlags {
        self.flags
    }

    /// The current file position.
    #[must_use]
    pub fn pos(&self) -> i64 {
        self.state.lock().pos
    }
}

impl<P: Pal + 'static> Drop for Handle<P> {
    fn drop(&mut self) {
        if let Some(stream) = self.state.get_mut().pal_handle.take() {
            self.pal.object_close(stream);
        }
    }
}

/// Operations on open files, the personality's `fs_ops` table.
pub trait FileOps<P: Pal + 'static>: private::Sealed {
    /// Validate and register a mount of `uri`, returning its root dentry.
    fn mount(&self, tree: &mut DentryTree, uri: &str) -> Result<DentryId, Errno>;

    /// Commit buffered stream state to the host.
    fn flush(&self, hdl: &Handle<P>) -> Result<(), Errno>;

    /// Read into `buf` at the current position, advancing it for regular
    /// files. Returns the number of bytes read.
    fn read(&self, hdl: &Handle<P>, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Write `buf` at the current position, advancing it and extending the
    /// file size for regular files. Returns the number of bytes written.
    fn write(&self, hdl: &Handle<P>, buf: &[u8]) -> Result<usize, Errno>;

    /// Map the file into guest memory, returning the mapped address.
    fn mmap(
        &self,
        hdl: &Handle<P>,
        addr_hint: Option<usize>,
        size: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
    ) -> Result<usize, Errno>;

    /// Reposition the file offset. Returns the resulting position.
    fn seek(&self, hdl: &Handle<P>, offset: i64, origin: SeekOrigin) -> Result<i64, Errno>;

    /// Obtain the status of the file behind an open handle.
    fn hstat(&self, hdl: &Handle<P>) -> Result<FileStatus, Errno>;

    /// Resize the file to exactly `size` bytes.
    fn truncate(&self, hdl: &Handle<P>, size: i64) -> Result<(), Errno>;

    /// Report which of the `interest` classes are currently ready.
    fn poll(&self, hdl: &Handle<P>, interest: PollFlags) -> Result<PollFlags, Errno>;

    /// Prepare the checkpoint copy of a handle for migration to another
    /// process. Must be called with the dcache lock held.
    fn checkout(&self, tree: &DentryTree, hdl: &mut Handle<P>) -> Result<(), Errno>;

    /// Re-establish a migrated handle in the restoring process.
    fn checkin(&self, hdl: &mut Handle<P>) -> Result<(), Errno>;
}

/// Operations on dentries, the personality's `d_ops` table.
///
/// Everything here takes the dentry tree by reference: the borrow is the
/// proof that the caller holds the dcache lock.
pub trait DentryOps<P: Pal + 'static>: private::Sealed {
    /// Materialize a freshly looked-up dentry: classify the host object and
    /// attach a new inode.
    fn lookup(&self, tree: &mut DentryTree, dent: DentryId) -> Result<(), Errno>;

    /// Open the (already materialized) object at `dent`.
    fn open(&self, tree: &mut DentryTree, dent: DentryId, flags: OFlags)
        -> Result<Handle<P>, Errno>;

    /// Create a regular file at the negative dentry `dent` and open it.
    fn creat(
        &self,
        tree: &mut DentryTree,
        dent: DentryId,
        flags: OFlags,
        perm: Mode,
    ) -> Result<Handle<P>, Errno>;

    /// Create a directory at the negative dentry `dent`.
    fn mkdir(&self, tree: &mut DentryTree, dent: DentryId, perm: Mode) -> Result<(), Errno>;

    /// Obtain the status of the (materialized) object at `dent`.
    fn stat(&self, tree: &DentryTree, dent: DentryId) -> Result<FileStatus, Errno>;

    /// List the host directory at `dent`, invoking `callback` once per entry
    /// name (without any `.`/`..` entries and without the host's trailing
    /// `/` convention for subdirectories).
    fn readdir(
        &self,
        tree: &DentryTree,
        dent: DentryId,
        callback: &mut dyn FnMut(&str) -> Result<(), Errno>,
    ) -> Result<(), Errno>;

    /// Delete the host object at `dent`. The inode survives for any open
    /// handles; detaching it from the dentry is the caller's job.
    fn unlink(&self, tree: &mut DentryTree, dent: DentryId) -> Result<(), Errno>;

    /// Rename the host object at `old` to the path of `new`. Moving the
    /// inode between the dentries is the caller's job.
    fn rename(&self, tree: &mut DentryTree, old: DentryId, new: DentryId) -> Result<(), Errno>;

    /// Change the permission bits of the object at `dent`.
    fn chmod(&self, tree: &mut DentryTree, dent: DentryId, perm: Mode) -> Result<(), Errno>;
}

/// A complete file-system personality: both operation tables plus a name.
pub trait Filesystem<P: Pal + 'static>: FileOps<P> + DentryOps<P> {
    /// Name of the file-system type, as reported in mount tables.
    const NAME: &'static str;
}
