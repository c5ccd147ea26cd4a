// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The chroot file-system personality.
//!
//! Guest paths under a mount are translated to host stream URIs and every
//! operation is carried out against the PAL; the dcache keeps the guest's
//! view of types, permissions, and sizes between host round-trips.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use crate::dcache::{DentryId, DentryTree, Inode};
use crate::errno::Errno;
use crate::fs::{
    FileOps, FileStatus, FileType, Filesystem, Handle, MapFlags, Mode, OFlags, PollFlags,
    ProtFlags, SeekOrigin, generic,
};
use crate::pal::{
    AccessMode, CreateMode, DeleteMode, MapProt, Pal, PalError, StreamOptions, StreamType,
    URI_PREFIX_DEV, URI_PREFIX_DIR, URI_PREFIX_FILE,
};

/// Initial size of the buffer host directory listings are read into.
const READDIR_BUF_SIZE: usize = 4096;

/// Permission bits as sent to the host.
///
/// The read bit is always added to files created on the host, because the
/// PAL requires opening the file even for operations such as `unlink` or
/// `chmod`.
///
/// The updated permissions are not visible to the process creating the file
/// or updating its permissions (its `stat` still reports the requested
/// bits), but other guest processes accessing the file afterwards see the
/// host bits.
fn host_perm(perm: Mode) -> Mode {
    perm | Mode::RUSR
}

/// The part of a mount URI after its scheme prefix.
fn strip_scheme(uri: &str) -> &str {
    let colon = uri.find(':').expect("mount URI carries a scheme");
    &uri[colon + 1..]
}

/// Calculate the URI for a dentry. The URI scheme is determined by
/// `file_type`, which is passed separately (instead of using the dentry's
/// inode) because the dentry might not have an inode yet: we might be
/// creating a new file, or looking up a file we don't know yet.
///
/// With `file_type` of `None`, the URI keeps the scheme prefix of the mount
/// URI (the probe case; see [`ChrootFs::lookup`](crate::fs::DentryOps::lookup)).
pub(crate) fn dentry_uri(
    tree: &DentryTree,
    dent: DentryId,
    file_type: Option<FileType>,
) -> String {
    let mount_uri = tree.get(dent).mount().uri();
    let stripped = strip_scheme(mount_uri);

    let prefix = match file_type {
        Some(FileType::RegularFile) => URI_PREFIX_FILE,
        Some(FileType::Directory) => URI_PREFIX_DIR,
        Some(FileType::CharacterDevice) => URI_PREFIX_DEV,
        None => &mount_uri[..mount_uri.len() - stripped.len()],
    };

    // Treat an empty root as the current directory.
    let root = if stripped.is_empty() { "." } else { stripped };

    let rel_path = tree.rel_path(dent);
    if rel_path.is_empty() {
        alloc::format!("{prefix}{root}")
    } else {
        alloc::format!("{prefix}{root}/{rel_path}")
    }
}

fn pal_create_mode(flags: OFlags) -> CreateMode {
    if flags.contains(OFlags::CREAT | OFlags::EXCL) {
        CreateMode::Always
    } else if flags.contains(OFlags::CREAT) {
        CreateMode::Try
    } else {
        CreateMode::Never
    }
}

fn pal_stream_options(flags: OFlags) -> StreamOptions {
    if flags.contains(OFlags::NONBLOCK) {
        StreamOptions::NONBLOCK
    } else {
        StreamOptions::empty()
    }
}

fn pal_map_prot(prot: ProtFlags, flags: MapFlags) -> MapProt {
    let mut pal_prot = MapProt::empty();
    if prot.contains(ProtFlags::READ) {
        pal_prot |= MapProt::READ;
    }
    if prot.contains(ProtFlags::WRITE) {
        // Stores into a private mapping must not reach the host object.
        pal_prot |= if flags.contains(MapFlags::PRIVATE) {
            MapProt::WRITECOPY
        } else {
            MapProt::WRITE
        };
    }
    if prot.contains(ProtFlags::EXEC) {
        pal_prot |= MapProt::EXEC;
    }
    pal_prot
}

/// A temporary read-only host stream, closed when dropped. Used by unlink,
/// rename, chmod, and the host-backed readdir.
struct TempStream<'p, P: Pal> {
    pal: &'p P,
    stream: Option<P::StreamHandle>,
}

impl<'p, P: Pal> TempStream<'p, P> {
    fn new(pal: &'p P, stream: P::StreamHandle) -> Self {
        Self {
            pal,
            stream: Some(stream),
        }
    }

    fn get(&self) -> &P::StreamHandle {
        self.stream.as_ref().unwrap()
    }
}

impl<P: Pal> Drop for TempStream<'_, P> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pal.object_close(stream);
        }
    }
}

/// The chroot personality over a PAL.
pub struct ChrootFs<P: Pal + 'static> {
    pal: &'static P,
}

impl<P: Pal + 'static> ChrootFs<P> {
    /// Construct the personality on top of `pal`.
    #[must_use]
    pub fn new(pal: &'static P) -> Self {
        Self { pal }
    }

    /// Attach a fresh inode to `dent`.
    fn setup_dentry(
        &self,
        tree: &mut DentryTree,
        dent: DentryId,
        file_type: FileType,
        perm: Mode,
        size: i64,
    ) -> Arc<Inode> {
        let inode = Inode::new(Arc::clone(tree.get(dent).mount()), file_type, perm);
        inode.lock().size = size;
        tree.set_inode(dent, Arc::clone(&inode));
        inode
    }

    /// Open a temporary read-only host stream for `dent`.
    fn temp_open(
        &self,
        tree: &DentryTree,
        dent: DentryId,
        file_type: FileType,
    ) -> Result<TempStream<'static, P>, Errno> {
        let uri = dentry_uri(tree, dent, Some(file_type));
        let stream = self
            .pal
            .stream_open(
                &uri,
                AccessMode::ReadOnly,
                Mode::empty(),
                CreateMode::Never,
                StreamOptions::empty(),
            )
            .map_err(Errno::from)?;
        Ok(TempStream::new(self.pal, stream))
    }

    /// The single underlying open routine shared by `open`, `creat`, and
    /// `mkdir`: translate the flags, force the host read bit, and open the
    /// host stream. Returns the URI used, verbatim, together with the
    /// stream.
    fn open_pal(
        &self,
        tree: &DentryTree,
        dent: DentryId,
        file_type: FileType,
        flags: OFlags,
        perm: Mode,
    ) -> Result<(String, P::StreamHandle), Errno> {
        let uri = dentry_uri(tree, dent, Some(file_type));
        let access = flags.access_mode()?;
        let create = pal_create_mode(flags);
        let options = pal_stream_options(flags);
        let stream = self
            .pal
            .stream_open(&uri, access, host_perm(perm), create, options)
            .map_err(Errno::from)?;
        Ok((uri, stream))
    }

    /// Reopen the host stream of a restored handle from its stored URI.
    fn reopen(&self, hdl: &Handle<P>) -> Result<P::StreamHandle, Errno> {
        let access = hdl.flags().access_mode()?;
        let options = pal_stream_options(hdl.flags());
        self.pal
            .stream_open(
                hdl.uri(),
                access,
                Mode::empty(),
                CreateMode::Never,
                options,
            )
            .map_err(Errno::from)
    }
}

impl<P: Pal + 'static> super::private::Sealed for ChrootFs<P> {}

impl<P: Pal + 'static> FileOps<P> for ChrootFs<P> {
    fn mount(&self, tree: &mut DentryTree, uri: &str) -> Result<DentryId, Errno> {
        if !(uri.starts_with(URI_PREFIX_FILE) || uri.starts_with(URI_PREFIX_DEV)) {
            return Err(Errno::EINVAL);
        }
        Ok(tree.add_mount(uri))
    }

    fn flush(&self, hdl: &Handle<P>) -> Result<(), Errno> {
        let state = hdl.state.lock();
        let stream = state.pal_handle.as_ref().ok_or(Errno::EBADF)?;
        self.pal.stream_flush(stream).map_err(Errno::from)
    }

    fn read(&self, hdl: &Handle<P>, buf: &mut [u8]) -> Result<usize, Errno> {
        let is_file = hdl.inode().file_type() == FileType::RegularFile;

        let mut state = hdl.state.lock();
        let pos = state.pos;
        debug_assert!(pos >= 0);

        // Make sure the position cannot overflow.
        if is_file && pos.checked_add_unsigned(buf.len() as u64).is_none() {
            return Err(Errno::EFBIG);
        }

        let actual = {
            let stream = state.pal_handle.as_ref().ok_or(Errno::EBADF)?;
            self.pal
                .stream_read(stream, pos as u64, buf)
                .map_err(Errno::from)?
        };
        debug_assert!(actual <= buf.len());
        if is_file {
            state.pos = pos + actual as i64;
        }
        Ok(actual)
    }

    fn write(&self, hdl: &Handle<P>, buf: &[u8]) -> Result<usize, Errno> {
        let inode = hdl.inode();
        let is_file = inode.file_type() == FileType::RegularFile;

        // Lock order: inode before handle.
        let mut inode_state = inode.lock();
        let mut state = hdl.state.lock();
        let pos = state.pos;
        debug_assert!(pos >= 0);

        // Make sure the position cannot overflow.
        if is_file && pos.checked_add_unsigned(buf.len() as u64).is_none() {
            return Err(Errno::EFBIG);
        }

        let actual = {
            let stream = state.pal_handle.as_ref().ok_or(Errno::EBADF)?;
            self.pal
                .stream_write(stream, pos as u64, buf)
                .map_err(Errno::from)?
        };
        debug_assert!(actual <= buf.len());
        if is_file {
            let new_pos = pos + actual as i64;
            state.pos = new_pos;

            // Update the file size if we just wrote past the end of file.
            if inode_state.size < new_pos {
                inode_state.size = new_pos;
            }
        }
        Ok(actual)
    }

    fn mmap(
        &self,
        hdl: &Handle<P>,
        addr_hint: Option<usize>,
        size: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
    ) -> Result<usize, Errno> {
        // An anonymous mapping has no file behind it; it cannot be served
        // here.
        if flags.contains(MapFlags::ANONYMOUS) {
            return Err(Errno::EINVAL);
        }

        let pal_prot = pal_map_prot(prot, flags);
        let state = hdl.state.lock();
        let stream = state.pal_handle.as_ref().ok_or(Errno::EBADF)?;
        self.pal
            .stream_map(stream, addr_hint, pal_prot, offset, size)
            .map_err(Errno::from)
    }

    /// TODO: this emulates lseek() completely inside the personality, but
    /// some device files may report size == 0 in stat and provide
    /// device-specific lseek() logic; the emulation breaks for those.
    fn seek(&self, hdl: &Handle<P>, offset: i64, origin: SeekOrigin) -> Result<i64, Errno> {
        generic::generic_inode_seek(hdl, offset, origin)
    }

    fn hstat(&self, hdl: &Handle<P>) -> Result<FileStatus, Errno> {
        generic::generic_inode_hstat(hdl)
    }

    fn truncate(&self, hdl: &Handle<P>, size: i64) -> Result<(), Errno> {
        if size < 0 {
            return Err(Errno::EINVAL);
        }

        // Lock order: inode before handle.
        let mut inode_state = hdl.inode().lock();
        let state = hdl.state.lock();
        let stream = state.pal_handle.as_ref().ok_or(Errno::EBADF)?;
        self.pal
            .stream_set_length(stream, size as u64)
            .map_err(Errno::from)?;
        inode_state.size = size;
        Ok(())
    }

    fn poll(&self, hdl: &Handle<P>, interest: PollFlags) -> Result<PollFlags, Errno> {
        generic::generic_inode_poll(hdl, interest)
    }

    fn checkout(&self, tree: &DentryTree, hdl: &mut Handle<P>) -> Result<(), Errno> {
        // This runs on the handle copy prepared for the checkpoint blob, with
        // the dcache lock held for the whole checkpointing process.

        // First, check that the file has not been deleted or renamed under us
        // (the dentry still carries the same inode).
        let is_in_dentry = tree
            .inode(hdl.dentry())
            .is_some_and(|inode| Arc::ptr_eq(inode, hdl.inode()));

        if is_in_dentry {
            // Then check that the file still exists on the host. If so, the
            // restoring process can reopen it from the stored URI, and the
            // stream does not need to travel with the checkpoint.
            if self.pal.stream_attributes_query(hdl.uri()).is_ok() {
                if let Some(stream) = hdl.state.get_mut().pal_handle.take() {
                    self.pal.object_close(stream);
                }
            }
        }
        Ok(())
    }

    fn checkin(&self, hdl: &mut Handle<P>) -> Result<(), Errno> {
        // The handle is being initialized during checkpoint restore; nothing
        // else can see it yet.
        if hdl.state.get_mut().pal_handle.is_none() {
            let stream = match self.reopen(hdl) {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!("checkin: failed to reopen '{}': {err}", hdl.uri());
                    return Err(err);
                }
            };
            hdl.state.get_mut().pal_handle = Some(stream);
        }
        Ok(())
    }
}

impl<P: Pal + 'static> crate::fs::DentryOps<P> for ChrootFs<P> {
    fn lookup(&self, tree: &mut DentryTree, dent: DentryId) -> Result<(), Errno> {
        // We don't know the file type yet, so we can't build a URI with the
        // right prefix; probe with the scheme of the mount URI instead.
        //
        // In almost all cases a "file:" URI would be good enough: if the
        // underlying object is a directory or a device, the attribute query
        // still classifies it. However, the host also recognizes special
        // devices like "dev:tty" which cannot be opened as "file:tty", so
        // the mount's own scheme must be preserved for the probe.
        let uri = dentry_uri(tree, dent, None);

        let attr = self.pal.stream_attributes_query(&uri).map_err(Errno::from)?;

        let file_type = match attr.stream_type {
            StreamType::File => FileType::RegularFile,
            StreamType::Dir => FileType::Directory,
            StreamType::Dev => FileType::CharacterDevice,
            StreamType::Pipe => {
                log::warn!(
                    "trying to access '{uri}' which is a host-level FIFO (named pipe); \
                     only pipes created within the guest are supported"
                );
                return Err(Errno::EACCES);
            }
            other => {
                log::error!("unexpected stream type returned by host: {other:?}");
                unreachable!();
            }
        };

        let perm = attr.share_flags;
        let size = if file_type == FileType::RegularFile {
            attr.pending_size
        } else {
            0
        };

        self.setup_dentry(tree, dent, file_type, perm, size);
        Ok(())
    }

    fn open(
        &self,
        tree: &mut DentryTree,
        dent: DentryId,
        flags: OFlags,
    ) -> Result<Handle<P>, Errno> {
        let inode = Arc::clone(tree.inode(dent).expect("open requires a materialized dentry"));
        let (uri, stream) = self.open_pal(tree, dent, inode.file_type(), flags, Mode::empty())?;
        Ok(Handle::new(self.pal, dent, inode, uri, flags, stream))
    }

    fn creat(
        &self,
        tree: &mut DentryTree,
        dent: DentryId,
        flags: OFlags,
        perm: Mode,
    ) -> Result<Handle<P>, Errno> {
        debug_assert!(tree.inode(dent).is_none());

        let file_type = FileType::RegularFile;
        let (uri, stream) = self.open_pal(
            tree,
            dent,
            file_type,
            flags | OFlags::CREAT | OFlags::EXCL,
            perm,
        )?;
        let inode = self.setup_dentry(tree, dent, file_type, perm, 0);
        Ok(Handle::new(self.pal, dent, inode, uri, flags, stream))
    }

    fn mkdir(&self, tree: &mut DentryTree, dent: DentryId, perm: Mode) -> Result<(), Errno> {
        debug_assert!(tree.inode(dent).is_none());

        let file_type = FileType::Directory;
        let (_uri, stream) =
            self.open_pal(tree, dent, file_type, OFlags::CREAT | OFlags::EXCL, perm)?;
        self.pal.object_close(stream);
        self.setup_dentry(tree, dent, file_type, perm, 0);
        Ok(())
    }

    fn stat(&self, tree: &DentryTree, dent: DentryId) -> Result<FileStatus, Errno> {
        generic::generic_inode_stat(tree, dent)
    }

    fn readdir(
        &self,
        tree: &DentryTree,
        dent: DentryId,
        callback: &mut dyn FnMut(&str) -> Result<(), Errno>,
    ) -> Result<(), Errno> {
        let tmp = self.temp_open(tree, dent, FileType::Directory)?;
        let mut buf = vec![0u8; READDIR_BUF_SIZE];

        loop {
            let read_size = match self.pal.stream_read(tmp.get(), 0, &mut buf) {
                Ok(n) => n,
                Err(PalError::Overflow) => {
                    // Not even one entry fits; grow the buffer and retry.
                    let new_len = buf.len() * 2;
                    buf.resize(new_len, 0);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if read_size == 0 {
                // End of directory listing.
                break;
            }

            // The last entry must be null-terminated.
            assert_eq!(buf[read_size - 1], 0);

            // Read all entries (separated by null bytes) and invoke
            // `callback` on each.
            for name in buf[..read_size - 1].split(|&b| b == 0) {
                if name.is_empty() {
                    log::error!("readdir: empty name returned by host");
                    unreachable!();
                }

                // By the host convention, a name ending with '/' is a
                // directory; the distinction is dropped here and the name is
                // passed on without the '/'.
                let name = match name {
                    [rest @ .., b'/'] => rest,
                    _ => name,
                };

                let name = core::str::from_utf8(name).map_err(|_| Errno::EINVAL)?;
                callback(name)?;
            }
        }
        Ok(())
    }

    fn unlink(&self, tree: &mut DentryTree, dent: DentryId) -> Result<(), Errno> {
        let file_type = tree
            .inode(dent)
            .expect("unlink requires a materialized dentry")
            .file_type();

        let tmp = self.temp_open(tree, dent, file_type)?;
        self.pal
            .stream_delete(tmp.get(), DeleteMode::All)
            .map_err(Errno::from)
    }

    fn rename(&self, tree: &mut DentryTree, old: DentryId, new: DentryId) -> Result<(), Errno> {
        let file_type = tree
            .inode(old)
            .expect("rename requires a materialized source dentry")
            .file_type();

        let new_uri = dentry_uri(tree, new, Some(file_type));
        let tmp = self.temp_open(tree, old, file_type)?;
        self.pal
            .stream_change_name(tmp.get(), &new_uri)
            .map_err(Errno::from)
    }

    fn chmod(&self, tree: &mut DentryTree, dent: DentryId, perm: Mode) -> Result<(), Errno> {
        let inode = Arc::clone(tree.inode(dent).expect("chmod requires a materialized dentry"));

        let mut inode_state = inode.lock();
        let tmp = self.temp_open(tree, dent, inode.file_type())?;
        self.pal
            .stream_attributes_set_by_handle(tmp.get(), host_perm(perm))
            .map_err(Errno::from)?;
        inode_state.perm = perm;
        Ok(())
    }
}

impl<P: Pal + 'static> Filesystem<P> for ChrootFs<P> {
    const NAME: &'static str = "chroot";
}
