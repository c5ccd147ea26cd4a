// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Generic inode helpers, shared by personalities whose metadata lives in
//! cached inodes: seek arithmetic, stat filling, poll readiness, and
//! directory iteration over cached children.

use crate::dcache::{DentryId, DentryTree, Inode};
use crate::errno::Errno;
use crate::fs::{FileStatus, FileType, Handle, PollFlags, SeekOrigin};
use crate::pal::Pal;
use crate::utils::hash_str;

/// Compute a new file position from `(pos, size, offset, origin)`.
///
/// All additions are checked; a final position below zero is invalid.
pub fn generic_seek(pos: i64, size: i64, offset: i64, origin: SeekOrigin) -> Result<i64, Errno> {
    debug_assert!(pos >= 0);
    debug_assert!(size >= 0);

    let new_pos = match origin {
        SeekOrigin::Start => offset,
        SeekOrigin::Current => pos.checked_add(offset).ok_or(Errno::EOVERFLOW)?,
        SeekOrigin::End => size.checked_add(offset).ok_or(Errno::EOVERFLOW)?,
    };

    if new_pos < 0 {
        return Err(Errno::EINVAL);
    }
    Ok(new_pos)
}

fn generic_istat(inode: &Inode) -> FileStatus {
    let state = inode.lock();
    FileStatus {
        file_type: inode.file_type(),
        mode: state.perm,
        size: state.size,
        // nlink is synthesized: 2 for directories (to account for "." and
        // ".."), 1 for other files. Exact link counts are not tracked.
        nlink: if inode.file_type() == FileType::Directory {
            2
        } else {
            1
        },
        dev: hash_str(inode.mount().uri()),
    }
}

/// Status of a materialized dentry. Caller must hold the dcache lock.
pub fn generic_inode_stat(tree: &DentryTree, dent: DentryId) -> Result<FileStatus, Errno> {
    let inode = tree
        .inode(dent)
        .expect("stat requires a materialized dentry");
    Ok(generic_istat(inode))
}

/// Status of the inode behind an open handle.
pub fn generic_inode_hstat<P: Pal + 'static>(hdl: &Handle<P>) -> Result<FileStatus, Errno> {
    Ok(generic_istat(hdl.inode()))
}

/// Reposition an open handle, emulating `lseek` entirely inside the
/// personality.
pub fn generic_inode_seek<P: Pal + 'static>(
    hdl: &Handle<P>,
    offset: i64,
    origin: SeekOrigin,
) -> Result<i64, Errno> {
    let inode_state = hdl.inode().lock();
    let mut state = hdl.state.lock();
    let new_pos = generic_seek(state.pos, inode_state.size, offset, origin)?;
    state.pos = new_pos;
    Ok(new_pos)
}

/// Derive poll readiness for an open handle.
///
/// Regular files are always writable and readable while the position is
/// before the end of the file; other file types report `EAGAIN`.
pub fn generic_inode_poll<P: Pal + 'static>(
    hdl: &Handle<P>,
    interest: PollFlags,
) -> Result<PollFlags, Errno> {
    let inode_state = hdl.inode().lock();
    let state = hdl.state.lock();

    if hdl.inode().file_type() != FileType::RegularFile {
        return Err(Errno::EAGAIN);
    }

    let mut ready = PollFlags::empty();
    if interest.contains(PollFlags::WR) {
        ready |= PollFlags::WR;
    }
    // TODO: the `pos < size` condition is wrong, poll(2) treats end-of-file
    // as readable. Check whether removing it breaks the poll implementation
    // above this layer.
    if interest.contains(PollFlags::RD) && state.pos < inode_state.size {
        ready |= PollFlags::RD;
    }
    Ok(ready)
}

/// Iterate the cached children of a materialized directory dentry, invoking
/// `callback` for each child that has an inode. Caller must hold the dcache
/// lock.
///
/// The on-host directory listing is the personality's own job; this helper
/// only ever sees what is already in the cache.
pub fn generic_readdir(
    tree: &DentryTree,
    dent: DentryId,
    callback: &mut dyn FnMut(&str) -> Result<(), Errno>,
) -> Result<(), Errno> {
    let inode = tree
        .inode(dent)
        .expect("readdir requires a materialized dentry");
    assert_eq!(inode.file_type(), FileType::Directory);

    for child_id in tree.children(dent) {
        let child = tree.get(child_id);
        if child.inode().is_some() {
            callback(child.name())?;
        }
    }
    Ok(())
}
