// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The directory cache: mounts, the dentry tree, and inodes.
//!
//! The tree is an arena indexed by [`DentryId`]; parent links are indices
//! rather than owning references, so the cache has no reference cycles.
//! The whole tree sits behind the single mutex in [`Dcache`] — holding its
//! guard (or a `&`/`&mut DentryTree` borrowed from it) is what "holding the
//! dcache lock" means, so the locking discipline of tree-mutating operations
//! is enforced by the borrow checker rather than by runtime assertions.
//!
//! Inodes are shared between the dentry that materialized them and any open
//! handles; each carries its own leaf lock for the mutable metadata (size,
//! permission bits). Lock order is dcache, then inode, then handle.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use crate::fs::{FileType, Mode};

/// A binding of a guest-visible subtree to a host URI prefix.
///
/// The URI is fixed for the lifetime of the mount and is never empty.
#[derive(Debug)]
pub struct Mount {
    uri: String,
}

impl Mount {
    /// The host URI prefix this mount is backed by, e.g. `file:/tmp`.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Index of a dentry within a [`DentryTree`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DentryId(usize);

/// A node in the directory cache.
///
/// A dentry without an inode is *negative*: either it has never been looked
/// up, or the object behind it was unlinked. Negative dentries stay in the
/// cache and can be re-materialized by a later lookup.
pub struct Dentry {
    name: String,
    parent: Option<DentryId>,
    mount: Arc<Mount>,
    inode: Option<Arc<Inode>>,
    children: HashMap<String, DentryId>,
}

impl Dentry {
    /// Name of this dentry within its parent; empty for mount roots.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mount this dentry belongs to.
    #[must_use]
    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// The materialized inode, if any.
    #[must_use]
    pub fn inode(&self) -> Option<&Arc<Inode>> {
        self.inode.as_ref()
    }
}

/// The dentry arena. Only reachable through [`Dcache::lock`], so a reference
/// to it doubles as proof that the dcache lock is held.
pub struct DentryTree {
    nodes: Vec<Dentry>,
}

impl DentryTree {
    fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Register a mount and return its root dentry.
    ///
    /// The URI is taken as-is; scheme validation is the personality's job
    /// (its `mount` operation).
    pub fn add_mount(&mut self, uri: &str) -> DentryId {
        let mount = Arc::new(Mount { uri: uri.into() });
        self.insert(Dentry {
            name: String::new(),
            parent: None,
            mount,
            inode: None,
            children: HashMap::new(),
        })
    }

    fn insert(&mut self, dentry: Dentry) -> DentryId {
        let id = DentryId(self.nodes.len());
        self.nodes.push(dentry);
        id
    }

    /// Borrow the dentry at `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not come from this tree.
    #[must_use]
    pub fn get(&self, id: DentryId) -> &Dentry {
        &self.nodes[id.0]
    }

    /// Find an existing child of `dir` by name.
    #[must_use]
    pub fn child(&self, dir: DentryId, name: &str) -> Option<DentryId> {
        self.nodes[dir.0].children.get(name).copied()
    }

    /// Find or create the (possibly negative) child dentry `name` of `dir`.
    pub fn add_child(&mut self, dir: DentryId, name: &str) -> DentryId {
        if let Some(existing) = self.child(dir, name) {
            return existing;
        }
        let mount = Arc::clone(&self.nodes[dir.0].mount);
        let id = self.insert(Dentry {
            name: name.into(),
            parent: Some(dir),
            mount,
            inode: None,
            children: HashMap::new(),
        });
        self.nodes[dir.0].children.insert(name.into(), id);
        id
    }

    /// Iterate over the children of `dir`, in no particular order.
    pub fn children(&self, dir: DentryId) -> impl Iterator<Item = DentryId> + '_ {
        self.nodes[dir.0].children.values().copied()
    }

    /// The materialized inode of `id`, if any.
    #[must_use]
    pub fn inode(&self, id: DentryId) -> Option<&Arc<Inode>> {
        self.nodes[id.0].inode.as_ref()
    }

    /// Attach a freshly created inode to a negative dentry.
    ///
    /// # Panics
    ///
    /// Panics if the dentry already has an inode; materializing twice is a
    /// caller bug.
    pub fn set_inode(&mut self, id: DentryId, inode: Arc<Inode>) {
        let old = self.nodes[id.0].inode.replace(inode);
        assert!(old.is_none(), "dentry is already materialized");
    }

    /// Detach and return the inode of `id`, leaving the dentry negative.
    ///
    /// Open handles keep their own reference; the inode object lives on
    /// until the last of them is dropped.
    pub fn take_inode(&mut self, id: DentryId) -> Option<Arc<Inode>> {
        self.nodes[id.0].inode.take()
    }

    /// The path of `id` relative to its mount root: empty for the root
    /// itself, `a/b/c` below it.
    #[must_use]
    pub fn rel_path(&self, id: DentryId) -> String {
        let mut components: Vec<&str> = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.nodes[cur.0].parent {
            components.push(&self.nodes[cur.0].name);
            cur = parent;
        }
        components.reverse();
        components.join("/")
    }
}

/// The process-wide directory cache.
pub struct Dcache {
    tree: Mutex<DentryTree>,
}

impl Dcache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(DentryTree::new()),
        }
    }

    /// Acquire the global dcache lock.
    ///
    /// All dentry-tree mutation and lookup goes through the returned guard;
    /// it must not be held across guest-visible blocking other than the PAL
    /// calls the personality itself makes.
    pub fn lock(&self) -> MutexGuard<'_, DentryTree> {
        self.tree.lock()
    }
}

impl Default for Dcache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached metadata for one host object.
pub struct Inode {
    file_type: FileType,
    mount: Arc<Mount>,
    state: Mutex<InodeState>,
}

/// The mutable part of an inode, behind its leaf lock.
pub struct InodeState {
    /// Guest-visible permission bits. The host-side bits are always
    /// `perm | 0o400` (see the personality's forced-read rule).
    pub perm: Mode,
    /// Object size in bytes; only ever non-zero for regular files.
    pub size: i64,
}

impl Inode {
    /// Allocate a new inode for `mount` with the given type and permissions.
    #[must_use]
    pub fn new(mount: Arc<Mount>, file_type: FileType, perm: Mode) -> Arc<Self> {
        Arc::new(Self {
            file_type,
            mount,
            state: Mutex::new(InodeState { perm, size: 0 }),
        })
    }

    /// The file type; never changes after creation.
    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// The mount this inode belongs to.
    #[must_use]
    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// Acquire this inode's leaf lock.
    pub fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }
}
