//! Crate-local test-only mock host for easily running tests in the various
//! modules.
//!
//! The mock keeps a flat namespace of typed nodes behind `Arc`s, so streams
//! opened on a node keep working after the node is unlinked or renamed,
//! exactly like host file descriptors would. Directory streams speak the
//! PAL listing protocol: chunks of NUL-terminated names, subdirectories
//! marked with a trailing `/`, end of listing signalled by a zero-sized
//! read, and a too-small buffer reported as [`PalError::Overflow`].

// Pull in `std` for the test-only world, so that we have a nicer/easier time
// writing tests.
extern crate std;

use std::boxed::Box;
use std::collections::{BTreeMap, VecDeque};
use std::format;
use std::string::String;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::vec::Vec;

use super::{
    AccessMode, CreateMode, DeleteMode, MapProt, Pal, PalError, StreamAttributes, StreamOptions,
    StreamType,
};
use crate::fs::Mode;

/// A deterministic in-memory host, useful purely for testing within this
/// crate.
///
/// Nodes are kept in a sorted map, so directory listings come out in a
/// stable order. The host also counts its outstanding stream capabilities
/// (see [`Self::open_stream_count`]), which lets tests assert that
/// temporary streams are closed on every path.
pub(crate) struct MockHost {
    nodes: RwLock<BTreeMap<String, Arc<MockNode>>>,
    open_streams: AtomicUsize,
}

struct MockNode {
    kind: StreamType,
    state: RwLock<MockNodeState>,
}

struct MockNodeState {
    perm: Mode,
    data: Vec<u8>,
}

/// A stream capability handed out by [`MockHost`].
pub(crate) struct MockStream {
    node: Arc<MockNode>,
    access: AccessMode,
    // Directory listing in flight, built lazily on the first read.
    dir_listing: Mutex<Option<VecDeque<Vec<u8>>>>,
}

impl MockHost {
    pub(crate) fn new() -> &'static Self {
        // Since this is used entirely for tests, leaking a bit of memory is
        // perfectly fine in order to give ourselves a statically lived host
        // easily.
        Box::leak(Box::new(Self {
            nodes: RwLock::new(BTreeMap::new()),
            open_streams: AtomicUsize::new(0),
        }))
    }

    fn insert(&self, path: &str, kind: StreamType, perm: Mode, data: &[u8]) {
        self.nodes.write().unwrap().insert(
            path.into(),
            Arc::new(MockNode {
                kind,
                state: RwLock::new(MockNodeState {
                    perm,
                    data: data.into(),
                }),
            }),
        );
    }

    pub(crate) fn add_file(&self, path: &str, perm: Mode, data: &[u8]) {
        self.insert(path, StreamType::File, perm, data);
    }

    pub(crate) fn add_dir(&self, path: &str) {
        self.insert(path, StreamType::Dir, Mode::from_bits(0o755).unwrap(), &[]);
    }

    pub(crate) fn add_dev(&self, path: &str) {
        self.insert(path, StreamType::Dev, Mode::from_bits(0o666).unwrap(), &[]);
    }

    pub(crate) fn add_fifo(&self, path: &str) {
        self.insert(path, StreamType::Pipe, Mode::from_bits(0o644).unwrap(), &[]);
    }

    /// Number of stream capabilities currently open on this host.
    pub(crate) fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn path_of(&self, node: &Arc<MockNode>) -> Option<String> {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .find(|(_, n)| Arc::ptr_eq(n, node))
            .map(|(path, _)| path.clone())
    }

    fn list_dir(&self, node: &Arc<MockNode>) -> VecDeque<Vec<u8>> {
        // A listing of a since-deleted directory is simply empty.
        let Some(path) = self.path_of(node) else {
            return VecDeque::new();
        };
        let prefix = format!("{path}/");
        self.nodes
            .read()
            .unwrap()
            .iter()
            .filter_map(|(child_path, child)| {
                let name = child_path.strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                let mut entry: Vec<u8> = name.as_bytes().into();
                if child.kind == StreamType::Dir {
                    entry.push(b'/');
                }
                Some(entry)
            })
            .collect()
    }
}

fn split_uri(uri: &str) -> Result<(&str, &str), PalError> {
    uri.split_once(':').ok_or(PalError::Invalid)
}

fn scheme_kind(scheme: &str) -> Result<StreamType, PalError> {
    match scheme {
        "file" => Ok(StreamType::File),
        "dir" => Ok(StreamType::Dir),
        "dev" => Ok(StreamType::Dev),
        _ => Err(PalError::Invalid),
    }
}

impl Pal for MockHost {
    type StreamHandle = MockStream;

    fn stream_attributes_query(&self, uri: &str) -> Result<StreamAttributes, PalError> {
        let (_scheme, path) = split_uri(uri)?;
        let nodes = self.nodes.read().unwrap();
        let node = nodes.get(path).ok_or(PalError::StreamNotFound)?;
        let state = node.state.read().unwrap();
        Ok(StreamAttributes {
            stream_type: node.kind,
            share_flags: state.perm,
            pending_size: if node.kind == StreamType::File {
                state.data.len() as i64
            } else {
                0
            },
        })
    }

    fn stream_open(
        &self,
        uri: &str,
        access: AccessMode,
        share_flags: Mode,
        create: CreateMode,
        _options: StreamOptions,
    ) -> Result<Self::StreamHandle, PalError> {
        let (scheme, path) = split_uri(uri)?;
        let kind = scheme_kind(scheme)?;

        let mut nodes = self.nodes.write().unwrap();
        let node = match nodes.get(path) {
            Some(node) => {
                if create == CreateMode::Always {
                    return Err(PalError::StreamExists);
                }
                match (kind, node.kind) {
                    (a, b) if a == b => {}
                    (StreamType::Dir, _) => return Err(PalError::StreamIsFile),
                    (_, StreamType::Dir) => return Err(PalError::StreamIsDir),
                    _ => {}
                }
                if node.kind == StreamType::Pipe {
                    return Err(PalError::Denied);
                }
                // Access checks apply to pre-existing objects only; a
                // freshly created object is accessible to its creator
                // whatever its permission bits say.
                let perm = node.state.read().unwrap().perm;
                let (need_read, need_write) = match access {
                    AccessMode::ReadOnly => (true, false),
                    AccessMode::WriteOnly => (false, true),
                    AccessMode::ReadWrite => (true, true),
                };
                if need_read && !perm.contains(Mode::RUSR) {
                    return Err(PalError::Denied);
                }
                if need_write && !perm.contains(Mode::WUSR) {
                    return Err(PalError::Denied);
                }
                Arc::clone(node)
            }
            None => {
                if create == CreateMode::Never {
                    return Err(PalError::StreamNotFound);
                }
                let node = Arc::new(MockNode {
                    kind,
                    state: RwLock::new(MockNodeState {
                        perm: share_flags,
                        data: Vec::new(),
                    }),
                });
                nodes.insert(path.into(), Arc::clone(&node));
                node
            }
        };

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(MockStream {
            node,
            access,
            dir_listing: Mutex::new(None),
        })
    }

    fn stream_read(
        &self,
        handle: &Self::StreamHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, PalError> {
        match handle.node.kind {
            StreamType::File => {
                if handle.access == AccessMode::WriteOnly {
                    return Err(PalError::Denied);
                }
                let offset = usize::try_from(offset).map_err(|_| PalError::Invalid)?;
                let state = handle.node.state.read().unwrap();
                let start = offset.min(state.data.len());
                let end = offset
                    .checked_add(buf.len())
                    .ok_or(PalError::Invalid)?
                    .min(state.data.len());
                buf[..end - start].copy_from_slice(&state.data[start..end]);
                Ok(end - start)
            }
            StreamType::Dir => {
                let mut listing = handle.dir_listing.lock().unwrap();
                let entries =
                    listing.get_or_insert_with(|| self.list_dir(&handle.node));
                let mut filled = 0;
                while let Some(entry) = entries.front() {
                    let needed = entry.len() + 1;
                    if filled + needed > buf.len() {
                        if filled == 0 {
                            // Not even one entry fits.
                            return Err(PalError::Overflow);
                        }
                        break;
                    }
                    buf[filled..filled + entry.len()].copy_from_slice(entry);
                    buf[filled + entry.len()] = 0;
                    filled += needed;
                    entries.pop_front();
                }
                Ok(filled)
            }
            StreamType::Dev => Ok(0),
            _ => Err(PalError::Denied),
        }
    }

    fn stream_write(
        &self,
        handle: &Self::StreamHandle,
        offset: u64,
        buf: &[u8],
    ) -> Result<usize, PalError> {
        match handle.node.kind {
            StreamType::File => {
                if handle.access == AccessMode::ReadOnly {
                    return Err(PalError::Denied);
                }
                let offset = usize::try_from(offset).map_err(|_| PalError::Invalid)?;
                let end = offset.checked_add(buf.len()).ok_or(PalError::Invalid)?;
                let mut state = handle.node.state.write().unwrap();
                if state.data.len() < end {
                    state.data.resize(end, 0);
                }
                state.data[offset..end].copy_from_slice(buf);
                Ok(buf.len())
            }
            StreamType::Dev => Ok(buf.len()),
            StreamType::Dir => Err(PalError::StreamIsDir),
            _ => Err(PalError::Denied),
        }
    }

    fn stream_map(
        &self,
        handle: &Self::StreamHandle,
        addr_hint: Option<usize>,
        _prot: MapProt,
        _offset: u64,
        _size: usize,
    ) -> Result<usize, PalError> {
        if handle.node.kind != StreamType::File {
            return Err(PalError::Invalid);
        }
        Ok(addr_hint.unwrap_or(0x7f00_0000))
    }

    fn stream_set_length(&self, handle: &Self::StreamHandle, size: u64) -> Result<(), PalError> {
        if handle.node.kind != StreamType::File {
            return Err(PalError::Invalid);
        }
        let size = usize::try_from(size).map_err(|_| PalError::Invalid)?;
        handle.node.state.write().unwrap().data.resize(size, 0);
        Ok(())
    }

    fn stream_flush(&self, _handle: &Self::StreamHandle) -> Result<(), PalError> {
        Ok(())
    }

    fn stream_delete(
        &self,
        handle: &Self::StreamHandle,
        mode: DeleteMode,
    ) -> Result<(), PalError> {
        if mode != DeleteMode::All {
            // Half-close is for bidirectional streams, not host files.
            return Err(PalError::NotImplemented);
        }
        let path = self.path_of(&handle.node).ok_or(PalError::StreamNotFound)?;
        self.nodes.write().unwrap().remove(&path);
        Ok(())
    }

    fn stream_change_name(
        &self,
        handle: &Self::StreamHandle,
        new_uri: &str,
    ) -> Result<(), PalError> {
        let (_scheme, new_path) = split_uri(new_uri)?;
        let mut nodes = self.nodes.write().unwrap();
        let old_path = nodes
            .iter()
            .find(|(_, n)| Arc::ptr_eq(n, &handle.node))
            .map(|(path, _)| path.clone())
            .ok_or(PalError::StreamNotFound)?;
        let node = nodes.remove(&old_path).unwrap();

        // Carry any entries below a renamed directory along with it.
        let prefix = format!("{old_path}/");
        let children: Vec<String> = nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for child in children {
            let moved = nodes.remove(&child).unwrap();
            nodes.insert(format!("{new_path}{}", &child[old_path.len()..]), moved);
        }

        nodes.insert(new_path.into(), node);
        Ok(())
    }

    fn stream_attributes_set_by_handle(
        &self,
        handle: &Self::StreamHandle,
        share_flags: Mode,
    ) -> Result<(), PalError> {
        handle.node.state.write().unwrap().perm = share_flags;
        Ok(())
    }

    fn object_close(&self, handle: Self::StreamHandle) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
        drop(handle);
    }
}
