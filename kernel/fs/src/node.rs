//! The VFS node tree.
//!
//! One rooted tree of [`VfsNode`]s. Parent links are weak (the tree owns
//! children, children only observe parents), children are held in
//! insertion-ordered vectors, and every node carries an optional operation
//! table plus an opaque backend payload.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicUsize, Ordering};

use muon_core::sync::SpinLock;

use crate::error::FsError;
use crate::path;

/// Node kind: regular file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// Per-backend operation table, attached per node.
///
/// Backends that do not override an operation inherit the default, which
/// reports [`FsError::NotSupported`]; the VFS treats that as "handle it
/// generically" where a generic handling exists (node creation) and as a
/// hard error elsewhere.
pub trait NodeOps: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the count.
    fn read(&self, node: &VfsNode, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let _ = (node, buf, offset);
        Err(FsError::NotSupported)
    }

    /// Writes `buf` at `offset`, returning the count written.
    fn write(&self, node: &VfsNode, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        let _ = (node, buf, offset);
        Err(FsError::NotSupported)
    }

    /// Creates `name` under `parent`, allocating backend structures, linking
    /// the new node into the tree, and returning it.
    fn create(
        &self,
        parent: &Arc<VfsNode>,
        name: &str,
        kind: NodeKind,
    ) -> Result<Arc<VfsNode>, FsError> {
        let _ = (parent, name, kind);
        Err(FsError::NotSupported)
    }

    /// Releases backend state for a node about to be detached.
    fn unlink(&self, node: &VfsNode) -> Result<(), FsError> {
        let _ = node;
        Ok(())
    }

    /// Resizes a file to `size` bytes.
    fn truncate(&self, node: &VfsNode, size: usize) -> Result<(), FsError> {
        let _ = (node, size);
        Err(FsError::NotSupported)
    }
}

/// A node of the VFS tree.
pub struct VfsNode {
    /// Name within the parent directory; unique among siblings.
    name: String,
    /// File or directory.
    kind: NodeKind,
    /// Current size in bytes (files).
    size: AtomicUsize,
    /// Parent directory; the root points at itself.
    parent: SpinLock<Weak<VfsNode>>,
    /// Children, in creation order.
    children: SpinLock<Vec<Arc<VfsNode>>>,
    /// Operation table; `None` for plain tree nodes with no backend.
    ops: SpinLock<Option<Arc<dyn NodeOps>>>,
    /// Opaque backend payload (ramfs data, FAT directory entry, device
    /// state).
    payload: SpinLock<Option<Box<dyn Any + Send + Sync>>>,
}

impl VfsNode {
    /// Allocates a detached node.
    pub fn new(name: &str, kind: NodeKind, ops: Option<Arc<dyn NodeOps>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            size: AtomicUsize::new(0),
            parent: SpinLock::new(Weak::new()),
            children: SpinLock::new(Vec::new()),
            ops: SpinLock::new(ops),
            payload: SpinLock::new(None),
        })
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Updates the size bookkeeping (backends call this after writes).
    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }

    /// Parent node; the root returns itself.
    pub fn parent(self: &Arc<Self>) -> Arc<VfsNode> {
        self.parent.lock().upgrade().unwrap_or_else(|| self.clone())
    }

    /// The operation table, if any.
    pub fn ops(&self) -> Option<Arc<dyn NodeOps>> {
        self.ops.lock().clone()
    }

    /// Installs an operation table (device registration, mounts).
    pub fn set_ops(&self, ops: Arc<dyn NodeOps>) {
        *self.ops.lock() = Some(ops);
    }

    /// Runs `f` over the backend payload slot.
    pub fn with_payload<R>(
        &self,
        f: impl FnOnce(&mut Option<Box<dyn Any + Send + Sync>>) -> R,
    ) -> R {
        f(&mut self.payload.lock())
    }

    /// Finds a direct child by name.
    pub fn child(&self, name: &str) -> Option<Arc<VfsNode>> {
        self.children
            .lock()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Child name at `index`, for `readdir` cursors.
    pub fn child_name_at(&self, index: usize) -> Option<String> {
        self.children.lock().get(index).map(|c| c.name.clone())
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Names of all children, in order.
    pub fn child_names(&self) -> Vec<String> {
        self.children.lock().iter().map(|c| c.name.clone()).collect()
    }

    /// Links `child` under `self`, setting the parent pointer.
    ///
    /// The caller is responsible for sibling-name uniqueness.
    pub fn link_child(self: &Arc<Self>, child: &Arc<VfsNode>) {
        *child.parent.lock() = Arc::downgrade(self);
        self.children.lock().push(child.clone());
    }

    /// Detaches `child` from `self`. No-op if absent.
    pub fn unlink_child(&self, child: &Arc<VfsNode>) {
        self.children.lock().retain(|c| !Arc::ptr_eq(c, child));
    }
}

/// The mounted tree: path resolution, creation, deletion.
pub struct Vfs {
    root: Arc<VfsNode>,
}

impl Vfs {
    /// Creates a tree with an empty root directory (no backend yet).
    pub fn new() -> Self {
        let root = VfsNode::new("/", NodeKind::Directory, None);
        // The root is its own parent: `..` at the top stays put.
        *root.parent.lock() = Arc::downgrade(&root);
        Self { root }
    }

    /// The root directory.
    pub fn root(&self) -> Arc<VfsNode> {
        self.root.clone()
    }

    /// Resolves an absolute path to a node.
    ///
    /// Empty components are skipped, `.` is identity, `..` moves to the
    /// parent (the root's parent is itself).
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidArgument`] for relative or oversized paths,
    /// [`FsError::NotFound`] when a component is missing, and
    /// [`FsError::NotADirectory`] when the walk descends through a file.
    pub fn lookup(&self, path: &str) -> Result<Arc<VfsNode>, FsError> {
        if !path::is_absolute(path) || !path::is_within_bounds(path) {
            return Err(FsError::InvalidArgument);
        }

        let mut current = self.root.clone();
        for component in path::components(path) {
            match component {
                "." => {}
                ".." => current = current.parent(),
                name => {
                    if !current.is_dir() {
                        return Err(FsError::NotADirectory);
                    }
                    current = current.child(name).ok_or(FsError::NotFound)?;
                }
            }
        }
        Ok(current)
    }

    /// Creates a node at `path`.
    ///
    /// The parent must exist and be a directory, and the leaf must not
    /// exist. When the parent's op table provides `create`, the backend
    /// allocates its structures and links the node (the FAT32 path);
    /// otherwise a generic in-memory node inheriting the parent's ops is
    /// linked.
    pub fn create(&self, full_path: &str, kind: NodeKind) -> Result<Arc<VfsNode>, FsError> {
        if !path::is_absolute(full_path) || !path::is_within_bounds(full_path) {
            return Err(FsError::InvalidArgument);
        }
        let (parent_path, name) =
            path::split_parent(full_path).ok_or(FsError::InvalidArgument)?;
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }

        let parent = self.lookup(parent_path)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if parent.child(name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        if let Some(ops) = parent.ops() {
            match ops.create(&parent, name, kind) {
                Err(FsError::NotSupported) => {}
                other => return other,
            }
        }

        // Generic node, inheriting the parent's op table.
        let node = VfsNode::new(name, kind, parent.ops());
        parent.link_child(&node);
        Ok(node)
    }

    /// Removes the node at `path`.
    ///
    /// Refuses to remove the root. A directory with children requires
    /// `recursive`, in which case children are removed depth-first. The
    /// backend's `unlink` hook runs before the node is detached.
    pub fn unlink(&self, target: &str, recursive: bool) -> Result<(), FsError> {
        let node = self.lookup(target)?;
        if Arc::ptr_eq(&node, &self.root) {
            return Err(FsError::InvalidArgument);
        }
        self.unlink_node(&node, recursive)
    }

    fn unlink_node(&self, node: &Arc<VfsNode>, recursive: bool) -> Result<(), FsError> {
        if node.is_dir() && node.child_count() > 0 {
            if !recursive {
                return Err(FsError::NotEmpty);
            }
            loop {
                let child = {
                    let children = node.children.lock();
                    children.first().cloned()
                };
                let Some(child) = child else { break };
                self.unlink_node(&child, true)?;
            }
        }

        if let Some(ops) = node.ops() {
            ops.unlink(node)?;
        }
        node.parent().unlink_child(node);
        Ok(())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Vfs {
        let vfs = Vfs::new();
        crate::ramfs::mount_root(&vfs);
        vfs
    }

    #[test]
    fn root_resolves() {
        let vfs = tree();
        let root = vfs.lookup("/").unwrap();
        assert!(Arc::ptr_eq(&root, &vfs.root()));
    }

    #[test]
    fn relative_paths_rejected() {
        let vfs = tree();
        assert!(matches!(vfs.lookup("etc"), Err(FsError::InvalidArgument)));
        assert!(matches!(
            vfs.create("etc", NodeKind::File),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn create_then_lookup_roundtrip() {
        let vfs = tree();
        vfs.create("/dir", NodeKind::Directory).unwrap();
        let created = vfs.create("/dir/file.txt", NodeKind::File).unwrap();
        let found = vfs.lookup("/dir/file.txt").unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert_eq!(found.name(), "file.txt");
        assert_eq!(found.kind(), NodeKind::File);
    }

    #[test]
    fn dot_and_dotdot_resolution() {
        let vfs = tree();
        vfs.create("/a", NodeKind::Directory).unwrap();
        vfs.create("/a/b", NodeKind::Directory).unwrap();

        let b = vfs.lookup("/a/./b").unwrap();
        assert_eq!(b.name(), "b");
        let a = vfs.lookup("/a/b/..").unwrap();
        assert_eq!(a.name(), "a");
        // `..` above the root stays at the root.
        let root = vfs.lookup("/../..").unwrap();
        assert!(Arc::ptr_eq(&root, &vfs.root()));
    }

    #[test]
    fn duplicate_names_rejected() {
        let vfs = tree();
        vfs.create("/x", NodeKind::File).unwrap();
        assert!(matches!(
            vfs.create("/x", NodeKind::File),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn create_under_missing_parent_fails() {
        let vfs = tree();
        assert!(matches!(
            vfs.create("/no/such/file", NodeKind::File),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn create_under_file_fails() {
        let vfs = tree();
        vfs.create("/f", NodeKind::File).unwrap();
        assert!(matches!(
            vfs.create("/f/child", NodeKind::File),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn unlink_removes_from_lookup() {
        let vfs = tree();
        vfs.create("/doomed", NodeKind::File).unwrap();
        vfs.unlink("/doomed", false).unwrap();
        assert!(matches!(vfs.lookup("/doomed"), Err(FsError::NotFound)));
    }

    #[test]
    fn unlink_root_refused() {
        let vfs = tree();
        assert!(matches!(
            vfs.unlink("/", true),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn unlink_nonempty_dir_requires_recursive() {
        let vfs = tree();
        vfs.create("/d", NodeKind::Directory).unwrap();
        vfs.create("/d/inner", NodeKind::File).unwrap();

        assert!(matches!(vfs.unlink("/d", false), Err(FsError::NotEmpty)));
        vfs.unlink("/d", true).unwrap();
        assert!(matches!(vfs.lookup("/d"), Err(FsError::NotFound)));
    }

    #[test]
    fn recursive_unlink_removes_every_descendant() {
        let vfs = tree();
        vfs.create("/d", NodeKind::Directory).unwrap();
        vfs.create("/d/s1", NodeKind::Directory).unwrap();
        vfs.create("/d/s2", NodeKind::Directory).unwrap();
        vfs.create("/d/s1/f1", NodeKind::File).unwrap();
        vfs.create("/d/s2/f2", NodeKind::File).unwrap();

        vfs.unlink("/d", true).unwrap();
        assert!(matches!(vfs.lookup("/d/s1/f1"), Err(FsError::NotFound)));
        assert_eq!(vfs.root().child_count(), 0);
    }

    #[test]
    fn sibling_order_is_insertion_order() {
        let vfs = tree();
        for name in ["first", "second", "third"] {
            vfs.create(&alloc::format!("/{name}"), NodeKind::File).unwrap();
        }
        assert_eq!(vfs.root().child_names(), ["first", "second", "third"]);
        assert_eq!(vfs.root().child_name_at(1).unwrap(), "second");
    }
}
