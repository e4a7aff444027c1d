//! Virtual file system
//!
//! An arena-backed tree of named nodes: directories, files, and
//! callback pseudo-files whose content is synthesized at open time.
//! Nodes carry a 9-character mode string, an owner, timestamps, and a
//! reference count that blocks deletion while a handle is open. The
//! root node is never deleted; every other node has exactly one parent.
//!
//! Pseudo "macro" paths `dir:ls` and `dir:ll` produce listings of a
//! directory node. Root impersonation (`as_root`) switches the acting
//! user and must be released before control returns to user code.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Index of a node in the arena
pub type NodeId = usize;

/// Node variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file with a data vector
    File,
    /// Directory with named children
    Dir,
    /// Pseudo-file backed by a callback provider
    Callback,
}

/// Access checked by [`Vfs::can_modify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read the node
    Read,
    /// Mutate the node
    Write,
    /// Traverse / execute
    Exec,
}

impl Access {
    fn bit(self) -> usize {
        match self {
            Access::Read => 0,
            Access::Write => 1,
            Access::Exec => 2,
        }
    }
}

/// A registered account
#[derive(Debug, Clone)]
pub struct User {
    /// Account id; 0 is root
    pub id: u32,
    /// Login name
    pub name: String,
}

/// One tree node
#[derive(Debug, Clone)]
pub struct Node {
    /// Variant
    pub kind: NodeKind,
    /// `rwxrwxrwx` mode string
    pub mode: [u8; 9],
    /// Owning account id
    pub owner: u32,
    /// Creation timestamp (seconds)
    pub created: u64,
    /// Last-access timestamp (seconds)
    pub accessed: u64,
    /// Last-modification timestamp (seconds)
    pub modified: u64,
    /// File content
    pub data: Vec<u8>,
    /// Open-handle count; deletion is refused while non-zero
    pub refs: u32,
    /// Hard lock independent of refs
    pub locked: bool,
    /// Parent node (the root points at itself)
    pub parent: NodeId,
    /// Named children (directories only)
    pub children: BTreeMap<String, NodeId>,
    /// False once removed from the tree
    pub alive: bool,
}

/// What [`Vfs::open`] resolved to
#[derive(Debug, Clone, PartialEq)]
pub enum OpenTarget {
    /// A live file node; the ref count has been incremented
    File(NodeId),
    /// Synthesized content captured at open time
    Cached(Vec<u8>),
    /// A callback node; the caller asks its provider for content
    Callback(String),
}

/// The file system tree
#[derive(Debug)]
pub struct Vfs {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    users: Vec<User>,
    current_user: u32,
    last_user: u32,
    pwd: String,
}

const ROOT: NodeId = 0;

impl Vfs {
    /// Creates a tree with a root directory and the two built-in
    /// accounts (`root`, `user`)
    pub fn new(now: u64) -> Self {
        let mut vfs = Vfs {
            nodes: Vec::new(),
            free: Vec::new(),
            users: vec![
                User {
                    id: 0,
                    name: "root".to_string(),
                },
                User {
                    id: 1,
                    name: "user".to_string(),
                },
            ],
            current_user: 0,
            last_user: 1,
            pwd: "/".to_string(),
        };
        let root = vfs.new_node(NodeKind::Dir, now);
        debug_assert_eq!(root, ROOT);
        vfs.nodes[ROOT].parent = ROOT;
        vfs.current_user = 1;
        vfs.last_user = 0;
        vfs
    }

    fn new_node(&mut self, kind: NodeKind, now: u64) -> NodeId {
        let node = Node {
            kind,
            mode: *match kind {
                NodeKind::Dir => b"rwxr-xr-x",
                _ => b"rw-r--r--",
            },
            owner: self.current_user,
            created: now,
            accessed: now,
            modified: now,
            data: Vec::new(),
            refs: 0,
            locked: false,
            parent: ROOT,
            children: BTreeMap::new(),
            alive: true,
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Acting user name
    pub fn user_name(&self) -> &str {
        &self.users[self.current_user as usize].name
    }

    /// Current working directory
    pub fn pwd(&self) -> &str {
        &self.pwd
    }

    /// Enters or leaves root impersonation
    pub fn as_root(&mut self, flag: bool) {
        if flag {
            if self.current_user != 0 {
                self.last_user = self.current_user;
                self.current_user = 0;
            }
        } else if self.current_user == 0 {
            self.current_user = self.last_user;
            self.last_user = 0;
        }
    }

    /// True while impersonating root
    pub fn is_root(&self) -> bool {
        self.current_user == 0
    }

    /// Borrows a node
    pub fn node(&self, id: NodeId) -> &Node {
        debug_assert!(self.nodes[id].alive, "node {} was removed", id);
        &self.nodes[id]
    }

    /// Mutably borrows a node
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    // -------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------

    /// Joins `path` onto `pwd`, resolving `.` and `..`
    pub fn combine(&self, path: &str) -> String {
        if path.is_empty() {
            return self.pwd.clone();
        }
        let mut parts: Vec<&str> = if path.starts_with('/') {
            Vec::new()
        } else {
            self.pwd.split('/').filter(|p| !p.is_empty()).collect()
        };
        for p in path.split('/').filter(|p| !p.is_empty()) {
            match p {
                "." => {}
                ".." => {
                    parts.pop();
                }
                _ => parts.push(p),
            }
        }
        if parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", parts.join("/"))
        }
    }

    /// Resolves an absolute or pwd-relative path to a node
    ///
    /// Traversal consults the read permission of each directory on the
    /// way down.
    pub fn get_node(&self, path: &str) -> Option<NodeId> {
        let abs = self.combine(path);
        let mut cur = ROOT;
        for part in abs.split('/').filter(|p| !p.is_empty()) {
            if !self.can_modify(cur, Access::Read) {
                return None;
            }
            if self.nodes[cur].kind != NodeKind::Dir {
                return None;
            }
            cur = *self.nodes[cur].children.get(part)?;
        }
        Some(cur)
    }

    /// Permission check consulted before every mutation
    pub fn can_modify(&self, id: NodeId, access: Access) -> bool {
        if self.current_user == 0 {
            return true;
        }
        let node = &self.nodes[id];
        let bit = access.bit();
        if node.owner == self.current_user {
            node.mode[bit] != b'-'
        } else {
            node.mode[6 + bit] != b'-'
        }
    }

    // -------------------------------------------------------------------
    // Tree mutation
    // -------------------------------------------------------------------

    /// Changes the working directory
    pub fn cd(&mut self, path: &str) -> Result<()> {
        let abs = self.combine(path);
        let id = self.get_node(&abs).ok_or_else(|| Error::FileNotFound {
            path: abs.clone(),
        })?;
        if self.nodes[id].kind != NodeKind::Dir {
            return Err(Error::PermissionDenied { path: abs });
        }
        self.pwd = abs;
        Ok(())
    }

    /// Creates a directory chain, `mkdir -p` style
    pub fn mkdir(&mut self, path: &str, now: u64) -> Result<NodeId> {
        let abs = self.combine(path);
        let mut cur = ROOT;
        let mut created = false;
        let parts: Vec<String> = abs
            .split('/')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        for part in &parts {
            match self.nodes[cur].children.get(part) {
                Some(&next) => {
                    if self.nodes[next].kind != NodeKind::Dir {
                        return Err(Error::PermissionDenied { path: abs });
                    }
                    cur = next;
                }
                None => {
                    if !self.can_modify(cur, Access::Write) {
                        return Err(Error::PermissionDenied { path: abs });
                    }
                    let node = self.new_node(NodeKind::Dir, now);
                    self.nodes[node].parent = cur;
                    self.nodes[cur].children.insert(part.clone(), node);
                    cur = node;
                    created = true;
                }
            }
        }
        if created {
            Ok(cur)
        } else {
            Err(Error::PermissionDenied { path: abs })
        }
    }

    /// Creates an empty file, or refreshes timestamps when it exists
    pub fn touch(&mut self, path: &str, now: u64) -> Result<NodeId> {
        let abs = self.combine(path);
        if let Some(id) = self.get_node(&abs) {
            if !self.can_modify(id, Access::Write) {
                return Err(Error::PermissionDenied { path: abs });
            }
            let node = &mut self.nodes[id];
            node.created = now;
            node.accessed = now;
            node.modified = now;
            return Ok(id);
        }
        let (dir, name) = self.split_parent(&abs)?;
        if !self.can_modify(dir, Access::Write) {
            return Err(Error::PermissionDenied { path: abs });
        }
        let node = self.new_node(NodeKind::File, now);
        self.nodes[node].parent = dir;
        self.nodes[dir].children.insert(name, node);
        Ok(node)
    }

    /// Registers a callback pseudo-file
    pub fn install_callback(&mut self, path: &str, now: u64) -> Result<NodeId> {
        let id = self.touch(path, now)?;
        self.nodes[id].kind = NodeKind::Callback;
        Ok(id)
    }

    fn split_parent(&self, abs: &str) -> Result<(NodeId, String)> {
        let (dir_path, name) = match abs.rfind('/') {
            Some(0) => ("/", &abs[1..]),
            Some(k) => (&abs[..k], &abs[k + 1..]),
            None => {
                return Err(Error::FileNotFound {
                    path: abs.to_string(),
                })
            }
        };
        if name.is_empty() {
            return Err(Error::FileNotFound {
                path: abs.to_string(),
            });
        }
        let dir = self.get_node(dir_path).ok_or_else(|| Error::FileNotFound {
            path: dir_path.to_string(),
        })?;
        if self.nodes[dir].kind != NodeKind::Dir {
            return Err(Error::FileNotFound {
                path: dir_path.to_string(),
            });
        }
        Ok((dir, name.to_string()))
    }

    /// Removes a node after checking permissions, references, and locks
    ///
    /// Directories are checked recursively before anything is removed.
    pub fn rm_safe(&mut self, path: &str) -> Result<()> {
        let abs = self.combine(path);
        let id = self.get_node(&abs).ok_or_else(|| Error::FileNotFound {
            path: abs.clone(),
        })?;
        if id == ROOT {
            return Err(Error::PermissionDenied { path: abs });
        }
        if !self.can_remove(id) {
            return Err(Error::PermissionDenied { path: abs });
        }
        let parent = self.nodes[id].parent;
        let name = self
            .nodes[parent]
            .children
            .iter()
            .find(|(_, &c)| c == id)
            .map(|(n, _)| n.clone())
            .ok_or(Error::FileNotFound { path: abs })?;
        self.nodes[parent].children.remove(&name);
        self.drop_subtree(id);
        Ok(())
    }

    fn can_remove(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        if !self.can_modify(id, Access::Write) || node.refs > 0 || node.locked {
            return false;
        }
        if node.kind == NodeKind::Dir {
            node.children.values().all(|&c| self.can_remove(c))
        } else {
            true
        }
    }

    fn drop_subtree(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.nodes[id].children.values().copied().collect();
        for c in children {
            self.drop_subtree(c);
        }
        self.nodes[id].alive = false;
        self.nodes[id].children.clear();
        self.nodes[id].data.clear();
        self.free.push(id);
    }

    // -------------------------------------------------------------------
    // Content access
    // -------------------------------------------------------------------

    /// Reads a file without touching timestamps; the kernel's linker
    /// path uses this from behind an immutable borrow
    pub fn read_quiet(&self, path: &str) -> Option<Vec<u8>> {
        let id = self.get_node(path)?;
        (self.nodes[id].kind == NodeKind::File).then(|| self.nodes[id].data.clone())
    }

    /// Reads a whole file
    pub fn read_file(&mut self, path: &str, now: u64) -> Result<Vec<u8>> {
        let abs = self.combine(path);
        let id = self.get_node(&abs).ok_or_else(|| Error::FileNotFound {
            path: abs.clone(),
        })?;
        if self.nodes[id].kind != NodeKind::File {
            return Err(Error::PermissionDenied { path: abs });
        }
        if !self.can_modify(id, Access::Read) {
            return Err(Error::PermissionDenied { path: abs });
        }
        self.nodes[id].accessed = now;
        Ok(self.nodes[id].data.clone())
    }

    /// Creates or replaces a file's content
    pub fn write_file(&mut self, path: &str, data: &[u8], now: u64) -> Result<NodeId> {
        let abs = self.combine(path);
        let id = match self.get_node(&abs) {
            Some(id) => id,
            None => self.touch(&abs, now)?,
        };
        if self.nodes[id].kind != NodeKind::File {
            return Err(Error::PermissionDenied { path: abs });
        }
        if !self.can_modify(id, Access::Write) {
            return Err(Error::PermissionDenied { path: abs });
        }
        let node = &mut self.nodes[id];
        node.data = data.to_vec();
        node.modified = now;
        Ok(id)
    }

    /// Opens a path for reading
    ///
    /// `dir:ls` and `dir:ll` macro suffixes synthesize listings;
    /// callback nodes report their path so the caller can consult its
    /// provider. Plain files get their ref count bumped — pair with
    /// [`Vfs::release`].
    pub fn open(&mut self, path: &str, now: u64) -> Result<OpenTarget> {
        let (base, macro_cmd) = match path.split_once(':') {
            Some((b, m)) => (b, Some(m)),
            None => (path, None),
        };
        let abs = self.combine(base);
        let id = self.get_node(&abs).ok_or_else(|| Error::FileNotFound {
            path: abs.clone(),
        })?;
        if !self.can_modify(id, Access::Read) {
            return Err(Error::PermissionDenied { path: abs });
        }
        self.nodes[id].accessed = now;
        match (self.nodes[id].kind, macro_cmd) {
            (NodeKind::Dir, Some("ls")) => Ok(OpenTarget::Cached(self.list_short(id).into_bytes())),
            (NodeKind::Dir, Some("ll")) => Ok(OpenTarget::Cached(self.list_long(id).into_bytes())),
            (NodeKind::File, None) => {
                if self.nodes[id].locked {
                    return Err(Error::PermissionDenied { path: abs });
                }
                self.nodes[id].refs += 1;
                Ok(OpenTarget::File(id))
            }
            (NodeKind::Callback, None) => Ok(OpenTarget::Callback(abs)),
            _ => Err(Error::PermissionDenied { path: abs }),
        }
    }

    /// Releases one reference taken by [`Vfs::open`]
    pub fn release(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        if node.refs > 0 {
            node.refs -= 1;
        }
    }

    fn list_short(&self, id: NodeId) -> String {
        self.nodes[id]
            .children
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn list_long(&self, id: NodeId) -> String {
        let mut lines = Vec::new();
        lines.push(self.ll_line("..", self.nodes[id].parent));
        lines.push(self.ll_line(".", id));
        for (name, &child) in &self.nodes[id].children {
            lines.push(self.ll_line(name, child));
        }
        lines.join("\n")
    }

    fn ll_line(&self, name: &str, id: NodeId) -> String {
        let node = &self.nodes[id];
        let owner = self
            .users
            .iter()
            .find(|u| u.id == node.owner)
            .map(|u| u.name.as_str())
            .unwrap_or("?");
        format!(
            "\x1bFFFA0A0A0\x1b{}{} \x1bFFFB3B920\x1b{:>5} \x1bS4\x1b{:>8} {:>10} \x1bFFF35EA3F\x1b{}\x1bS4\x1b",
            if node.kind == NodeKind::Dir { 'd' } else { '-' },
            std::str::from_utf8(&node.mode).unwrap_or("?????????"),
            owner,
            node.data.len(),
            node.created,
            name
        )
    }
}
