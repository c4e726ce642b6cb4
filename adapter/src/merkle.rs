//! Builds the Merkle tree of input directories for an action.
//!
//! Entries are registered under their root-relative name (in the
//! client's path style) and realized bottom-up at [MerkleTree::build]:
//! each directory becomes an encoded [reapi::Directory] whose digest is
//! recorded in the digest store and linked from its parent, and the root
//! digest identifies the whole tree.

use std::collections::{BTreeMap, HashMap};

use rexa_reapi as reapi;
use thiserror::Error;

use crate::digest::{self, Data};
use crate::path::PathStyle;

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("absolute path not allowed in tree: {0}")]
    AbsolutePath(String),

    #[error("path escapes the input root: {0}")]
    OutsideRoot(String),

    #[error("{0:?} is used as both a directory and a file")]
    NotADirectory(String),
}

/// One tree entry. A regular file carries data, a symlink carries a
/// target, a directory carries neither.
#[derive(Clone, Debug)]
pub struct Entry {
    pub name: String,
    pub data: Option<Data>,
    pub is_executable: bool,
    pub target: String,
}

impl Entry {
    pub fn file(name: impl Into<String>, data: Data, is_executable: bool) -> Self {
        Self {
            name: name.into(),
            data: Some(data),
            is_executable,
            target: String::new(),
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
            is_executable: false,
            target: String::new(),
        }
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
            is_executable: false,
            target: target.into(),
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.data.is_none() && !self.target.is_empty()
    }
}

#[derive(Clone, Debug)]
enum Node {
    File { data: Data, is_executable: bool },
    Symlink { target: String },
    Dir,
}

pub struct MerkleTree {
    style: PathStyle,
    root_dir: String,
    // Keyed by path components; BTreeMap order gives each directory its
    // children sorted by name.
    nodes: BTreeMap<Vec<String>, Node>,
}

impl MerkleTree {
    pub fn new(style: PathStyle, root_dir: impl Into<String>) -> Self {
        Self {
            style,
            root_dir: root_dir.into(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn root_dir(&self) -> &str {
        &self.root_dir
    }

    /// Registers an entry. Last write wins for a given name; registering
    /// `a/b` implies `a` is a directory.
    pub fn set(&mut self, entry: Entry) -> Result<(), MerkleError> {
        if self.style.is_abs(&entry.name) {
            return Err(MerkleError::AbsolutePath(entry.name));
        }
        let cleaned = self.style.clean(&entry.name);
        let components = self.style.split_elem(&cleaned);
        if components.first().is_some_and(|c| c == "..") {
            return Err(MerkleError::OutsideRoot(entry.name));
        }
        if components.is_empty() {
            // The root itself; it always exists.
            return Ok(());
        }

        for depth in 1..components.len() {
            let ancestor = components[..depth].to_vec();
            match self.nodes.entry(ancestor) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(Node::Dir);
                }
                std::collections::btree_map::Entry::Occupied(e) => {
                    if !matches!(e.get(), Node::Dir) {
                        return Err(MerkleError::NotADirectory(
                            e.key().join(&self.style.sep().to_string()),
                        ));
                    }
                }
            }
        }

        let node = match (&entry.data, entry.target.is_empty()) {
            (Some(data), _) => Node::File {
                data: data.clone(),
                is_executable: entry.is_executable,
            },
            (None, false) => Node::Symlink {
                target: entry.target.clone(),
            },
            (None, true) => Node::Dir,
        };
        self.nodes.insert(components, node);
        Ok(())
    }

    /// Realizes every directory bottom-up, records the encoded form of
    /// each in `store` along with every file's blob data, and returns
    /// the root digest. After this, the store holds everything the tree
    /// references, which is what missing-blob discovery queries.
    pub fn build(&self, store: &mut crate::digest::Store) -> Result<reapi::Digest, MerkleError> {
        // Children per parent, already name-sorted by map order.
        let mut children: HashMap<&[String], Vec<(&str, &Node)>> = HashMap::new();
        let mut dirs: Vec<&[String]> = Vec::new();
        dirs.push(&[]);
        for (path, node) in &self.nodes {
            let (name, parent) = path.split_last().expect("set() rejects empty paths");
            children
                .entry(parent)
                .or_default()
                .push((name.as_str(), node));
            if matches!(node, Node::Dir) {
                dirs.push(path);
            }
        }
        // Deepest first, so a directory's digest exists before its parent
        // links to it.
        dirs.sort_by_key(|p| std::cmp::Reverse(p.len()));

        let mut dir_digests: HashMap<Vec<String>, reapi::Digest> = HashMap::new();
        for dir in dirs {
            let mut directory = reapi::Directory::default();
            for (name, node) in children.get(dir).map(Vec::as_slice).unwrap_or(&[]) {
                match node {
                    Node::File {
                        data,
                        is_executable,
                    } => {
                        store.set((*data).clone());
                        directory.files.push(reapi::FileNode {
                            name: (*name).to_owned(),
                            digest: Some(data.digest().clone()),
                            is_executable: *is_executable,
                        })
                    }
                    Node::Symlink { target } => directory.symlinks.push(reapi::SymlinkNode {
                        name: (*name).to_owned(),
                        target: target.clone(),
                    }),
                    Node::Dir => {
                        let mut child = dir.to_vec();
                        child.push((*name).to_owned());
                        let digest = dir_digests
                            .get(&child)
                            .cloned()
                            .expect("child directory built before parent");
                        directory.directories.push(reapi::DirectoryNode {
                            name: (*name).to_owned(),
                            digest: Some(digest),
                        });
                    }
                }
            }
            let (digest, encoded) = digest::of_message(&directory);
            store.set(Data::bytes("input directory", encoded));
            dir_digests.insert(dir.to_vec(), digest);
        }

        Ok(dir_digests
            .remove(&Vec::new())
            .expect("root directory is always built"))
    }
}
