//! In-memory filesystem.
//!
//! The root filesystem during bring-up and the reference [`Filesystem`]
//! implementation: a node table keyed by inode, directories as name maps.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use sett_core::{Cause, Error, Location, Result};

use crate::dirent::DirEntry;
use crate::{Filesystem, Inode, NodeKind, NodeStat};

const ROOT_INODE: Inode = 1;

fn fs_err(cause: Cause) -> Error {
    Error::new(Location::Fs, cause)
}

#[derive(Debug)]
enum Node {
    File { data: Vec<u8>, perms: u16 },
    Directory { entries: BTreeMap<String, Inode>, perms: u16 },
}

/// A RAM-backed filesystem.
#[derive(Debug)]
pub struct RamFs {
    nodes: BTreeMap<Inode, Node>,
    next_inode: Inode,
}

impl RamFs {
    /// Creates a filesystem containing only an empty root directory.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_INODE,
            Node::Directory {
                entries: BTreeMap::new(),
                perms: 0o755,
            },
        );
        Self {
            nodes,
            next_inode: ROOT_INODE + 1,
        }
    }

    /// Convenience for seeding: creates any missing directories along
    /// `path` and writes `data` into the named file.
    pub fn populate(&mut self, path: &str, data: &[u8]) -> Result<Inode> {
        let mut dir = ROOT_INODE;
        let mut parts = crate::path::components(path).peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let inode = match self.lookup(dir, part) {
                    Ok(existing) => existing,
                    Err(_) => self.create(dir, part, NodeKind::File)?,
                };
                self.truncate(inode, 0)?;
                self.write(inode, 0, data)?;
                return Ok(inode);
            }
            dir = match self.lookup(dir, part) {
                Ok(next) => next,
                Err(_) => self.create(dir, part, NodeKind::Directory)?,
            };
        }
        Err(fs_err(Cause::Param))
    }

    fn dir_entries(&self, inode: Inode) -> Result<&BTreeMap<String, Inode>> {
        match self.nodes.get(&inode) {
            Some(Node::Directory { entries, .. }) => Ok(entries),
            Some(Node::File { .. }) => Err(fs_err(Cause::Param)),
            None => Err(fs_err(Cause::NotFound)),
        }
    }

    fn file_data(&self, inode: Inode) -> Result<&Vec<u8>> {
        match self.nodes.get(&inode) {
            Some(Node::File { data, .. }) => Ok(data),
            Some(Node::Directory { .. }) => Err(fs_err(Cause::Param)),
            None => Err(fs_err(Cause::NotFound)),
        }
    }

    fn file_data_mut(&mut self, inode: Inode) -> Result<&mut Vec<u8>> {
        match self.nodes.get_mut(&inode) {
            Some(Node::File { data, .. }) => Ok(data),
            Some(Node::Directory { .. }) => Err(fs_err(Cause::Param)),
            None => Err(fs_err(Cause::NotFound)),
        }
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn root(&self) -> Inode {
        ROOT_INODE
    }

    fn lookup(&self, dir: Inode, name: &str) -> Result<Inode> {
        self.dir_entries(dir)?
            .get(name)
            .copied()
            .ok_or(fs_err(Cause::NotFound))
    }

    fn stat(&self, inode: Inode) -> Result<NodeStat> {
        match self.nodes.get(&inode) {
            Some(Node::File { data, perms }) => Ok(NodeStat {
                kind: NodeKind::File,
                size: data.len() as u64,
                perms: *perms,
            }),
            Some(Node::Directory { perms, .. }) => Ok(NodeStat {
                kind: NodeKind::Directory,
                size: 0,
                perms: *perms,
            }),
            None => Err(fs_err(Cause::NotFound)),
        }
    }

    fn create(&mut self, dir: Inode, name: &str, kind: NodeKind) -> Result<Inode> {
        if name.is_empty() || name.contains('/') {
            return Err(fs_err(Cause::Param));
        }
        if self.dir_entries(dir)?.contains_key(name) {
            return Err(fs_err(Cause::State));
        }
        let node = match kind {
            NodeKind::File => Node::File {
                data: Vec::new(),
                perms: 0o644,
            },
            NodeKind::Directory => Node::Directory {
                entries: BTreeMap::new(),
                perms: 0o755,
            },
            NodeKind::Symlink => return Err(fs_err(Cause::Unsupported)),
        };
        let inode = self.next_inode;
        self.next_inode += 1;
        self.nodes.insert(inode, node);
        let Some(Node::Directory { entries, .. }) = self.nodes.get_mut(&dir) else {
            unreachable!("checked above");
        };
        entries.insert(name.to_string(), inode);
        Ok(inode)
    }

    fn unlink(&mut self, dir: Inode, name: &str) -> Result<()> {
        let inode = self.lookup(dir, name)?;
        if let Node::Directory { entries, .. } = &self.nodes[&inode] {
            if !entries.is_empty() {
                return Err(fs_err(Cause::State));
            }
        }
        let Some(Node::Directory { entries, .. }) = self.nodes.get_mut(&dir) else {
            return Err(fs_err(Cause::NotFound));
        };
        entries.remove(name);
        self.nodes.remove(&inode);
        Ok(())
    }

    fn read(&self, inode: Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.file_data(inode)?;
        let offset = usize::try_from(offset).map_err(|_| fs_err(Cause::Range))?;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, inode: Inode, offset: u64, buf: &[u8]) -> Result<usize> {
        let data = self.file_data_mut(inode)?;
        let offset = usize::try_from(offset).map_err(|_| fs_err(Cause::Range))?;
        let end = offset.checked_add(buf.len()).ok_or(fs_err(Cause::Range))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&mut self, inode: Inode, size: u64) -> Result<()> {
        let data = self.file_data_mut(inode)?;
        let size = usize::try_from(size).map_err(|_| fs_err(Cause::Range))?;
        data.resize(size, 0);
        Ok(())
    }

    fn dir_entry(&self, inode: Inode, index: usize) -> Result<Option<DirEntry>> {
        let entries = self.dir_entries(inode)?;
        let Some((name, &child)) = entries.iter().nth(index) else {
            return Ok(None);
        };
        let stat = self.stat(child)?;
        Ok(Some(DirEntry {
            inode: child,
            kind: stat.kind,
            perms: stat.perms,
            name: name.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read() {
        let mut fs = RamFs::new();
        let etc = fs.create(fs.root(), "etc", NodeKind::Directory).unwrap();
        let motd = fs.create(etc, "motd", NodeKind::File).unwrap();
        fs.write(motd, 0, b"welcome\n").unwrap();

        assert_eq!(fs.lookup(etc, "motd").unwrap(), motd);
        let mut buf = [0u8; 32];
        let n = fs.read(motd, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"welcome\n");
        assert_eq!(fs.read(motd, 8, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let mut fs = RamFs::new();
        let f = fs.create(fs.root(), "f", NodeKind::File).unwrap();
        fs.write(f, 4, b"xy").unwrap();
        let mut buf = [0xffu8; 6];
        fs.read(f, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0\0\0xy");
    }

    #[test]
    fn duplicate_create_rejected() {
        let mut fs = RamFs::new();
        fs.create(fs.root(), "a", NodeKind::File).unwrap();
        assert_eq!(
            fs.create(fs.root(), "a", NodeKind::File).unwrap_err().cause,
            Cause::State
        );
    }

    #[test]
    fn unlink_refuses_nonempty_dir() {
        let mut fs = RamFs::new();
        let d = fs.create(fs.root(), "d", NodeKind::Directory).unwrap();
        fs.create(d, "inner", NodeKind::File).unwrap();
        assert_eq!(
            fs.unlink(fs.root(), "d").unwrap_err().cause,
            Cause::State
        );
        fs.unlink(d, "inner").unwrap();
        fs.unlink(fs.root(), "d").unwrap();
        assert_eq!(fs.lookup(fs.root(), "d").unwrap_err().cause, Cause::NotFound);
    }

    #[test]
    fn populate_builds_paths() {
        let mut fs = RamFs::new();
        fs.populate("/etc/motd", b"hi").unwrap();
        fs.populate("/sbin/init", b"\x7fELF").unwrap();
        let etc = fs.lookup(fs.root(), "etc").unwrap();
        let motd = fs.lookup(etc, "motd").unwrap();
        assert_eq!(fs.stat(motd).unwrap().size, 2);
    }

    #[test]
    fn dir_entries_enumerate_in_order() {
        let mut fs = RamFs::new();
        fs.create(fs.root(), "b", NodeKind::File).unwrap();
        fs.create(fs.root(), "a", NodeKind::Directory).unwrap();
        let first = fs.dir_entry(fs.root(), 0).unwrap().unwrap();
        let second = fs.dir_entry(fs.root(), 1).unwrap().unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(first.kind, NodeKind::Directory);
        assert_eq!(second.name, "b");
        assert!(fs.dir_entry(fs.root(), 2).unwrap().is_none());
    }
}
