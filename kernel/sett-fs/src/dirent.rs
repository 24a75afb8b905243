//! On-wire directory entry format.
//!
//! `FS_GETDENTS` returns a packed stream of entries:
//!
//! ```text
//! { inode: u64, is_dir: u8, is_symlink: u8, perms: u16, name_len: u32, name: u8[name_len] }
//! ```
//!
//! Little-endian, no padding: 16 header bytes plus the name.

use alloc::string::String;

use crate::NodeKind;

/// Fixed part of an encoded entry.
pub const DIRENT_HEADER_LEN: usize = 16;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Node number within the filesystem.
    pub inode: u64,
    /// Node kind.
    pub kind: NodeKind,
    /// Permission bits.
    pub perms: u16,
    /// Entry name.
    pub name: String,
}

impl DirEntry {
    /// Encoded size of this entry.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        DIRENT_HEADER_LEN + self.name.len()
    }

    /// Encodes the entry at the start of `buf`, returning the encoded
    /// length, or `None` when it does not fit.
    #[must_use]
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let total = self.encoded_len();
        if buf.len() < total {
            return None;
        }
        buf[0..8].copy_from_slice(&self.inode.to_le_bytes());
        buf[8] = u8::from(self.kind == NodeKind::Directory);
        buf[9] = u8::from(self.kind == NodeKind::Symlink);
        buf[10..12].copy_from_slice(&self.perms.to_le_bytes());
        let name_len = u32::try_from(self.name.len()).ok()?;
        buf[12..16].copy_from_slice(&name_len.to_le_bytes());
        buf[16..total].copy_from_slice(self.name.as_bytes());
        Some(total)
    }

    /// Decodes one entry from the start of `buf`, returning it and its
    /// encoded length. Used by tests and in-kernel consumers.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < DIRENT_HEADER_LEN {
            return None;
        }
        let inode = u64::from_le_bytes(buf[0..8].try_into().ok()?);
        let kind = match (buf[8], buf[9]) {
            (0, 0) => NodeKind::File,
            (_, 0) => NodeKind::Directory,
            _ => NodeKind::Symlink,
        };
        let perms = u16::from_le_bytes(buf[10..12].try_into().ok()?);
        let name_len = u32::from_le_bytes(buf[12..16].try_into().ok()?) as usize;
        let total = DIRENT_HEADER_LEN + name_len;
        if buf.len() < total {
            return None;
        }
        let name = core::str::from_utf8(&buf[16..total]).ok()?.into();
        Some((
            Self {
                inode,
                kind,
                perms,
                name,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn layout_is_packed_little_endian() {
        let entry = DirEntry {
            inode: 0x1122_3344_5566_7788,
            kind: NodeKind::Directory,
            perms: 0o755,
            name: "bin".to_string(),
        };
        let mut buf = [0u8; 64];
        let n = entry.encode(&mut buf).unwrap();
        assert_eq!(n, 19);
        assert_eq!(&buf[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(buf[8], 1);
        assert_eq!(buf[9], 0);
        assert_eq!(&buf[12..16], &3u32.to_le_bytes());
        assert_eq!(&buf[16..19], b"bin");
    }

    #[test]
    fn encode_refuses_short_buffer() {
        let entry = DirEntry {
            inode: 1,
            kind: NodeKind::File,
            perms: 0,
            name: "motd".to_string(),
        };
        let mut buf = [0u8; 19];
        assert!(entry.encode(&mut buf).is_none());
    }

    #[test]
    fn decode_inverts_encode() {
        let entry = DirEntry {
            inode: 42,
            kind: NodeKind::File,
            perms: 0o644,
            name: "hello.txt".to_string(),
        };
        let mut buf = [0u8; 64];
        let n = entry.encode(&mut buf).unwrap();
        let (back, m) = DirEntry::decode(&buf).unwrap();
        assert_eq!(n, m);
        assert_eq!(back, entry);
    }
}
