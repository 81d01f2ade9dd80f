//! The FUSE operations of [SlothFs].

use std::ffi::CStr;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, GetxattrReply, ListxattrReply, OpenOptions,
    SetattrValid, ZeroCopyReader, ZeroCopyWriter,
};
use tracing::{debug, warn};

use super::inode_tracker::ROOT_ID;
use super::multifs::SlothFs;
use super::nodes::{FileNode, InodeData};
use super::{CONTENT_TTL, ROOT_TTL};

const XATTR_NAME_GITSHA1: &[u8] = b"user.gitsha1";

impl SlothFs {
    fn ttl_for(&self, parent: u64) -> Duration {
        // Workspaces come and go under the root and under config/; their
        // dentries must not be cached. Content below a workspace is pinned.
        if parent == ROOT_ID || parent == self.config_ino {
            ROOT_TTL
        } else {
            CONTENT_TTL
        }
    }

    fn entry_for(&self, ino: u64, data: &InodeData, ttl: Duration) -> Entry {
        Entry {
            inode: ino,
            generation: 0,
            attr: data.attr(ino).into(),
            attr_flags: 0,
            attr_timeout: ttl,
            entry_timeout: ttl,
        }
    }

    /// The blob node behind an inode, if it is one.
    fn file_node(&self, inode: u64) -> Option<Arc<FileNode>> {
        match self.inodes.read().get(inode) {
            Some(InodeData::Regular(node)) => Some(node.clone()),
            _ => None,
        }
    }

    fn open_blob_file(&self, node: &Arc<FileNode>) -> io::Result<std::fs::File> {
        self.tokio_handle
            .block_on(node.fetcher.open_blob(&node.id, node.clone))
            .map_err(|e| {
                warn!(blob.id = %node.id, error = %e, "blob fetch failed");
                io::Error::from_raw_os_error(e.as_raw_os_error())
            })
    }
}

impl FileSystem for SlothFs {
    type Inode = u64;
    type Handle = u64;

    fn init(&self, capable: FsOptions) -> io::Result<FsOptions> {
        let mut enabled = FsOptions::empty();
        // With zero-message opens the kernel reads without a file handle and
        // we serve each read with a short-lived open against the store.
        if capable.contains(FsOptions::ZERO_MESSAGE_OPEN) {
            enabled |= FsOptions::ZERO_MESSAGE_OPEN;
            self.handle_less.store(true, Ordering::SeqCst);
        }
        Ok(enabled)
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let name = name
            .to_str()
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))?;

        let tracker = self.inodes.read();
        let ino = tracker
            .child(parent, name)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let data = tracker.get(ino).expect("child inode must exist");

        Ok(self.entry_for(ino, data, self.ttl_for(parent)))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let ttl = if inode == ROOT_ID || inode == self.config_ino {
            ROOT_TTL
        } else {
            CONTENT_TTL
        };
        match self.inodes.read().get(inode) {
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
            Some(data) => Ok((data.attr(inode).into(), ttl)),
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn setattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        attr: stat64,
        _handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        let node = self
            .file_node(inode)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOSYS))?;

        // Only the timestamp is writable.
        if valid.intersects(
            SetattrValid::MODE
                | SetattrValid::UID
                | SetattrValid::GID
                | SetattrValid::SIZE
                | SetattrValid::CTIME,
        ) {
            return Err(io::Error::from_raw_os_error(libc::ENOTSUP));
        }

        if valid.contains(SetattrValid::MTIME_NOW) {
            node.set_mtime(SystemTime::now());
        } else if valid.contains(SetattrValid::MTIME) {
            let mtime = UNIX_EPOCH
                + Duration::new(attr.st_mtime.max(0) as u64, attr.st_mtime_nsec as u32);
            node.set_mtime(mtime);
        }

        Ok((node.attr(inode).into(), CONTENT_TTL))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        match self.inodes.read().get(inode) {
            Some(InodeData::Symlink(target)) => Ok(target.to_vec()),
            Some(InodeData::Regular(node)) => match &node.link_target {
                Some(target) => Ok(target.to_vec()),
                None => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            },
            Some(_) => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    /// Creating a symlink inside `config/` mounts a workspace: the link
    /// target names a manifest file, the link name becomes the workspace.
    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn symlink(
        &self,
        _ctx: &Context,
        linkname: &CStr,
        parent: Self::Inode,
        name: &CStr,
    ) -> io::Result<Entry> {
        if parent != self.config_ino {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let name = name
            .to_str()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let target = linkname
            .to_str()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        self.tokio_handle
            .block_on(self.create_workspace_from_file(name, std::path::Path::new(target)))
            .map_err(|e| {
                warn!(workspace = %name, error = %e, "workspace creation failed");
                io::Error::from_raw_os_error(e.as_raw_os_error())
            })?;

        let tracker = self.inodes.read();
        let ino = tracker
            .child(self.config_ino, name)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;
        let data = tracker.get(ino).expect("config entry must exist");
        Ok(self.entry_for(ino, data, ROOT_TTL))
    }

    /// Unlinking `config/<ws>` detaches the workspace.
    #[tracing::instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn unlink(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        if parent != self.config_ino {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        let name = name
            .to_str()
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))?;

        self.destroy_workspace(name)
            .map_err(|e| io::Error::from_raw_os_error(e.as_raw_os_error()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        if self.handle_less.load(Ordering::SeqCst) {
            // ENOSYS makes the kernel use handle-less I/O from here on.
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }

        let data_kind = {
            let tracker = self.inodes.read();
            match tracker.get(inode) {
                None => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
                Some(InodeData::Dir(_)) | Some(InodeData::Symlink(_)) => {
                    return Err(io::Error::from_raw_os_error(libc::EISDIR))
                }
                Some(InodeData::Mem(_)) => None,
                Some(InodeData::Regular(node)) => Some(node.clone()),
            }
        };

        match data_kind {
            // In-memory files are served straight from the inode table.
            None => Ok((None, OpenOptions::KEEP_CACHE)),
            Some(node) => {
                let file = self.open_blob_file(&node)?;

                let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
                self.file_handles.write().insert(fh, Arc::new(file));

                // The revision is pinned, so the kernel may keep the page
                // cache across opens.
                Ok((Some(fh), OpenOptions::KEEP_CACHE))
            }
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.handle = handle))]
    fn release(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        self.file_handles.write().remove(&handle);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        debug!("read");

        let node = {
            let tracker = self.inodes.read();
            match tracker.get(inode) {
                None => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
                Some(InodeData::Mem(data)) => {
                    let start = (offset as usize).min(data.len());
                    let end = (start + size as usize).min(data.len());
                    let mut cursor = io::Cursor::new(&data[start..end]);
                    return Ok(io::copy(&mut cursor, w)? as usize);
                }
                Some(InodeData::Regular(node)) => node.clone(),
                Some(_) => return Err(io::Error::from_raw_os_error(libc::EISDIR)),
            }
        };

        // Reuse the handle's descriptor; with handle-less I/O each read does
        // a short-lived open-read-close against the store.
        let file = match self.file_handles.read().get(&handle) {
            Some(f) => f.clone(),
            None => Arc::new(self.open_blob_file(&node)?),
        };

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        let buf_len = buf.len();
        let written = io::copy(&mut io::Cursor::new(buf), w)?;
        if written != buf_len as u64 {
            warn!(written, buf_len, "unable to write all of buf to kernel");
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(written as usize)
    }

    fn write(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _handle: Self::Handle,
        _r: &mut dyn ZeroCopyReader,
        _size: u32,
        _offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EROFS))
    }

    fn opendir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        match self.inodes.read().get(inode) {
            Some(InodeData::Dir(_)) => Ok((None, OpenOptions::empty())),
            Some(_) => Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let tracker = self.inodes.read();
        let entries = tracker
            .dir_entries(inode)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTDIR))?;

        for (i, (name, ino)) in entries.into_iter().enumerate().skip(offset as usize) {
            let Some(data) = tracker.get(ino) else {
                continue;
            };
            let written = add_entry(DirEntry {
                ino,
                offset: i as u64 + 1,
                type_: data.as_fuse_type(),
                name: name.as_bytes(),
            })?;
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdirplus(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry, Entry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let ttl = self.ttl_for(inode);
        let tracker = self.inodes.read();
        let entries = tracker
            .dir_entries(inode)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTDIR))?;

        for (i, (name, ino)) in entries.into_iter().enumerate().skip(offset as usize) {
            let Some(data) = tracker.get(ino) else {
                continue;
            };
            let written = add_entry(
                DirEntry {
                    ino,
                    offset: i as u64 + 1,
                    type_: data.as_fuse_type(),
                    name: name.as_bytes(),
                },
                self.entry_for(ino, data, ttl),
            )?;
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    fn releasedir(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
        _handle: Self::Handle,
    ) -> io::Result<()> {
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, name = ?name))]
    fn getxattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        name: &CStr,
        size: u32,
    ) -> io::Result<GetxattrReply> {
        let node = self
            .file_node(inode)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODATA))?;
        if name.to_bytes() != XATTR_NAME_GITSHA1 {
            return Err(io::Error::from_raw_os_error(libc::ENODATA));
        }

        let hex = node.id.hex();
        if size == 0 {
            Ok(GetxattrReply::Count(hex.len() as u32))
        } else if size < hex.len() as u32 {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        } else {
            Ok(GetxattrReply::Value(hex.into_bytes()))
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn listxattr(&self, _ctx: &Context, inode: Self::Inode, size: u32) -> io::Result<ListxattrReply> {
        let mut names = Vec::new();
        if self.file_node(inode).is_some() {
            names.extend_from_slice(XATTR_NAME_GITSHA1);
            names.push(0);
        }

        if size == 0 {
            Ok(ListxattrReply::Count(names.len() as u32))
        } else if size < names.len() as u32 {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        } else {
            Ok(ListxattrReply::Names(names))
        }
    }
}
