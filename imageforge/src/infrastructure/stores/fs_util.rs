// /////////////////////////////////////////////////////////////////////////////
// Imageforge
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Store Filesystem Helpers
//!
//! Synchronous tree operations shared by the object store and the source
//! cache: recursive copy, freeze (read-only + fsync + best-effort
//! immutable attribute), thaw, and removal that clears immutability first.
//! Callers run these under `spawn_blocking`; nothing here is async.
//!
//! Freezing marks every file read-only and, where the filesystem and
//! privileges permit, sets the kernel immutable attribute so even
//! root-owned module processes cannot scribble on committed trees. The
//! attribute is best-effort: tmpfs and unprivileged runs fall back to
//! plain permission bits.

use std::fs;
use std::io;
use std::path::Path;

/// Recursively copies `src` into `dst`, preserving permissions, symlinks,
/// and file modification times.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let meta = entry.path().symlink_metadata()?;
        let target = dst.join(entry.file_name());
        if meta.file_type().is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
        } else if meta.is_dir() {
            copy_tree(&entry.path(), &target)?;
            fs::set_permissions(&target, meta.permissions())?;
        } else {
            fs::copy(entry.path(), &target)?;
            if let Ok(modified) = meta.modified() {
                if let Ok(file) = fs::File::options().write(true).open(&target) {
                    file.set_modified(modified).ok();
                }
            }
        }
    }
    Ok(())
}

/// Freezes a tree: fsync every file, drop write bits everywhere, and set
/// the immutable attribute where permitted. Directories are processed
/// children-first so the walk never locks itself out.
pub fn freeze_tree(root: &Path) -> io::Result<()> {
    let meta = root.symlink_metadata()?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in fs::read_dir(root)? {
            freeze_tree(&entry?.path())?;
        }
        set_readonly(root, &meta)?;
        if let Ok(dir) = fs::File::open(root) {
            dir.sync_all().ok();
        }
    } else {
        if let Ok(file) = fs::File::open(root) {
            file.sync_all()?;
            immutable::set(&file, true);
        }
        set_readonly(root, &meta)?;
    }
    Ok(())
}

/// Reverses [`freeze_tree`] far enough that the tree can be removed.
pub fn thaw_tree(root: &Path) -> io::Result<()> {
    let meta = root.symlink_metadata()?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if let Ok(file) = fs::File::open(root) {
        immutable::set(&file, false);
    }
    let mut perms = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o700);
    }
    fs::set_permissions(root, perms)?;
    if meta.is_dir() {
        for entry in fs::read_dir(root)? {
            thaw_tree(&entry?.path())?;
        }
    }
    Ok(())
}

/// Removes a tree that may be frozen or carry immutable attributes.
pub fn remove_tree(root: &Path) -> io::Result<()> {
    if !root.exists() && root.symlink_metadata().is_err() {
        return Ok(());
    }
    thaw_tree(root).ok();
    if root.symlink_metadata()?.is_dir() {
        fs::remove_dir_all(root)
    } else {
        fs::remove_file(root)
    }
}

fn set_readonly(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
    let mut perms = meta.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() & !0o222);
    }
    #[cfg(not(unix))]
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

/// Kernel immutable-attribute plumbing (`FS_IOC_SETFLAGS`).
#[cfg(target_os = "linux")]
mod immutable {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
    const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;
    const FS_IMMUTABLE_FL: libc::c_long = 0x0000_0010;

    /// Best-effort toggle; silently ignored when the filesystem or the
    /// caller's privileges do not support it.
    pub fn set(file: &File, on: bool) {
        let fd = file.as_raw_fd();
        let mut flags: libc::c_long = 0;
        // SAFETY: fd is owned by `file` and the flag word outlives the call.
        unsafe {
            if libc::ioctl(fd, FS_IOC_GETFLAGS as _, &mut flags) != 0 {
                return;
            }
            let wanted = if on {
                flags | FS_IMMUTABLE_FL
            } else {
                flags & !FS_IMMUTABLE_FL
            };
            if wanted != flags {
                libc::ioctl(fd, FS_IOC_SETFLAGS as _, &wanted);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod immutable {
    use std::fs::File;

    pub fn set(_file: &File, _on: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_copy_tree_preserves_content_and_links() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("usr/bin")).unwrap();
        fs::write(src.path().join("usr/bin/sh"), b"#!elf").unwrap();
        std::os::unix::fs::symlink("bin/sh", src.path().join("usr/sh")).unwrap();

        let target = dst.path().join("tree");
        copy_tree(src.path(), &target).unwrap();

        assert_eq!(fs::read(target.join("usr/bin/sh")).unwrap(), b"#!elf");
        let link = fs::read_link(target.join("usr/sh")).unwrap();
        assert_eq!(link, std::path::PathBuf::from("bin/sh"));
    }

    #[test]
    fn test_freeze_drops_write_bits() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a");
        fs::write(&file, b"x").unwrap();

        freeze_tree(dir.path()).unwrap();
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0, "no write bits after freeze");
        assert!(fs::write(&file, b"y").is_err(), "writes must fail");

        // Thaw so the tempdir can clean itself up.
        thaw_tree(dir.path()).unwrap();
    }

    #[test]
    fn test_remove_tree_handles_frozen_trees() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("obj");
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("nested/file"), b"x").unwrap();
        freeze_tree(&root).unwrap();

        remove_tree(&root).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_remove_tree_on_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_tree(&dir.path().join("nothing")).unwrap();
    }
}
