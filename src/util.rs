use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = tmp_path_next_to(path);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

pub fn write_string_atomic(path: &Path, content: &str) -> io::Result<()> {
    write_bytes_atomic(path, content.as_bytes())
}

#[cfg(unix)]
pub fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn chmod(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

pub fn tmp_path_next_to(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("tmp"));
    parent.join(format!(
        ".{}.tmp.{}",
        file.to_string_lossy(),
        std::process::id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/config.json");

        write_string_atomic(&path, "{}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        assert!(!tmp_path_next_to(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn chmod_controls_executable_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent");
        fs::write(&path, b"#!/bin/sh\n").unwrap();

        chmod(&path, 0o644).unwrap();
        assert!(!is_executable(&path));
        chmod(&path, 0o755).unwrap();
        assert!(is_executable(&path));
    }
}
