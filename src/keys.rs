//! Purpose: Derive record keys from file paths and map keys back to extraction paths.
//! Exports: `KeyPrefix`, `derive_key`, `extraction_path`.
//! Role: Single source of the key naming rules shared by pack and unpack.
//! Invariants: A key is `prefix + basename`; the directory part of the source path never leaks in.
//! Invariants: Non-empty prefixes always end with `/`.
//! Invariants: Extraction never resolves outside the destination directory.

use std::path::{Component, Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

pub const KEY_SEPARATOR: char = '/';

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    pub fn new(raw: impl Into<String>) -> Self {
        let mut prefix = raw.into();
        if !prefix.is_empty() && !prefix.ends_with(KEY_SEPARATOR) {
            prefix.push(KEY_SEPARATOR);
        }
        Self(prefix)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn derive_key(prefix: &KeyPrefix, path: &Path) -> Result<String, Error> {
    let name = path.file_name().ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("path has no file name")
            .with_path(path)
    })?;
    let name = name.to_str().ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("file name is not valid UTF-8")
            .with_path(path)
    })?;
    Ok(format!("{}{name}", prefix.as_str()))
}

/// Resolves `key` as a relative path under `dest`, rejecting absolute keys and `..`.
pub fn extraction_path(dest: &Path, key: &str) -> Result<PathBuf, Error> {
    let relative = Path::new(key);
    let mut out = dest.to_path_buf();
    let mut has_name = false;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                has_name = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("record key escapes the destination directory")
                    .with_key(key));
            }
        }
    }
    if !has_name {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("record key does not name a file")
            .with_key(key));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{KeyPrefix, derive_key, extraction_path};
    use crate::core::error::ErrorKind;
    use std::path::{Path, PathBuf};

    #[test]
    fn prefix_gets_trailing_separator() {
        assert_eq!(KeyPrefix::new("docs").as_str(), "docs/");
        assert_eq!(KeyPrefix::new("docs/").as_str(), "docs/");
        assert_eq!(KeyPrefix::new("a/b").as_str(), "a/b/");
        assert!(KeyPrefix::new("").is_empty());
    }

    #[test]
    fn key_uses_basename_only() {
        let prefix = KeyPrefix::new("docs");
        let a = derive_key(&prefix, Path::new("/var/tmp/a.txt")).expect("key");
        let b = derive_key(&prefix, Path::new("relative/dir/a.txt")).expect("key");
        let c = derive_key(&prefix, Path::new("a.txt")).expect("key");
        assert_eq!(a, "docs/a.txt");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn empty_prefix_gives_flat_keys() {
        let key = derive_key(&KeyPrefix::empty(), Path::new("x/y/report.pdf")).expect("key");
        assert_eq!(key, "report.pdf");
    }

    #[test]
    fn path_without_file_name_is_rejected() {
        let err = derive_key(&KeyPrefix::empty(), Path::new("/")).expect_err("no name");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn extraction_path_stays_under_dest() {
        let dest = Path::new("/out");
        assert_eq!(
            extraction_path(dest, "docs/a.txt").expect("path"),
            PathBuf::from("/out/docs/a.txt")
        );
        assert_eq!(
            extraction_path(dest, "./b.txt").expect("path"),
            PathBuf::from("/out/b.txt")
        );
    }

    #[test]
    fn extraction_path_rejects_escapes() {
        let dest = Path::new("/out");
        for key in ["/etc/passwd", "../up.txt", "docs/../../x", "."] {
            let err = extraction_path(dest, key).expect_err(key);
            assert_eq!(err.kind(), ErrorKind::Usage);
            assert_eq!(err.key(), Some(key));
        }
    }
}
