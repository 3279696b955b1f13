use serde::de::DeserializeOwned;
use std::{
    fs,
    path::{Component, Path, PathBuf},
};

pub mod error {
    use std::{io, path::PathBuf};

    pub type Result<T> = std::result::Result<T, self::Error>;

    type Msg = &'static str;

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error("{0} ({1:?}): {2}")]
        SingleIO(Msg, PathBuf, #[source] io::Error),

        #[error("{0} (from={1:?}, to={2:?}): {3}")]
        FromToIO(Msg, PathBuf, PathBuf, #[source] io::Error),

        #[error("Cannot create symlink (orig={0:?}, link={1:?}): {2}")]
        Symlink(PathBuf, PathBuf, #[source] io::Error),

        #[error("Failed to canonicalize path {0:?}: {1}")]
        CanonicalizePath(PathBuf, #[source] io::Error),

        #[error("Path {0:?} escapes its base directory")]
        EscapingPath(PathBuf),

        #[error("Cannot deserialize from TOML (src={0:?}): {1}")]
        DeserializeFromToml(PathBuf, #[source] toml::de::Error),
    }
}
pub use error::{Error, Result};

#[must_use]
pub fn mkdir_all(path: impl AsRef<Path>) -> Result<()> {
    let dir = path.as_ref();
    fs::create_dir_all(dir).map_err(|e| Error::SingleIO("Cannot create dir", dir.to_owned(), e))
}

#[must_use]
pub fn write<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    fs::write(&filepath, contents)
        .map_err(|e| Error::SingleIO("Cannot write file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn write_with_mkdir<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    if let Some(dir) = filepath.as_ref().parent() {
        self::mkdir_all(dir)?;
    }
    self::write(filepath, contents)
}

#[must_use]
pub fn read(filepath: impl AsRef<Path>) -> Result<Vec<u8>> {
    fs::read(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn read_to_string(filepath: impl AsRef<Path>) -> Result<String> {
    fs::read_to_string(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn read_toml_with_deserialize<P, T>(filepath: P) -> Result<T>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let filepath = filepath.as_ref();
    let s = self::read_to_string(filepath)?;
    toml::from_str(&s).map_err(|e| Error::DeserializeFromToml(filepath.to_owned(), e))
}

#[must_use]
pub fn copy_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    fs::copy(&from, &to).map_err(|e| {
        Error::FromToIO(
            "Cannot copy file",
            from.as_ref().to_owned(),
            to.as_ref().to_owned(),
            e,
        )
    })
}

#[must_use]
#[cfg(unix)]
pub fn symlink(orig: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let link = link.as_ref();
    if link.is_symlink() {
        fs::remove_file(link).map_err(|e| {
            Error::SingleIO(
                "Cannot create symlink: failed to remove existing symlink",
                link.to_owned(),
                e,
            )
        })?;
    }
    use std::os::unix;
    unix::fs::symlink(&orig, link)
        .map_err(|e| Error::Symlink(orig.as_ref().to_owned(), link.to_owned(), e))
}

#[must_use]
pub fn symlink_with_mkdir(orig: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    if let Some(dir) = link.as_ref().parent() {
        self::mkdir_all(dir)?;
    }
    self::symlink(orig, link)
}

/// Join `rel` onto `base`, refusing absolute paths and paths that climb out of `base`.
/// ```
/// use fsutil::join_within;
/// use std::path::Path;
///
/// assert_eq!(join_within("/tmp/box", "data/a.txt").unwrap(), Path::new("/tmp/box/data/a.txt"));
/// assert_eq!(join_within("/tmp/box", "./x/../b.txt").unwrap(), Path::new("/tmp/box/b.txt"));
/// assert!(join_within("/tmp/box", "../secret").is_err());
/// assert!(join_within("/tmp/box", "/etc/passwd").is_err());
/// assert!(join_within("/tmp/box", ".").is_err());
/// ```
pub fn join_within(base: impl AsRef<Path>, rel: impl AsRef<Path>) -> Result<PathBuf> {
    let rel = rel.as_ref();
    let normalized = self::normalize_path(rel);
    let escapes = normalized
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(Error::EscapingPath(rel.to_owned()));
    }
    Ok(base.as_ref().join(normalized))
}

pub fn canonicalize_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    path.canonicalize()
        .map_err(|e| Error::CanonicalizePath(path.to_owned(), e))
}

/// Normalize the path
/// ```
/// use fsutil::normalize_path;
/// use std::path::Path;
///
/// assert_eq!(normalize_path("./tests/.aux/././foo"), Path::new("tests/.aux/foo"));
/// assert_eq!(normalize_path("tests/.aux/../../bar/."), Path::new("bar"));
/// assert_eq!(normalize_path("../foo/../hello"), Path::new("../hello"));
/// assert_eq!(normalize_path("/"), Path::new("/"));
/// assert_eq!(normalize_path("/foo/"), Path::new("/foo"));
/// assert_eq!(normalize_path("."), Path::new("."));
/// ```
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    let components = path.as_ref().components();
    let mut stack = Vec::with_capacity(components.size_hint().1.unwrap_or(4));
    for c in components {
        match c {
            Component::CurDir => (),
            Component::ParentDir if matches!(stack.last(), Some(Component::Normal(_))) => {
                stack.pop();
            }
            _ => {
                stack.push(c);
            }
        }
    }
    if stack.is_empty() {
        stack.push(Component::CurDir);
    }
    stack.iter().collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn symlink_with_mkdir_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let orig = dir.path().join("orig.txt");
        self::write(&orig, "hello").unwrap();

        let link = dir.path().join("a/b/link.txt");
        symlink_with_mkdir(&orig, &link).unwrap();
        assert_eq!(read_to_string(&link).unwrap(), "hello");

        // replacing an existing link is fine
        symlink_with_mkdir(&orig, &link).unwrap();
        assert!(link.is_symlink());
    }

    #[test]
    fn read_toml_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        self::write(&path, "x = [").unwrap();

        let err = read_toml_with_deserialize::<_, toml::Table>(&path).unwrap_err();
        assert!(matches!(err, Error::DeserializeFromToml(p, _) if p == path));
    }

    #[test]
    fn read_missing_file_is_single_io_error() {
        let err = self::read("/nonexistent/kvalid/file.in").unwrap_err();
        assert!(matches!(err, Error::SingleIO(_, _, _)));
    }
}
