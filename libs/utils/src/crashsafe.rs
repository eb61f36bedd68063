use std::{
    borrow::Cow,
    ffi::OsStr,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(original_path: impl AsRef<Path>, suffix: &str) -> PathBuf {
    let new_extension = match original_path
        .as_ref()
        .extension()
        .map(OsStr::to_string_lossy)
    {
        Some(extension) => Cow::Owned(format!("{extension}.{suffix}")),
        None => Cow::Borrowed(suffix),
    };
    original_path
        .as_ref()
        .with_extension(new_extension.as_ref())
}

pub fn fsync(path: impl AsRef<Path>) -> io::Result<()> {
    File::open(path.as_ref())?.sync_all()
}

pub fn fsync_file_and_parent(file_path: &Path) -> io::Result<()> {
    let parent = file_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("file {} has no parent", file_path.display()),
        )
    })?;

    fsync(file_path)?;
    fsync(parent)?;
    Ok(())
}

/// Rename `old_path` to `new_path`, making the result survive a crash when
/// `do_fsync` is set: the source file is fsynced before the rename and the
/// target and its directory after it.
pub fn durable_rename(
    old_path: impl AsRef<Path>,
    new_path: impl AsRef<Path>,
    do_fsync: bool,
) -> io::Result<()> {
    if do_fsync {
        // The source may be opened read-only; sync_all works on any handle.
        fsync(old_path.as_ref())?;
    }

    fs::rename(old_path.as_ref(), new_path.as_ref())?;

    if do_fsync {
        fsync_file_and_parent(new_path.as_ref())?;
    }
    Ok(())
}

/// Replace the contents of `path` with `content`: write a `.tmp` sibling,
/// fsync it and durably rename it over the target.
pub fn overwrite_durably(path: impl AsRef<Path>, content: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let tmp_path = path_with_suffix_extension(path, "tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    durable_rename(&tmp_path, path, true)
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all
/// newly created directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Path>) -> io::Result<()> {
    let mut path = path.as_ref();

    let mut dirs_to_create = Vec::new();

    // Figure out which directories we need to create.
    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("non-directory found in path: {}", path.display()),
                ))
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => path = Path::new("."),
            Some(parent) => path = parent,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("can't find parent of path '{}'", path.display()),
                ))
            }
        }
    }

    // Create directories from parent to child.
    for &path in dirs_to_create.iter().rev() {
        fs::create_dir(path)?;
    }

    // Fsync the created directories from child to parent.
    for &path in dirs_to_create.iter() {
        fsync(path)?;
    }

    // If we created any new directories, fsync the parent.
    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use camino_tempfile::tempdir;

    use super::*;

    #[test]
    fn test_path_with_suffix_extension() {
        let p = PathBuf::from("/foo/bar");
        assert_eq!(
            &path_with_suffix_extension(&p, "partial").to_string_lossy(),
            "/foo/bar.partial"
        );
        let p = PathBuf::from("/foo/bar.baz");
        assert_eq!(
            &path_with_suffix_extension(&p, "tmp").to_string_lossy(),
            "/foo/bar.baz.tmp"
        );
        let p = PathBuf::from("/foo/bar/dir/");
        assert_eq!(
            &path_with_suffix_extension(&p, ".temp").to_string_lossy(),
            "/foo/bar/dir..temp"
        );
    }

    #[test]
    fn test_create_dir_all_fsyncd() {
        let dir = tempdir().unwrap();

        let existing_dir_path = dir.path();
        create_dir_all(existing_dir_path).unwrap();

        let nested_child_dir = existing_dir_path.join("child1").join("child2");
        assert!(!nested_child_dir.exists());
        create_dir_all(&nested_child_dir).unwrap();
        assert!(nested_child_dir.exists());

        let file_path = existing_dir_path.join("file");
        std::fs::write(&file_path, b"").unwrap();

        let err = create_dir_all(&file_path).unwrap_err();
        assert!(
            err.to_string().contains("non-directory found in path"),
            "Unexpected error message: {err}"
        );
    }

    #[test]
    fn test_durable_rename_and_overwrite() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("state.partial");
        let dst = dir.path().join("state");
        std::fs::write(&src, b"one").unwrap();

        durable_rename(&src, &dst, true).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"one");

        overwrite_durably(&dst, b"two").unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"two");
        assert!(!dir.path().join("state.tmp").exists());
    }
}
