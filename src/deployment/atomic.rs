use std::io::Write;
use std::path::Path;

/// Replace `path` with `contents` so readers see either the old file or the
/// new one, never a mix: write a temp file beside it, fsync, rename over.
pub fn replace_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    replace_atomically_with(path, contents, |_| Ok(()))
}

/// Same as `replace_atomically`, with a hook run after the temp file is
/// durable and before the rename. A hook error aborts the swap.
pub(crate) fn replace_atomically_with<F>(
    path: &Path,
    contents: &[u8],
    before_persist: F,
) -> std::io::Result<()>
where
    F: FnOnce(&Path) -> std::io::Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    // Dropping the temp file on any early return removes it
    let mut tmp = tempfile::Builder::new()
        .prefix(".swap-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    before_persist(tmp.path())?;

    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), "directory fsync failed: {}", e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
