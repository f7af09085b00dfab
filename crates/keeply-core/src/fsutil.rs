//! Small filesystem helpers shared by the crypto envelope and the blob vault:
//! write-to-temp, fsync, atomic rename.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{KeeplyError, Result};

/// Writes `bytes` to a `.tmp` sibling of `dest`, fsyncs it, then renames it
/// over `dest`. The rename is the durability/atomicity boundary: readers
/// never observe a partially written file.
pub fn atomic_write(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| KeeplyError::io(parent, e))?;
    }
    let tmp = tmp_path_for(dest);
    {
        let mut f = File::create(&tmp).map_err(|e| KeeplyError::io(&tmp, e))?;
        f.write_all(bytes).map_err(|e| KeeplyError::io(&tmp, e))?;
        f.sync_all().map_err(|e| KeeplyError::io(&tmp, e))?;
    }
    fs::rename(&tmp, dest).map_err(|e| KeeplyError::io(dest, e))?;
    Ok(())
}

/// Deletes a temp sibling left over from an aborted `atomic_write`, best
/// effort. Used by cancellation paths that must leave no orphaned `.tmp`
/// files.
pub fn remove_tmp_best_effort(dest: &Path) {
    let _ = fs::remove_file(tmp_path_for(dest));
}

fn tmp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
