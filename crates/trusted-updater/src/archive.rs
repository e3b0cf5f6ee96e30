use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ApplyError;

/// Targets with a `.zip` extension are unpacked into the install tree instead
/// of being copied verbatim.
pub(crate) fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// Extract `zip_path` under `dest`, skipping entries whose relative path
/// `protected` returns true for. Returns the relative paths of the files written.
pub(crate) fn extract_zip(
    zip_path: &Path,
    dest: &Path,
    protected: &dyn Fn(&Path) -> bool,
) -> Result<Vec<PathBuf>, ApplyError> {
    let file = std::fs::File::open(zip_path)
        .map_err(|err| ApplyError::io("open archive", zip_path, err))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| ApplyError::Archive {
        path: zip_path.to_path_buf(),
        source,
    })?;

    let mut written = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|source| ApplyError::Archive {
            path: zip_path.to_path_buf(),
            source,
        })?;
        let Some(name) = entry.enclosed_name() else {
            warn!(archive = %zip_path.display(), "skipping archive entry with unsafe path");
            continue;
        };
        let name = name.to_path_buf();
        if protected(name.as_path()) {
            debug!(entry = %name.display(), "archive entry is excluded, keeping existing content");
            continue;
        }
        let out_path = dest.join(&name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|err| ApplyError::io("create extracted directory", &out_path, err))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| ApplyError::io("create extracted directory", parent, err))?;
        }
        let mut outfile = std::fs::File::create(&out_path)
            .map_err(|err| ApplyError::io("create extracted file", &out_path, err))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|err| ApplyError::io("extract archive entry", &out_path, err))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }
        written.push(name);
    }

    Ok(written)
}
