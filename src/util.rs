use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const RAW_EXTENSION: &str = "dax";
pub const TIFF_EXTENSION: &str = "tif";

/// Files under `dir` whose extension matches `ext` (case-insensitive), sorted.
pub fn list_by_extension(dir: &Path, ext: &str, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut walker = WalkDir::new(dir).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }
    let mut v = vec![];
    for entry in walker {
        let e = entry.with_context(|| format!("walk {:?}", dir))?;
        if !e.file_type().is_file() {
            continue;
        }
        let p = e.path();
        if let Some(found) = p.extension() {
            if found.to_string_lossy().eq_ignore_ascii_case(ext) {
                v.push(p.to_path_buf());
            }
        }
    }
    v.sort();
    Ok(v)
}

/// Where the TIFF for `raw` goes: next to it, or in `out_dir` keeping the
/// path relative to `input_root`.
pub fn tiff_output_path(raw: &Path, input_root: &Path, out_dir: Option<&Path>) -> PathBuf {
    let target = match out_dir {
        Some(out) => out.join(raw.strip_prefix(input_root).unwrap_or(raw)),
        None => raw.to_path_buf(),
    };
    target.with_extension(TIFF_EXTENSION)
}
