use std::path::{Path, PathBuf};
use url::Url;

pub fn get_filename_from_url(url_str: &str) -> String {
    if let Ok(url) = Url::parse(url_str) {
        if let Some(filename) = url.path_segments().and_then(|s| s.last()) {
            if !filename.is_empty() {
                return filename.to_string();
            }
        }
    }

    // Fallback if no filename found in path
    format!("download_{}", uuid::Uuid::new_v4())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// `dir/name`, or `dir/stem_N.ext` for the first N that does not exist yet.
pub fn get_unique_filepath(dir: &Path, filename: &str) -> PathBuf {
    let original = dir.join(filename);
    if !original.exists() {
        return original;
    }

    let file_stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let extension = original
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let new_filename = if extension.is_empty() {
            format!("{}_{}", file_stem, counter)
        } else {
            format!("{}_{}.{}", file_stem, counter, extension)
        };
        let path = dir.join(new_filename);
        if !path.exists() {
            return path;
        }
        counter += 1;
    }
}
