//! Cached retrieval of pretrained weight archives.
//!
//! Files land in `<cache root>/<cache_subdir>/<fname>` and are fetched at
//! most once: an existing file is returned without touching the origin.
//! `file://` origins (and plain paths) are copied; `http(s)://` origins need
//! the `download` feature.

use crate::config::BackendConfig;
use crate::error::{FcnError, Result};
use std::path::{Path, PathBuf};

/// Subdirectory pretrained model archives are cached under.
pub const MODELS_SUBDIR: &str = "models";

/// Returns the local path of `fname`, fetching it from `origin` when it is
/// not cached yet.
///
/// # Errors
///
/// Returns an error if the cache directory cannot be created, the origin
/// cannot be read, or an http origin is requested without the `download`
/// feature.
pub fn get_file(
    fname: &str,
    origin: &str,
    cache_subdir: &str,
    config: &BackendConfig,
) -> Result<PathBuf> {
    let dir = config.cache_root().join(cache_subdir);
    let target = dir.join(fname);
    if target.is_file() {
        tracing::debug!(path = %target.display(), "using cached file");
        return Ok(target);
    }

    std::fs::create_dir_all(&dir).map_err(|e| FcnError::io(&dir, e))?;

    // Partial downloads never shadow a complete file
    let partial = dir.join(format!("{fname}.part"));
    if origin.starts_with("http://") || origin.starts_with("https://") {
        tracing::info!(url = origin, "downloading {fname}");
        download(origin, &partial)?;
    } else {
        let source = Path::new(origin.strip_prefix("file://").unwrap_or(origin));
        tracing::debug!(from = %source.display(), "copying {fname} into cache");
        std::fs::copy(source, &partial).map_err(|e| FcnError::io(source, e))?;
    }
    std::fs::rename(&partial, &target).map_err(|e| FcnError::io(&target, e))?;
    Ok(target)
}

#[cfg(feature = "download")]
fn download(url: &str, dest: &Path) -> Result<()> {
    let response = match ureq::get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => {
            return Err(FcnError::Download {
                url: url.to_string(),
                message: format!("HTTP {code}"),
            })
        }
        Err(e) => {
            return Err(FcnError::Download {
                url: url.to_string(),
                message: e.to_string(),
            })
        }
    };

    let mut file = std::fs::File::create(dest).map_err(|e| FcnError::io(dest, e))?;
    let mut reader = response.into_reader();
    if let Err(e) = std::io::copy(&mut reader, &mut file) {
        // Best-effort cleanup; the copy error is what gets reported
        let _ = std::fs::remove_file(dest);
        return Err(FcnError::Download {
            url: url.to_string(),
            message: e.to_string(),
        });
    }
    Ok(())
}

#[cfg(not(feature = "download"))]
fn download(_url: &str, _dest: &Path) -> Result<()> {
    Err(FcnError::MissingCapability {
        operation: "get_file",
        feature: "download",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_origin_is_copied_into_cache() {
        let src_dir = tempdir().expect("tempdir");
        let cache = tempdir().expect("tempdir");
        let source = src_dir.path().join("weights.bin");
        std::fs::write(&source, b"abc").expect("write");

        let config = BackendConfig::default().with_cache_dir(cache.path());
        let origin = format!("file://{}", source.display());
        let path = get_file("encoder.h5", &origin, MODELS_SUBDIR, &config).expect("fetch");

        assert_eq!(path, cache.path().join("models").join("encoder.h5"));
        assert_eq!(std::fs::read(&path).expect("read"), b"abc");
        assert!(!cache.path().join("models").join("encoder.h5.part").exists());
    }

    #[test]
    fn test_cached_file_is_not_refetched() {
        let cache = tempdir().expect("tempdir");
        let models = cache.path().join(MODELS_SUBDIR);
        std::fs::create_dir_all(&models).expect("mkdir");
        std::fs::write(models.join("encoder.h5"), b"cached").expect("write");

        let config = BackendConfig::default().with_cache_dir(cache.path());
        // The origin does not exist; a cache hit must not look at it
        let path = get_file("encoder.h5", "file:///does/not/exist", MODELS_SUBDIR, &config)
            .expect("cache hit");
        assert_eq!(std::fs::read(path).expect("read"), b"cached");
    }

    #[test]
    fn test_missing_origin_is_io_error() {
        let cache = tempdir().expect("tempdir");
        let config = BackendConfig::default().with_cache_dir(cache.path());
        let err = get_file("x.h5", "/does/not/exist.h5", MODELS_SUBDIR, &config)
            .expect_err("missing origin");
        assert!(matches!(err, FcnError::Io { .. }));
    }
}
