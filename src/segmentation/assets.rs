use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Where a segmentation model comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A model file already on disk
    File(PathBuf),
    /// A remote asset, cached under its version key after the first fetch
    Remote { url: String, version: String },
}

/// Version-keyed on-disk cache for remote model assets
///
/// Layout: `<root>/<version>/<file name>`.
#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
}

impl ModelCache {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Cache under the platform cache directory, falling back to the
    /// working directory when none is known.
    pub fn default_location() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("camola").join("models"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a remote asset occupies once cached.
    pub fn cached_path(&self, url: &str, version: &str) -> Result<PathBuf> {
        if version.is_empty()
            || version == "."
            || version == ".."
            || version.contains(['/', '\\'])
        {
            bail!("invalid model version key {:?}", version);
        }
        let file_name = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .with_context(|| format!("model URL {} has no file name", url))?;
        Ok(self.root.join(version).join(file_name))
    }

    /// Resolve a source to a local model file, fetching it if needed.
    pub fn resolve(&self, source: &ModelSource) -> Result<PathBuf> {
        match source {
            ModelSource::File(path) => {
                if !path.is_file() {
                    bail!("model file {} not found", path.display());
                }
                Ok(path.clone())
            }
            ModelSource::Remote { url, version } => {
                let path = self.cached_path(url, version)?;
                if path.is_file() {
                    tracing::debug!("Using cached model {}", path.display());
                    return Ok(path);
                }
                fetch(url, &path)?;
                Ok(path)
            }
        }
    }
}

/// Download `url` to `path` through a temporary sibling file.
fn fetch(url: &str, path: &Path) -> Result<()> {
    let _span = tracing::debug_span!("fetch_model").entered();
    tracing::info!("Fetching segmentation model from {}", url);

    let dir = path
        .parent()
        .with_context(|| format!("cache path {} has no parent", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create model cache at {}", dir.display()))?;

    let response = ureq::get(url)
        .call()
        .with_context(|| format!("Failed to fetch model from {}", url))?;

    let partial = path.with_extension("part");
    let mut file = File::create(&partial)
        .with_context(|| format!("Failed to create {}", partial.display()))?;
    let bytes = io::copy(&mut response.into_reader(), &mut file)
        .with_context(|| format!("Failed to download model from {}", url))?;
    file.sync_all()?;
    drop(file);

    fs::rename(&partial, path)
        .with_context(|| format!("Failed to move model into {}", path.display()))?;
    tracing::info!("Cached {} bytes at {}", bytes, path.display());
    Ok(())
}
