//! # ailoy-cache — local model artifact cache
//!
//! Resolves model ids to local directories, downloading what is missing
//! from the model repository. Downloads are manifest-driven, resumable at
//! byte granularity, SHA-1 verified, and interruptible with Ctrl-C.
//!
//! Layout mirrors the remote repository:
//! `<cache-root>/tvm-models/<id-escaped>/<quantization>/...`, with one
//! `manifest-<arch>-<os>-<device>.json` per compiled target.

#![deny(missing_docs)]

pub mod error;
pub mod manifest;

mod download;

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

pub use download::{DownloadOptions, DownloadProgress, ProgressFn};
pub use error::CacheError;
pub use manifest::{Manifest, ManifestFile, TargetDevice, escape_model_id, manifest_file_name,
    unescape_model_id};

/// Environment variable overriding the cache root directory.
pub const CACHE_ROOT_ENV: &str = "AILOY_CACHE_ROOT";
/// Environment variable overriding the model repository base URL.
pub const MODELS_URL_ENV: &str = "AILOY_MODELS_URL";
/// Default model repository.
pub const DEFAULT_MODELS_URL: &str = "https://models.ailoy.ai";

/// Subdirectory of the cache root holding compiled models.
const MODELS_DIR: &str = "tvm-models";

/// Resolved artifacts of a locally available model.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    /// Directory holding every manifest-listed file.
    pub model_dir: PathBuf,
    /// Absolute path of the compiled model library.
    pub lib_path: PathBuf,
    /// The manifest the artifacts were verified against.
    pub manifest: Manifest,
}

/// Summary of one cached model, from [`ModelCache::list_local_models`].
#[derive(Debug, Clone, PartialEq)]
pub struct LocalModel {
    /// The original (unescaped) model id.
    pub model_id: String,
    /// Quantization scheme of this copy.
    pub quantization: String,
    /// Device the manifest targets.
    pub device: String,
    /// Local model directory.
    pub path: PathBuf,
    /// Sum of the on-disk sizes of the manifest's files.
    pub total_bytes: u64,
}

/// Outcome of [`ModelCache::remove_model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The model directory was deleted.
    Removed,
    /// The confirmation callback declined.
    Skipped,
}

/// The model cache: root resolution, downloads, listing, removal.
#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl ModelCache {
    /// Open the cache at the resolved root, creating it if absent.
    ///
    /// Resolution order: `AILOY_CACHE_ROOT`, then the platform cache
    /// directory (`~/.cache/ailoy` and equivalents), then `/ailoy`.
    pub fn new() -> Result<Self, CacheError> {
        let root = std::env::var_os(CACHE_ROOT_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::cache_dir().map(|d| d.join("ailoy")))
            .unwrap_or_else(|| PathBuf::from("/ailoy"));
        Self::with_root(root)
    }

    /// Open the cache at an explicit root, creating it if absent.
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let base_url = std::env::var(MODELS_URL_ENV)
            .unwrap_or_else(|_| DEFAULT_MODELS_URL.to_owned());
        Ok(Self {
            root,
            base_url,
            client: reqwest::Client::new(),
        })
    }

    /// Override the model repository base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local directory for a `(model, quantization)` pair.
    pub fn model_dir(&self, model_id: &str, quantization: &str) -> PathBuf {
        self.root
            .join(MODELS_DIR)
            .join(escape_model_id(model_id))
            .join(quantization)
    }

    /// Remote URL for a path relative to the model directory.
    fn remote_url(&self, model_id: &str, quantization: &str, rel: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            MODELS_DIR,
            escape_model_id(model_id),
            quantization,
            rel
        )
    }

    /// Ensure every artifact of the model is present and verified, then
    /// return the resolved paths.
    ///
    /// Missing or corrupt files are (re)downloaded; complete files are
    /// kept, so an interrupted download resumes where it stopped.
    ///
    /// # Errors
    ///
    /// `Http` with the status and remote path on any non-2xx response;
    /// `Interrupted` on Ctrl-C; `Integrity` when a freshly downloaded
    /// file still fails verification.
    pub async fn download_model(
        &self,
        model_id: &str,
        quantization: &str,
        device: TargetDevice,
        options: &DownloadOptions,
    ) -> Result<ModelArtifacts, CacheError> {
        let model_dir = self.model_dir(model_id, quantization);
        tokio::fs::create_dir_all(&model_dir).await?;

        let manifest = self
            .ensure_manifest(model_id, quantization, device, &model_dir)
            .await?;

        for file in &manifest.files {
            let local = model_dir.join(&file.path);
            if download::is_file_valid(&local, &file.sha1, options.skip_integrity_check).await? {
                debug!(path = %file.path, "cached file is valid, skipping");
                continue;
            }
            let url = self.remote_url(model_id, quantization, &file.path);
            download::fetch_resumable(&self.client, &url, &local, options).await?;
            if !download::is_file_valid(&local, &file.sha1, false).await? {
                return Err(CacheError::Integrity {
                    path: file.path.clone(),
                });
            }
        }

        info!(model = model_id, quantization, "model is ready");
        Ok(ModelArtifacts {
            lib_path: model_dir.join(&manifest.lib),
            model_dir,
            manifest,
        })
    }

    async fn ensure_manifest(
        &self,
        model_id: &str,
        quantization: &str,
        device: TargetDevice,
        model_dir: &Path,
    ) -> Result<Manifest, CacheError> {
        let name = manifest_file_name(device);
        let local = model_dir.join(&name);
        if !local.exists() {
            let url = self.remote_url(model_id, quantization, &name);
            download::fetch_resumable(&self.client, &url, &local, &DownloadOptions::default())
                .await?;
        }
        let text = tokio::fs::read_to_string(&local).await?;
        match serde_json::from_str::<Manifest>(&text) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                // A bad manifest would poison every retry; remove it so the
                // next attempt refetches.
                let _ = tokio::fs::remove_file(&local).await;
                Err(CacheError::Manifest {
                    path: local.display().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Enumerate every cached model by scanning for manifests.
    pub fn list_local_models(&self) -> Result<Vec<LocalModel>, CacheError> {
        let models_root = self.root.join(MODELS_DIR);
        if !models_root.exists() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(&models_root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| CacheError::Io(e.into()))?;
            let file_name = entry.file_name().to_string_lossy();
            if !(file_name.starts_with("manifest-") && file_name.ends_with(".json")) {
                continue;
            }
            let device = file_name
                .trim_start_matches("manifest-")
                .trim_end_matches(".json")
                .rsplit('-')
                .next()
                .unwrap_or_default()
                .to_owned();

            let model_dir = entry.path().parent().unwrap_or(Path::new("")).to_path_buf();
            let quantization = model_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let escaped = model_dir
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let text = std::fs::read_to_string(entry.path())?;
            let Ok(manifest) = serde_json::from_str::<Manifest>(&text) else {
                continue;
            };
            let mut total_bytes = 0u64;
            for file in &manifest.files {
                if let Ok(meta) = std::fs::metadata(model_dir.join(&file.path)) {
                    total_bytes += meta.len();
                }
            }

            found.push(LocalModel {
                model_id: unescape_model_id(&escaped),
                quantization,
                device,
                path: model_dir,
                total_bytes,
            });
        }
        Ok(found)
    }

    /// Delete a cached model's directory tree.
    ///
    /// When `confirm` is given it is asked first; declining returns
    /// [`RemoveOutcome::Skipped`] without touching the filesystem.
    pub async fn remove_model(
        &self,
        model_id: &str,
        quantization: &str,
        confirm: Option<&(dyn Fn(&str) -> bool + Send + Sync)>,
    ) -> Result<RemoveOutcome, CacheError> {
        let model_dir = self.model_dir(model_id, quantization);
        if !model_dir.exists() {
            return Err(CacheError::NotFound(format!(
                "{model_id} ({quantization})"
            )));
        }
        if let Some(ask) = confirm
            && !ask(&format!("Remove {model_id} ({quantization})?"))
        {
            return Ok(RemoveOutcome::Skipped);
        }
        tokio::fs::remove_dir_all(&model_dir).await?;

        // Clean the now-possibly-empty model id directory.
        if let Some(parent) = model_dir.parent()
            && std::fs::read_dir(parent).map(|mut d| d.next().is_none()).unwrap_or(false)
        {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(RemoveOutcome::Removed)
    }
}
