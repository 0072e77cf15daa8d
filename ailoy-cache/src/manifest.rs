//! The per-target model manifest.

use serde::{Deserialize, Serialize};

/// One artifact listed in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path relative to the model directory.
    pub path: String,
    /// Expected SHA-1 digest, lowercase hex.
    pub sha1: String,
}

/// The manifest enumerating a model's artifacts for one
/// `(arch, os, device)` target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Every file the model needs, with digests.
    pub files: Vec<ManifestFile>,
    /// Relative path of the compiled model library.
    pub lib: String,
}

/// Compute devices a model can be compiled for.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetDevice {
    /// Plain CPU execution.
    Cpu,
    /// Apple Metal.
    Metal,
    /// Vulkan.
    Vulkan,
    /// NVIDIA CUDA.
    Cuda,
}

impl TargetDevice {
    /// The device name as it appears in manifest file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetDevice::Cpu => "cpu",
            TargetDevice::Metal => "metal",
            TargetDevice::Vulkan => "vulkan",
            TargetDevice::Cuda => "cuda",
        }
    }
}

impl std::fmt::Display for TargetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File name of the manifest for the running host and `device`.
pub fn manifest_file_name(device: TargetDevice) -> String {
    format!(
        "manifest-{}-{}-{}.json",
        std::env::consts::ARCH,
        std::env::consts::OS,
        device.as_str()
    )
}

/// Escape a model id for use as a directory name: `/` becomes `--`.
pub fn escape_model_id(model_id: &str) -> String {
    model_id.replace('/', "--")
}

/// Undo [`escape_model_id`].
pub fn unescape_model_id(escaped: &str) -> String {
    escaped.replace("--", "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses() {
        let json = r#"{
            "files": [
                {"path": "tokenizer.json", "sha1": "da39a3ee5e6b4b0d3255bfef95601890afd80709"},
                {"path": "params_shard_0.bin", "sha1": "356a192b7913b04c54574d18c28d46e6395428ab"}
            ],
            "lib": "model-lib.so"
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.lib, "model-lib.so");
    }

    #[test]
    fn model_id_escape_roundtrip() {
        assert_eq!(escape_model_id("Qwen/Qwen3-0.6B"), "Qwen--Qwen3-0.6B");
        assert_eq!(unescape_model_id("Qwen--Qwen3-0.6B"), "Qwen/Qwen3-0.6B");
    }

    #[test]
    fn manifest_name_carries_device() {
        let name = manifest_file_name(TargetDevice::Cpu);
        assert!(name.starts_with("manifest-"));
        assert!(name.ends_with("-cpu.json"));
    }
}
