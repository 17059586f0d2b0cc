//! Model catalogue and download for local recognition.
//!
//! This module handles locating, verifying and downloading Whisper models.
//! Downloads go through [`HttpModelFetcher`], which plugs into the mirror
//! racing in [`crate::fetch_from_mirrors`].

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::mirrors::{ModelLoadError, ModelSource, ProgressFn, SourceFetcher};

macro_rules! define_models {
    (
        $(
            $variant:ident => {
                name: $name:literal,
                filename: $filename:literal,
                size_mib: $size:literal,
                sha1: $sha1:literal $(,)?
            }
        ),* $(,)?
    ) => {
        /// Whisper models small enough to fetch on demand for voice input.
        ///
        /// For a full list, see: <https://huggingface.co/ggerganov/whisper.cpp>
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum WhisperModel {
            $($variant),*
        }

        impl WhisperModel {
            /// Returns the config name for this model.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name),*
                }
            }

            /// Returns the filename for this model.
            pub fn filename(&self) -> &'static str {
                match self {
                    $(Self::$variant => $filename),*
                }
            }

            /// Returns the expected SHA1 hash for this model.
            pub fn sha1(&self) -> &'static str {
                match self {
                    $(Self::$variant => $sha1),*
                }
            }

            fn size_mib(&self) -> u32 {
                match self {
                    $(Self::$variant => $size),*
                }
            }

            /// Parses a model name string into a WhisperModel.
            ///
            /// Model names must match exactly (case-insensitive).
            pub fn from_name(name: &str) -> Option<Self> {
                match name.to_lowercase().as_str() {
                    $($name => Some(Self::$variant)),*,
                    _ => None,
                }
            }

            /// Returns a list of all available model names.
            pub fn all_names() -> &'static [&'static str] {
                &[$($name),*]
            }
        }
    };
}

define_models! {
    Tiny => {
        name: "tiny",
        filename: "ggml-tiny.bin",
        size_mib: 75,
        sha1: "bd577a113a864445d4c299885e0cb97d4ba92b5f",
    },
    TinyQ8_0 => {
        name: "tiny-q8_0",
        filename: "ggml-tiny-q8_0.bin",
        size_mib: 42,
        sha1: "19e8118f6652a650569f5a949d962154e01571d9",
    },
    TinyEn => {
        name: "tiny.en",
        filename: "ggml-tiny.en.bin",
        size_mib: 75,
        sha1: "c78c86eb1a8faa21b369bcd33207cc90d64ae9df",
    },
    TinyEnQ5_1 => {
        name: "tiny.en-q5_1",
        filename: "ggml-tiny.en-q5_1.bin",
        size_mib: 31,
        sha1: "3fb92ec865cbbc769f08137f22470d6b66e071b6",
    },
    TinyEnQ8_0 => {
        name: "tiny.en-q8_0",
        filename: "ggml-tiny.en-q8_0.bin",
        size_mib: 42,
        sha1: "802d6668e7d411123e672abe4cb6c18f12306abb",
    },
    Base => {
        name: "base",
        filename: "ggml-base.bin",
        size_mib: 142,
        sha1: "465707469ff3a37a2b9b8d8f89f2f99de7299dac",
    },
    BaseEn => {
        name: "base.en",
        filename: "ggml-base.en.bin",
        size_mib: 142,
        sha1: "137c40403d78fd54d454da0f9bd998f78703390c",
    },
    BaseEnQ5_1 => {
        name: "base.en-q5_1",
        filename: "ggml-base.en-q5_1.bin",
        size_mib: 57,
        sha1: "d26d7ce5a1b6e57bea5d0431b9c20ae49423c94a",
    },
    BaseEnQ8_0 => {
        name: "base.en-q8_0",
        filename: "ggml-base.en-q8_0.bin",
        size_mib: 78,
        sha1: "bb1574182e9b924452bf0cd1510ac034d323e948",
    },
    SmallEnQ5_1 => {
        name: "small.en-q5_1",
        filename: "ggml-small.en-q5_1.bin",
        size_mib: 181,
        sha1: "20f54878d608f94e4a8ee3ae56016571d47cba34",
    },
}

impl WhisperModel {
    /// Returns the download sources for this model below each mirror.
    pub fn sources(&self, mirrors: &[String]) -> Vec<ModelSource> {
        mirrors
            .iter()
            .map(|base| ModelSource::from_mirror(base, self.filename()))
            .collect()
    }

    /// Returns the approximate size of this model in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_mib() as u64 * 1024 * 1024
    }

    /// Returns a human-readable size string.
    pub fn size_human(&self) -> String {
        format!("{} MiB", self.size_mib())
    }

    /// Resolves a configured model name, falling back to the default.
    pub fn from_config(name: Option<&str>) -> Self {
        match name {
            Some(name) => Self::from_name(name).unwrap_or_else(|| {
                warn!(model = name, "Unknown model name, using default");
                Self::default()
            }),
            None => Self::default(),
        }
    }
}

// Small enough to download within the default acquisition timeout.
#[allow(clippy::derivable_impls)]
impl Default for WhisperModel {
    fn default() -> Self {
        Self::TinyEnQ8_0
    }
}

/// Computes the SHA1 hash of a file.
fn compute_sha1(path: &Path) -> Result<String> {
    use sha1::{Digest, Sha1};

    let mut file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .with_context(|| "Failed to read file for SHA1")?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verifies the SHA1 hash of a model file.
pub fn verify_model(model: WhisperModel, path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    Ok(compute_sha1(path)? == model.sha1())
}

/// Downloads one model into a directory over HTTP.
#[derive(Debug, Clone)]
pub struct HttpModelFetcher {
    client: reqwest::Client,
    model: WhisperModel,
    dest_dir: PathBuf,
}

impl HttpModelFetcher {
    pub fn new(model: WhisperModel, dest_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            model,
            dest_dir,
        }
    }

    pub fn model(&self) -> WhisperModel {
        self.model
    }

    /// Where the verified model ends up.
    pub fn dest_path(&self) -> PathBuf {
        self.dest_dir.join(self.model.filename())
    }

    /// Returns the cached model path if a verified copy exists.
    pub fn cached(&self) -> Option<PathBuf> {
        let path = self.dest_path();
        match verify_model(self.model, &path) {
            Ok(true) => {
                info!(model = ?self.model, "Model verified");
                Some(path)
            }
            Ok(false) => None,
            Err(e) => {
                warn!(model = ?self.model, error = %e, "Failed to verify cached model");
                None
            }
        }
    }

    async fn download(&self, source: &ModelSource, progress: &ProgressFn<'_>) -> std::result::Result<PathBuf, ModelLoadError> {
        let path = self.dest_path();
        tokio::fs::create_dir_all(&self.dest_dir).await.map_err(|e| {
            ModelLoadError::Io(format!("failed to create {:?}: {}", self.dest_dir, e))
        })?;

        info!(model = ?self.model, url = %source, size = %self.model.size_human(), "Downloading model");

        let response = self.client.get(&source.url).send().await?;
        if !response.status().is_success() {
            return Err(ModelLoadError::Network(format!("HTTP {}", response.status())));
        }

        let total_size = response.content_length().unwrap_or(self.model.size_bytes());

        // Download to a temporary file first, then rename
        let temp = PartialDownload::new(path.with_extension("bin.tmp"));
        let mut file = tokio::fs::File::create(temp.path())
            .await
            .map_err(|e| ModelLoadError::Io(format!("failed to create {:?}: {}", temp.path(), e)))?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ModelLoadError::Io(format!("failed to write chunk: {}", e)))?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total_size);
        }

        file.flush()
            .await
            .map_err(|e| ModelLoadError::Io(format!("failed to flush file: {}", e)))?;
        drop(file);

        debug!("Verifying SHA1 hash");
        let temp_path = temp.path().to_path_buf();
        let actual = tokio::task::spawn_blocking(move || compute_sha1(&temp_path))
            .await
            .map_err(|e| ModelLoadError::Unknown(format!("hash task failed: {}", e)))?
            .map_err(|e| ModelLoadError::Io(e.to_string()))?;
        if actual != self.model.sha1() {
            return Err(ModelLoadError::Integrity(format!(
                "SHA1 mismatch for {}: expected {}, got {}",
                self.model.filename(),
                self.model.sha1(),
                actual
            )));
        }

        temp.persist(&path)?;
        info!(path = ?path, "Model download complete and verified");
        Ok(path)
    }
}

/// A download in progress. The file is removed on drop unless it was
/// persisted, which covers errors and a cancelled download future alike.
struct PartialDownload {
    path: PathBuf,
    persisted: bool,
}

impl PartialDownload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Moves the finished file to `dest`.
    fn persist(mut self, dest: &Path) -> std::result::Result<(), ModelLoadError> {
        fs::rename(&self.path, dest).map_err(|e| {
            ModelLoadError::Io(format!("failed to rename {:?} to {:?}: {}", self.path, dest, e))
        })?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if !self.persisted && fs::remove_file(&self.path).is_ok() {
            debug!(path = ?self.path, "Removed partial download");
        }
    }
}

#[async_trait]
impl SourceFetcher<PathBuf> for HttpModelFetcher {
    async fn exists(&self, source: &ModelSource) -> bool {
        match self.client.head(&source.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %source, error = %e, "Existence check failed");
                false
            }
        }
    }

    async fn fetch(&self, source: &ModelSource, progress: &ProgressFn<'_>) -> std::result::Result<PathBuf, ModelLoadError> {
        self.download(source, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_from_name() {
        assert_eq!(
            WhisperModel::from_name("base.en-q8_0"),
            Some(WhisperModel::BaseEnQ8_0)
        );
        assert_eq!(WhisperModel::from_name("TINY"), Some(WhisperModel::Tiny));
        assert_eq!(WhisperModel::from_name("invalid"), None);
    }

    #[test]
    fn test_all_names_parse() {
        for name in WhisperModel::all_names() {
            assert!(
                WhisperModel::from_name(name).is_some(),
                "Failed to parse model name: {}",
                name
            );
        }
    }

    #[test]
    fn test_unknown_config_name_uses_default() {
        assert_eq!(WhisperModel::from_config(Some("huge")), WhisperModel::default());
        assert_eq!(WhisperModel::from_config(Some("base.en")), WhisperModel::BaseEn);
    }

    #[test]
    fn test_sources_follow_mirror_order() {
        let mirrors = vec![
            "https://a.example/models".to_string(),
            "https://b.example/models/".to_string(),
        ];
        let sources = WhisperModel::TinyEn.sources(&mirrors);
        assert_eq!(sources[0].url, "https://a.example/models/ggml-tiny.en.bin");
        assert_eq!(sources[1].url, "https://b.example/models/ggml-tiny.en.bin");
    }

    #[test]
    fn test_partial_download_is_removed_unless_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("ggml-tiny.en.bin.tmp");
        let dest = dir.path().join("ggml-tiny.en.bin");

        fs::write(&temp_path, b"half a model").unwrap();
        drop(PartialDownload::new(temp_path.clone()));
        assert!(!temp_path.exists());

        fs::write(&temp_path, b"whole model").unwrap();
        PartialDownload::new(temp_path.clone()).persist(&dest).unwrap();
        assert!(!temp_path.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"whole model");
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("ggml-tiny.en.bin.tmp");

        let writer = {
            let temp_path = temp_path.clone();
            async move {
                let temp = PartialDownload::new(temp_path);
                let mut file = tokio::fs::File::create(temp.path()).await.unwrap();
                file.write_all(b"first chunk").await.unwrap();
                std::future::pending::<()>().await;
            }
        };
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), writer).await;

        assert!(result.is_err());
        assert!(!temp_path.exists());
    }

    #[test]
    fn test_unverified_file_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = HttpModelFetcher::new(WhisperModel::TinyEn, dir.path().to_path_buf());
        assert!(fetcher.cached().is_none());

        fs::write(fetcher.dest_path(), b"not a model").unwrap();
        assert!(fetcher.cached().is_none());
    }
}
