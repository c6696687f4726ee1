//! Publishing trained artifacts.
//!
//! An [`ArtifactBundle`] is a directory plus the files in it that make up a
//! release (adapter weights, adapter config, tokenizer files). Publishers copy
//! or upload the whole bundle under a repository id in one call.

use std::path::{Path, PathBuf};

use crate::error::{Result, TuneError};

/// Files to publish, relative to a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactBundle {
    root: PathBuf,
    files: Vec<String>,
}

impl ArtifactBundle {
    /// Bundle `files` (relative paths) under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Publish`] if a file does not exist.
    pub fn new(root: impl Into<PathBuf>, files: Vec<String>) -> Result<Self> {
        let root = root.into();
        if let Some(missing) = files.iter().find(|f| !root.join(f).is_file()) {
            return Err(TuneError::Publish(format!(
                "{missing} not found in {}",
                root.display()
            )));
        }
        Ok(Self { root, files })
    }

    /// Directory holding the files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative file names.
    #[must_use]
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Absolute path of one file.
    #[must_use]
    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }
}

/// Where and what was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Repository the bundle was published to.
    pub repo_id: String,
    /// Location of the published repository.
    pub location: String,
    /// Files published.
    pub files: Vec<String>,
}

/// Destination for trained artifacts.
pub trait ArtifactPublisher {
    /// Publish every file in `bundle` to `repo_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Publish`] if any file cannot be published.
    fn publish(&self, repo_id: &str, bundle: &ArtifactBundle) -> Result<PublishReceipt>;
}

fn check_repo_id(repo_id: &str) -> Result<()> {
    let valid = !repo_id.is_empty()
        && repo_id
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(())
    } else {
        Err(TuneError::Publish(format!("invalid repository id: {repo_id:?}")))
    }
}

/// Copies bundles into `<root>/<repo_id>/`.
#[derive(Debug, Clone)]
pub struct LocalPublisher {
    root: PathBuf,
}

impl LocalPublisher {
    /// Publish under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactPublisher for LocalPublisher {
    fn publish(&self, repo_id: &str, bundle: &ArtifactBundle) -> Result<PublishReceipt> {
        check_repo_id(repo_id)?;
        let target = self.root.join(repo_id);
        let publish_err = |e: std::io::Error| TuneError::Publish(format!("{}: {e}", target.display()));

        std::fs::create_dir_all(&target).map_err(publish_err)?;
        for file in bundle.files() {
            let dest = target.join(file);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(publish_err)?;
            }
            std::fs::copy(bundle.path(file), &dest).map_err(publish_err)?;
            tracing::debug!("Published {file} to {}", dest.display());
        }

        Ok(PublishReceipt {
            repo_id: repo_id.to_string(),
            location: target.display().to_string(),
            files: bundle.files().to_vec(),
        })
    }
}

#[cfg(feature = "hub")]
pub use http::HttpPublisher;

#[cfg(feature = "hub")]
mod http {
    use super::{check_repo_id, ArtifactBundle, ArtifactPublisher, PublishReceipt};
    use crate::error::{Result, TuneError};

    /// Uploads each file with `PUT <endpoint>/<repo_id>/<file>`.
    pub struct HttpPublisher {
        endpoint: String,
        token: Option<String>,
        client: reqwest::blocking::Client,
    }

    impl HttpPublisher {
        /// Publisher for `endpoint`, authenticating with `token` if given.
        ///
        /// # Errors
        ///
        /// Returns an error if the HTTP client cannot be built.
        pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .user_agent(concat!("lora-tune/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| TuneError::Publish(format!("failed to create HTTP client: {e}")))?;
            Ok(Self {
                endpoint: endpoint.into().trim_end_matches('/').to_string(),
                token,
                client,
            })
        }
    }

    impl ArtifactPublisher for HttpPublisher {
        fn publish(&self, repo_id: &str, bundle: &ArtifactBundle) -> Result<PublishReceipt> {
            check_repo_id(repo_id)?;
            for file in bundle.files() {
                let content = std::fs::read(bundle.path(file))
                    .map_err(|e| TuneError::Publish(format!("{file}: {e}")))?;
                let url = format!("{}/{repo_id}/{file}", self.endpoint);
                let mut request = self
                    .client
                    .put(&url)
                    .header("Content-Type", "application/octet-stream")
                    .body(content);
                if let Some(token) = &self.token {
                    request = request.bearer_auth(token);
                }
                let response = request
                    .send()
                    .map_err(|e| TuneError::Publish(format!("upload of {file} failed: {e}")))?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().unwrap_or_default();
                    return Err(TuneError::Publish(format!(
                        "upload of {file} failed: HTTP {status}: {body}"
                    )));
                }
                tracing::debug!("Uploaded {file} to {url}");
            }

            Ok(PublishReceipt {
                repo_id: repo_id.to_string(),
                location: format!("{}/{repo_id}", self.endpoint),
                files: bundle.files().to_vec(),
            })
        }
    }
}
