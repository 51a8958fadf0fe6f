//! Workspace payload and source description

use crate::TunnelError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::{DeserializeOwned, IgnoredAny};
use std::io::{Read, Write};
use std::path::PathBuf;

/// Opaque workspace description.
///
/// Only checked to be JSON and carried around; its schema belongs to the
/// workspace configuration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceInfo {
    json: String,
}

impl WorkspaceInfo {
    /// Wrap a JSON document
    pub fn from_json(json: impl Into<String>) -> Result<Self, TunnelError> {
        let json = json.into();
        serde_json::from_str::<IgnoredAny>(&json)?;
        Ok(Self { json })
    }

    /// Wrap a JSON value
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self {
            json: value.to_string(),
        }
    }

    /// The JSON document
    pub fn as_json(&self) -> &str {
        &self.json
    }

    /// Deserialize into a caller-chosen type
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, TunnelError> {
        Ok(serde_json::from_str(&self.json)?)
    }

    /// Gzip and base64 encode for use as a command-line argument
    pub fn encode(&self) -> Result<String, TunnelError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.json.as_bytes())?;
        Ok(STANDARD.encode(encoder.finish()?))
    }

    /// Reverse of [`WorkspaceInfo::encode`]
    pub fn decode(encoded: &str) -> Result<Self, TunnelError> {
        let compressed = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TunnelError::Serialization(format!("workspace info is not base64: {}", e)))?;

        let mut json = String::new();
        GzDecoder::new(compressed.as_slice()).read_to_string(&mut json)?;
        Self::from_json(json)
    }
}

/// Where the operator takes workspace content from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSource {
    /// Folder on the operator host
    pub local_folder: Option<PathBuf>,
    /// Repository to clone
    pub git_repository: Option<String>,
    /// Branch of `git_repository`
    pub git_branch: Option<String>,
}

impl WorkspaceSource {
    /// Content comes from a local folder
    pub fn local_folder(path: impl Into<PathBuf>) -> Self {
        Self {
            local_folder: Some(path.into()),
            ..Default::default()
        }
    }

    /// Content comes from a git repository
    pub fn git(repository: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            git_repository: Some(repository.into()),
            git_branch: branch,
            ..Default::default()
        }
    }
}
