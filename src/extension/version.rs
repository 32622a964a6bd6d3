//! Extension and server version negotiation

use super::DatabaseExtension;
use crate::error::{Result, WardenError};
use crate::storage::{ExtensionVersionInfo, SchemaBackend};
use crate::utils::coerce_version;
use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Supported PostgreSQL server versions
pub const POSTGRES_VERSION_RANGE: &str = ">=14";

/// Size of the step between two versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionDiff {
    None,
    Patch,
    Minor,
    Major,
}

/// Classify the step from `from` to `to`
///
/// Both versions are coerced first, so `0.3` and `0.3.0` are equal.
pub fn version_diff(from: &str, to: &str) -> Result<VersionDiff> {
    let from = coerce_version(from)?;
    let to = coerce_version(to)?;

    Ok(if from.major != to.major {
        VersionDiff::Major
    } else if from.minor != to.minor {
        VersionDiff::Minor
    } else if from.patch != to.patch {
        VersionDiff::Patch
    } else {
        VersionDiff::None
    })
}

/// Reads versions from the catalog and knows the supported ranges
pub struct VersionResolver {
    backend: Arc<dyn SchemaBackend>,
}

impl VersionResolver {
    pub fn new(backend: Arc<dyn SchemaBackend>) -> Self {
        Self { backend }
    }

    /// Available and installed version of an extension
    ///
    /// An extension the engine does not know yields both fields unset.
    pub async fn get_extension_version(
        &self,
        extension: DatabaseExtension,
    ) -> Result<ExtensionVersionInfo> {
        self.backend.extension_version(extension.name()).await
    }

    /// Versions of a vector extension this release supports
    pub fn get_extension_version_range(extension: DatabaseExtension) -> Result<VersionReq> {
        let profile = extension.vector_profile()?;
        Ok(VersionReq::parse(profile.version_range)?)
    }

    /// Server version parsed from `SELECT version()`
    pub async fn get_postgres_version(&self) -> Result<Version> {
        let text = self.backend.server_version().await?;
        let pattern = Regex::new(r"PostgreSQL (\d+(?:\.\d+){0,2})")?;
        let number = pattern
            .captures(&text)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| {
                WardenError::Precondition(format!("Unrecognized server version string: {}", text))
            })?;
        coerce_version(number.as_str())
    }

    pub fn get_postgres_version_range() -> Result<VersionReq> {
        Ok(VersionReq::parse(POSTGRES_VERSION_RANGE)?)
    }

    /// Fail unless the server is a supported PostgreSQL release
    pub async fn check_postgres_version(&self) -> Result<Version> {
        let version = self.get_postgres_version().await?;
        let range = Self::get_postgres_version_range()?;
        if !range.matches(&version) {
            return Err(WardenError::Precondition(format!(
                "PostgreSQL {} is not supported, required range is {}",
                version, range
            )));
        }
        Ok(version)
    }

    /// Pick the active vector extension
    ///
    /// A configured extension wins. Otherwise the first installed vector
    /// extension in preference order is used, then the first available one.
    pub async fn detect_vector_extension(
        &self,
        configured: Option<DatabaseExtension>,
    ) -> Result<DatabaseExtension> {
        if let Some(extension) = configured {
            extension.vector_profile()?;
            return Ok(extension);
        }

        let mut first_available = None;
        for extension in DatabaseExtension::VECTOR {
            let info = self.get_extension_version(extension).await?;
            if info.is_installed() {
                log::info!("Detected installed vector extension {}", extension.display_name());
                return Ok(extension);
            }
            if first_available.is_none() && info.available_version.is_some() {
                first_available = Some(extension);
            }
        }

        first_available.ok_or_else(|| {
            WardenError::Precondition(
                "No vector extension (vchord, vectors or vector) is available".to_string(),
            )
        })
    }
}
