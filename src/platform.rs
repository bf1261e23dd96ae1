//! OCI platform parsing and matching.
//!
//! Platforms are written `<os>/<arch>[/<variant>]` (e.g. `linux/amd64`,
//! `linux/arm/v7`). Matching is strict: two platforms match only when os,
//! architecture, and variant are all equal.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An OCI platform: operating system, CPU architecture, optional variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OciPlatform {
    /// Operating system (e.g. `linux`).
    pub os: String,
    /// CPU architecture (e.g. `amd64`, `arm64`).
    pub architecture: String,
    /// Architecture variant (e.g. `v7`, `v8`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl OciPlatform {
    /// Parses a platform string of the form `os/arch[/variant]`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let os = parts.next().unwrap_or_default();
        let architecture = parts.next().unwrap_or_default();
        let variant = parts.next();

        if os.is_empty() || architecture.is_empty() || parts.next().is_some() {
            return Err(Error::InvalidPlatform(s.to_string()));
        }
        if let Some(v) = variant
            && v.is_empty()
        {
            return Err(Error::InvalidPlatform(s.to_string()));
        }

        Ok(Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: variant.map(str::to_string),
        })
    }

    /// Returns the default platform for the host: `linux/<arch>`.
    ///
    /// Builds always target Linux images; building for an architecture other
    /// than the host's requires QEMU / binfmt_misc support in the kernel.
    pub fn host() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: host_arch().to_string(),
            variant: None,
        }
    }

    /// Strict equality match on os, architecture, and variant.
    pub fn matches(&self, other: &Self) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && self.variant == other.variant
    }

    /// Converts the platform to a filesystem-safe slug.
    ///
    /// Replaces slashes with dashes (e.g. `linux/amd64` becomes
    /// `linux-amd64`).
    pub fn slug(&self) -> String {
        self.to_string().replace('/', "-")
    }
}

impl std::fmt::Display for OciPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// Returns the host CPU architecture in OCI notation.
fn host_arch() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    return "amd64";

    #[cfg(target_arch = "aarch64")]
    return "arm64";

    #[cfg(target_arch = "arm")]
    return "arm";

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
    return std::env::consts::ARCH;
}
