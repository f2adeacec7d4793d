use crate::RenderRequest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex characters kept from the SHA-256 digest (160 bits).
pub const FINGERPRINT_LEN: usize = 40;

/// Identifies one distinct rendered artifact. Doubles as the key for the
/// asset cache, the active-job index and the render lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version tags of the render pipeline. Bumping either one moves every
/// request to a fresh fingerprint, so stale cache entries are never served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineVersion {
    pub renderer: String,
    pub service: String,
}

impl Default for PipelineVersion {
    fn default() -> Self {
        PipelineVersion {
            renderer: "maptoposter-vendor".into(),
            service: "1".into(),
        }
    }
}

// Field order is alphabetical and must stay that way. `kind` is left out
// because it never changes the pixels.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    city: &'a str,
    country: &'a str,
    distance: u32,
    height: f64,
    mode: &'a str,
    renderer_version: &'a str,
    service_version: &'a str,
    theme: &'a str,
    width: f64,
}

pub fn fingerprint(request: &RenderRequest, version: &PipelineVersion) -> Fingerprint {
    let request = request.normalized();
    let canonical = CanonicalRequest {
        city: &request.city,
        country: &request.country,
        distance: request.distance,
        height: request.height,
        mode: "exact",
        renderer_version: version.renderer.trim(),
        service_version: version.service.trim(),
        theme: &request.theme,
        width: request.width,
    };
    // Serializing plain strings and finite numbers cannot fail; non-finite
    // floats become null, which still hashes deterministically.
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(FINGERPRINT_LEN);
    Fingerprint(hex)
}
