//! Domain types shared across Kiln crates.
//!
//! Definitions (functions, environments, triggers) are stored by
//! `kiln-store`; the request types here are the wire formats spoken
//! between the client, pool manager, fetcher, and runtime containers.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checksum::{Checksum, sha256_hex};
use crate::error::{KilnError, KilnResult};

/// Default port on which a runtime container accepts load requests.
pub const DEFAULT_LOAD_PORT: u16 = 8888;

/// Default path on which a runtime container accepts load requests.
pub const DEFAULT_LOAD_PATH: &str = "/specialize";

/// Default port on which a specialized runtime serves the function.
pub const DEFAULT_FUNCTION_PORT: u16 = 8888;

// ── Metadata ───────────────────────────────────────────────────────

/// Identifying metadata carried by every stored definition.
///
/// `uid` is assigned when the object is first created and
/// `resource_version` increases on every write, so together they name
/// one exact revision of the object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl Metadata {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Self::default()
        }
    }

    /// Composite key `{namespace}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Opaque value that changes whenever this revision changes.
    pub fn content_version(&self) -> String {
        format!("{}_{}", self.uid, self.resource_version)
    }
}

// ── Function identity ──────────────────────────────────────────────

/// Name of a function without a particular revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: String,
    pub namespace: String,
}

/// A function revision: the key of the function service cache.
///
/// Two identities that differ only in `content_version` are unrelated
/// cache keys, so an instance specialized for old code is never served
/// for new code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionIdentity {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub content_version: String,
}

impl FunctionIdentity {
    pub fn new(namespace: &str, name: &str, content_version: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            content_version: content_version.to_string(),
        }
    }

    /// Identity of the stored revision described by `metadata`.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            name: metadata.name.clone(),
            namespace: metadata.namespace.clone(),
            content_version: metadata.content_version(),
        }
    }

    /// True when the caller pinned a revision.
    pub fn is_resolved(&self) -> bool {
        !self.content_version.is_empty()
    }

    pub fn function_ref(&self) -> FunctionRef {
        FunctionRef {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// File name for this revision's code on a shared volume.
    ///
    /// Readable name prefix plus a digest of the whole identity, so
    /// same-named functions in different namespaces (or revisions) never
    /// share a file.
    pub fn code_filename(&self) -> String {
        let prefix: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let digest = sha256_hex(self.to_string().as_bytes());
        format!("{prefix}-{}", &digest[..16])
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.content_version)
    }
}

// ── Packages ───────────────────────────────────────────────────────

/// Function code, either inline or by reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Inline package bytes, base64-encoded on the wire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub literal: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Required for `url` packages; ignored for literals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    /// Overrides the environment's default entry point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
}

/// A validated view of a [`Package`]'s content.
#[derive(Debug, PartialEq, Eq)]
pub enum PackageContent<'a> {
    Literal(&'a [u8]),
    Reference { url: &'a str, checksum: &'a Checksum },
}

impl Package {
    pub fn literal(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            literal: Some(bytes.into()),
            ..Self::default()
        }
    }

    pub fn reference(url: &str, checksum: Checksum) -> Self {
        Self {
            url: Some(url.to_string()),
            checksum: Some(checksum),
            ..Self::default()
        }
    }

    /// Check that exactly one form is populated and return it.
    ///
    /// Reference packages must carry a checksum with a supported algorithm.
    pub fn content(&self) -> KilnResult<PackageContent<'_>> {
        let url = self.url.as_deref().filter(|u| !u.is_empty());
        match (self.literal.as_deref(), url) {
            (Some(_), Some(_)) => Err(KilnError::Validation(
                "package has both literal content and a url".into(),
            )),
            (Some(bytes), None) => Ok(PackageContent::Literal(bytes)),
            (None, Some(url)) => {
                let checksum = self.checksum.as_ref().ok_or_else(|| {
                    KilnError::Validation(format!("package url {url} has no checksum"))
                })?;
                checksum.validate()?;
                Ok(PackageContent::Reference { url, checksum })
            }
            (None, None) => Err(KilnError::Validation("package has no content".into())),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ── Functions ──────────────────────────────────────────────────────

/// Code and environment of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Name of the environment (in the function's namespace) that runs it.
    pub environment_name: String,
    /// Source package, consumed by build steps.
    #[serde(default)]
    pub source: Package,
    /// Deployable package loaded into the runtime.
    #[serde(default)]
    pub deployment: Package,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub metadata: Metadata,
    pub spec: FunctionSpec,
}

impl Function {
    pub fn identity(&self) -> FunctionIdentity {
        FunctionIdentity::from_metadata(&self.metadata)
    }

    /// The package for a fetch of the given kind.
    pub fn package(&self, kind: FetchType) -> Option<&Package> {
        match kind {
            FetchType::Source => Some(&self.spec.source),
            FetchType::Deployment => Some(&self.spec.deployment),
            FetchType::Url => None,
        }
    }
}

// ── Environments ───────────────────────────────────────────────────

/// Runtime container settings for an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub image: String,
    #[serde(default = "default_load_port")]
    pub load_endpoint_port: u16,
    #[serde(default = "default_load_path")]
    pub load_endpoint_path: String,
    #[serde(default = "default_function_port")]
    pub function_endpoint_port: u16,
}

impl Runtime {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            load_endpoint_port: DEFAULT_LOAD_PORT,
            load_endpoint_path: DEFAULT_LOAD_PATH.to_string(),
            function_endpoint_port: DEFAULT_FUNCTION_PORT,
        }
    }
}

fn default_load_port() -> u16 {
    DEFAULT_LOAD_PORT
}

fn default_load_path() -> String {
    DEFAULT_LOAD_PATH.to_string()
}

fn default_function_port() -> u16 {
    DEFAULT_FUNCTION_PORT
}

fn default_env_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    pub image: String,
    #[serde(default)]
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    #[serde(default = "default_env_version")]
    pub version: u32,
    pub runtime: Runtime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<Builder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    /// Warm pool target for this environment; falls back to config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub metadata: Metadata,
    pub spec: EnvironmentSpec,
}

// ── Triggers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionReference {
    /// Reference kind; only `"name"` is defined.
    #[serde(rename = "type", default = "default_ref_type")]
    pub ref_type: String,
    pub name: String,
}

fn default_ref_type() -> String {
    "name".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTriggerSpec {
    #[serde(default)]
    pub host: String,
    pub relative_url: String,
    #[serde(default)]
    pub method: String,
    pub function_ref: FunctionReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpTrigger {
    pub metadata: Metadata,
    pub spec: HttpTriggerSpec,
}

// ── Fetcher and runtime wire types ─────────────────────────────────

/// What a fetch request asks the fetcher to place on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchType {
    /// The function's source package.
    Source,
    /// The function's deployment package.
    Deployment,
    /// Raw content at `url`, unverified.
    Url,
}

impl fmt::Display for FetchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchType::Source => "source",
            FetchType::Deployment => "deployment",
            FetchType::Url => "url",
        };
        f.write_str(s)
    }
}

/// Body of `POST /` on the fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub fetch_type: FetchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Destination file name, relative to the shared volume.
    pub filename: String,
    /// Revision the caller expects; the fetch fails if the stored
    /// function has moved on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_version: Option<String>,
}

impl FetchRequest {
    pub fn deployment(function: FunctionRef, filename: &str) -> Self {
        Self {
            fetch_type: FetchType::Deployment,
            function: Some(function),
            url: None,
            filename: filename.to_string(),
            content_version: None,
        }
    }

    pub fn url(url: &str, filename: &str) -> Self {
        Self {
            fetch_type: FetchType::Url,
            function: None,
            url: Some(url.to_string()),
            filename: filename.to_string(),
            content_version: None,
        }
    }

    /// Only deliver `content_version` of the function.
    pub fn pinned(mut self, content_version: &str) -> Self {
        self.content_version = Some(content_version.to_string());
        self
    }
}

/// Body of the runtime container's specialize request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionLoadRequest {
    /// Absolute path of the delivered code inside the container.
    pub filepath: String,
    /// Environment-specific entry point; empty means the default.
    #[serde(default)]
    pub entrypoint: String,
    /// URL path to expose the function at.
    #[serde(default)]
    pub url: String,
}
