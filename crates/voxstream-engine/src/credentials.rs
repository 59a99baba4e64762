use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use voxstream_core::CredentialError;

pub const CREDENTIALS_ENV_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const METADATA_HOST: &str = "http://metadata.google.internal";
const METADATA_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Where a credential came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOrigin {
    KeyPath(PathBuf),
    EnvironmentVariable(PathBuf),
    WellKnownFile(PathBuf),
}

/// Credential material for authenticating the recognize stream.
#[derive(Clone)]
pub enum Credential {
    /// Key file contents, passed through unread.
    KeyMaterial {
        bytes: Vec<u8>,
        origin: CredentialOrigin,
    },
    /// Tokens come from the platform metadata service.
    MetadataServer { host: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::KeyMaterial { bytes, origin } => f
                .debug_struct("KeyMaterial")
                .field("len", &bytes.len())
                .field("origin", origin)
                .finish(),
            Credential::MetadataServer { host } => f
                .debug_struct("MetadataServer")
                .field("host", host)
                .finish(),
        }
    }
}

/// Ambient sources consulted when no usable key path is configured.
#[derive(Debug, Clone, Default)]
pub struct AmbientDiscovery {
    /// Value of `GOOGLE_APPLICATION_CREDENTIALS`, if set.
    pub env_key_path: Option<PathBuf>,
    /// Application-default credentials file written by `gcloud auth`.
    pub well_known_path: Option<PathBuf>,
    /// Metadata service to probe; `None` disables the probe.
    pub metadata_host: Option<String>,
}

impl AmbientDiscovery {
    pub fn from_env() -> Self {
        let env_key_path = std::env::var_os(CREDENTIALS_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let well_known_path = std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("gcloud")
                .join("application_default_credentials.json")
        });
        Self {
            env_key_path,
            well_known_path,
            metadata_host: Some(METADATA_HOST.to_string()),
        }
    }

    /// No ambient sources at all.
    pub fn none() -> Self {
        Self::default()
    }
}

pub struct CredentialResolver {
    ambient: AmbientDiscovery,
    http: reqwest::Client,
}

impl CredentialResolver {
    pub fn new(ambient: AmbientDiscovery) -> Self {
        Self {
            ambient,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(AmbientDiscovery::from_env())
    }

    /// Resolve a credential, preferring the configured key path and falling
    /// back to ambient discovery when it is missing or unreadable.
    pub async fn resolve(
        &self,
        key_path: Option<&Path>,
        log_id: &str,
    ) -> Result<Credential, CredentialError> {
        if let Some(path) = key_path {
            tracing::info!(session = %log_id, path = %path.display(), "using service account key");
            match read_key_file(path).await {
                Ok(bytes) => {
                    return Ok(Credential::KeyMaterial {
                        bytes,
                        origin: CredentialOrigin::KeyPath(path.to_path_buf()),
                    })
                }
                Err(reason) => {
                    tracing::warn!(
                        session = %log_id,
                        path = %path.display(),
                        "failed to read service account key ({reason}), falling back to default credentials"
                    );
                }
            }
        } else {
            tracing::info!(session = %log_id, "no service account key path set, using default credentials");
        }

        self.discover_ambient(log_id).await
    }

    async fn discover_ambient(&self, log_id: &str) -> Result<Credential, CredentialError> {
        let mut tried = Vec::new();

        if let Some(path) = &self.ambient.env_key_path {
            match read_key_file(path).await {
                Ok(bytes) => {
                    tracing::debug!(session = %log_id, path = %path.display(), "credential from {CREDENTIALS_ENV_VAR}");
                    return Ok(Credential::KeyMaterial {
                        bytes,
                        origin: CredentialOrigin::EnvironmentVariable(path.clone()),
                    });
                }
                Err(reason) => {
                    tracing::warn!(session = %log_id, "{CREDENTIALS_ENV_VAR} unusable: {reason}");
                    tried.push(format!("{CREDENTIALS_ENV_VAR} ({reason})"));
                }
            }
        }

        if let Some(path) = &self.ambient.well_known_path {
            match read_key_file(path).await {
                Ok(bytes) => {
                    tracing::debug!(session = %log_id, path = %path.display(), "credential from well-known file");
                    return Ok(Credential::KeyMaterial {
                        bytes,
                        origin: CredentialOrigin::WellKnownFile(path.clone()),
                    });
                }
                Err(reason) => tried.push(format!("{} ({reason})", path.display())),
            }
        }

        if let Some(host) = &self.ambient.metadata_host {
            if self.probe_metadata(host).await {
                tracing::debug!(session = %log_id, %host, "credential from metadata service");
                return Ok(Credential::MetadataServer { host: host.clone() });
            }
            tried.push(format!("metadata service at {host}"));
        }

        if tried.is_empty() {
            tried.push("no ambient sources configured".to_string());
        }
        Err(CredentialError::Unavailable(tried.join("; ")))
    }

    async fn probe_metadata(&self, host: &str) -> bool {
        let request = self
            .http
            .get(format!("{host}/computeMetadata/v1/"))
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_PROBE_TIMEOUT)
            .send();
        match request.await {
            Ok(resp) => resp
                .headers()
                .get("Metadata-Flavor")
                .is_some_and(|v| v == "Google"),
            Err(e) => {
                tracing::trace!("metadata probe failed: {e}");
                false
            }
        }
    }
}

async fn read_key_file(path: &Path) -> Result<Vec<u8>, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err("file is empty".to_string());
    }
    Ok(bytes)
}
