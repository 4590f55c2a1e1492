//! Ambient registry credentials from Docker's `config.json`
//!
//! Hosts with a credential helper (`credHelpers.<host>`, else `credsStore`)
//! are asked through `docker-credential-<helper> get` first; the static
//! `auths` entries are the fallback.

use crate::error::{Result, SyncerError};
use crate::registry::auth::Credential;
use crate::registry::reference::{DOCKER_HUB_REGISTRY, is_dockerhub_registry, registry_host};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Server URL credential helpers know Docker Hub by
const DOCKER_HUB_HELPER_URL: &str = "https://index.docker.io/v1/";

/// Username a helper returns when `Secret` is an identity token
const IDENTITY_TOKEN_USERNAME: &str = "<token>";

const HELPER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default)]
    creds_store: Option<String>,
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

/// `get` reply of a credential helper
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperCredential {
    #[serde(default)]
    username: String,
    #[serde(default)]
    secret: String,
}

impl HelperCredential {
    fn credential(self) -> Option<Credential> {
        if self.secret.is_empty() {
            return None;
        }
        if self.username == IDENTITY_TOKEN_USERNAME {
            return Some(Credential::IdentityToken { token: self.secret });
        }
        if self.username.is_empty() {
            return Some(Credential::Bearer { token: self.secret });
        }
        Some(Credential::Basic {
            username: self.username,
            password: self.secret,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "registrytoken")]
    registry_token: Option<String>,
}

impl AuthEntry {
    fn credential(&self) -> Option<Credential> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            if !username.is_empty() && !password.is_empty() {
                return Some(Credential::Basic {
                    username: username.clone(),
                    password: password.clone(),
                });
            }
        }

        if let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded.as_deref().and_then(|s| s.split_once(':')) {
                Some((username, password)) => {
                    return Some(Credential::Basic {
                        username: username.to_string(),
                        password: password.to_string(),
                    });
                }
                None => warn!("ignoring malformed auth entry in docker config"),
            }
        }

        self.registry_token
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|token| Credential::Bearer {
                token: token.clone(),
            })
    }
}

/// Per-host credentials, as the docker CLI stored them
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    entries: HashMap<String, Credential>,
    creds_store: Option<String>,
    cred_helpers: HashMap<String, String>,
    helper_dir: Option<PathBuf>,
}

impl Keychain {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Location docker itself uses: `$DOCKER_CONFIG/config.json`, else `$HOME/.docker/config.json`
    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker").join("config.json"))
    }

    /// Load the default docker config. A missing or unreadable file yields an empty keychain.
    pub fn from_default_location() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::empty();
        };
        match Self::from_path(&path) {
            Ok(keychain) => keychain,
            Err(e) if e.is_not_found() => {
                debug!(path = %path.display(), "no docker config found, using anonymous access");
                Self::empty()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable docker config");
                Self::empty()
            }
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncerError::NotFound(format!("docker config {}", path.display()))
            } else {
                SyncerError::Io(format!("Failed to read {}: {}", path.display(), e))
            }
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: DockerConfigFile = serde_json::from_str(contents)
            .map_err(|e| SyncerError::Config(format!("invalid docker config: {}", e)))?;

        let entries = config
            .auths
            .iter()
            .filter_map(|(key, entry)| entry.credential().map(|c| (host_key(key), c)))
            .collect();
        let cred_helpers = config
            .cred_helpers
            .into_iter()
            .filter(|(_, helper)| !helper.is_empty())
            .map(|(key, helper)| (host_key(&key), helper))
            .collect();
        Ok(Self {
            entries,
            creds_store: config.creds_store.filter(|store| !store.is_empty()),
            cred_helpers,
            helper_dir: None,
        })
    }

    /// Look up `docker-credential-*` programs in `dir` instead of `PATH`
    pub fn with_helper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.helper_dir = Some(dir.into());
        self
    }

    /// Helper configured for `registry`: its `credHelpers` entry, else `credsStore`
    pub fn helper_for(&self, registry: &str) -> Option<&str> {
        self.cred_helpers
            .get(&host_key(registry))
            .or(self.creds_store.as_ref())
            .map(String::as_str)
    }

    /// Credential for `registry`, anonymous when there is none.
    ///
    /// A helper that fails or knows nothing about the host falls back to `auths`.
    pub async fn resolve(&self, registry: &str) -> Credential {
        let key = host_key(registry);
        if let Some(helper) = self.helper_for(registry) {
            match self.run_helper(helper, &key).await {
                Ok(Some(credential)) => {
                    debug!(registry = %key, helper, mode = credential.mode(), "credential from helper");
                    return credential;
                }
                Ok(None) => debug!(registry = %key, helper, "helper has no credential"),
                Err(e) => warn!(registry = %key, helper, error = %e, "credential helper failed"),
            }
        }
        self.stored(&key)
    }

    fn stored(&self, key: &str) -> Credential {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    async fn run_helper(&self, helper: &str, key: &str) -> Result<Option<Credential>> {
        let program = format!("docker-credential-{}", helper);
        let program = match &self.helper_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        };
        let server = if key == DOCKER_HUB_REGISTRY {
            DOCKER_HUB_HELPER_URL
        } else {
            key
        };

        let mut child = Command::new(&program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SyncerError::Io(format!("cannot run {}: {}", program.display(), e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // a helper may exit without reading stdin; its reply decides
            if let Err(e) = stdin.write_all(server.as_bytes()).await {
                debug!(helper = %program.display(), error = %e, "helper closed stdin early");
            }
        }

        let output = tokio::time::timeout(HELPER_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| SyncerError::Io(format!("{} timed out", program.display())))??;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("credentials not found") {
                return Ok(None);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncerError::Auth(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                format!("{} {}", stdout.trim(), stderr.trim()).trim()
            )));
        }

        let reply: HelperCredential = serde_json::from_slice(&output.stdout)
            .map_err(|e| SyncerError::Decode(format!("invalid credential helper reply: {}", e)))?;
        Ok(reply.credential())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keys are compared by host; every Docker Hub alias shares one key
fn host_key(registry: &str) -> String {
    if is_dockerhub_registry(registry) {
        DOCKER_HUB_REGISTRY.to_string()
    } else {
        registry_host(registry).to_ascii_lowercase()
    }
}
