//! Tencent Cloud credentials and where to find them
//!
//! [`CredentialProvider::discover`] walks the usual sources in order:
//!
//! 1. `TENCENTCLOUD_SECRET_ID` / `TENCENTCLOUD_SECRET_KEY`
//! 2. `~/.tencentcloud/credentials` (`[default]` profile)
//! 3. the CAM role bound to the CVM instance, via the metadata service
//! 4. `~/.tccli/default.credential`
//!
//! Role credentials are temporary. They carry a session token and are
//! fetched again shortly before they expire.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// Metadata service base URL on CVM instances
pub const CVM_METADATA_ENDPOINT: &str = "http://metadata.tencentyun.com";

const SECURITY_CREDENTIALS_PATH: &str = "latest/meta-data/cam/security-credentials";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Role credentials closer than this to expiry are fetched again
const REFRESH_MARGIN_SECS: i64 = 300;

/// API key pair, with a session token for temporary credentials
#[derive(Clone)]
pub struct Credential {
    pub(super) secret_id: String,
    pub(super) secret_key: String,
    pub(super) token: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TccliCredential {
    secret_id: String,
    secret_key: String,
}

impl Credential {
    /// Create a credential from an explicit key pair
    pub fn new(secret_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
            token: None,
        }
    }

    /// Attach the session token of a temporary credential
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Read `TENCENTCLOUD_SECRET_ID` / `TENCENTCLOUD_SECRET_KEY`
    pub fn from_env() -> Option<Self> {
        let id = std::env::var("TENCENTCLOUD_SECRET_ID").ok()?;
        let key = std::env::var("TENCENTCLOUD_SECRET_KEY").ok()?;
        (!id.is_empty() && !key.is_empty()).then(|| Self::new(id, key))
    }

    /// Read a tccli credential file (`{"secretId": ..., "secretKey": ...}`)
    pub fn from_tccli_file(path: &Path) -> Result<Self> {
        let raw = read_credential_file(path)?;
        let profile: TccliCredential = serde_json::from_str(&raw).map_err(|e| {
            Error::validation(format!("invalid credential file {}: {e}", path.display()))
        })?;
        Ok(Self::new(profile.secret_id, profile.secret_key))
    }

    /// Read the `[default]` profile of a `~/.tencentcloud/credentials` file
    pub fn from_profile_file(path: &Path) -> Result<Self> {
        let raw = read_credential_file(path)?;
        parse_profile(&raw, "default").ok_or_else(|| {
            Error::validation(format!(
                "credential file {} has no secret_id/secret_key in [default]",
                path.display()
            ))
        })
    }
}

fn read_credential_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::validation(format!("cannot read credential file {}: {e}", path.display()))
    })
}

/// Pick `secret_id` and `secret_key` out of one `[profile]` section
fn parse_profile(raw: &str, profile: &str) -> Option<Credential> {
    let mut in_profile = false;
    let mut secret_id = None;
    let mut secret_key = None;

    for line in raw.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "secret_id" => secret_id = Some(value),
            "secret_key" => secret_key = Some(value),
            _ => {}
        }
    }

    match (secret_id, secret_key) {
        (Some(id), Some(key)) if !id.is_empty() && !key.is_empty() => Some(Credential::new(id, key)),
        _ => None,
    }
}

/// Temporary credential and its unix expiry time
#[derive(Clone, Debug)]
struct RoleCredential {
    credential: Credential,
    expires_at: i64,
}

impl RoleCredential {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at - now > REFRESH_MARGIN_SECS
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentialResponse {
    #[serde(default)]
    code: String,
    tmp_secret_id: String,
    tmp_secret_key: String,
    token: String,
    expired_time: i64,
}

fn parse_role_credential(body: &str) -> Result<RoleCredential> {
    let response: RoleCredentialResponse = serde_json::from_str(body)
        .map_err(|e| Error::serialization(format!("invalid CVM role credential: {e}")))?;
    if response.code != "Success" {
        return Err(Error::identity(format!(
            "CVM role credential request returned {}",
            response.code
        )));
    }
    Ok(RoleCredential {
        credential: Credential::new(response.tmp_secret_id, response.tmp_secret_key)
            .with_token(response.token),
        expires_at: response.expired_time,
    })
}

/// CAM role credentials served by the CVM metadata service
#[derive(Debug)]
pub struct CvmRole {
    http: reqwest::Client,
    endpoint: String,
    role: String,
    cached: Mutex<Option<RoleCredential>>,
}

impl CvmRole {
    /// Find the role bound to this instance and fetch its first credential
    ///
    /// Fails quickly when `endpoint` is unreachable, i.e. off CVM.
    pub async fn detect(endpoint: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| Error::validation(format!("failed to create HTTP client: {e}")))?;
        let endpoint = endpoint.trim_end_matches('/').to_string();

        let roles = get_text(&http, &format!("{endpoint}/{SECURITY_CREDENTIALS_PATH}/")).await?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::identity("no CAM role bound to this instance"))?
            .to_string();

        let this = Self {
            http,
            endpoint,
            role,
            cached: Mutex::new(None),
        };
        this.credential().await?;
        Ok(this)
    }

    /// Name of the bound role
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Current credential, fetched again when close to expiry
    pub async fn credential(&self) -> Result<Credential> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now().timestamp();
        if let Some(current) = cached.as_ref().filter(|c| c.is_fresh(now)) {
            return Ok(current.credential.clone());
        }

        let url = format!("{}/{SECURITY_CREDENTIALS_PATH}/{}", self.endpoint, self.role);
        let fresh = parse_role_credential(&get_text(&self.http, &url).await?)?;
        debug!(role = %self.role, expires_at = fresh.expires_at, "fetched CVM role credential");

        let credential = fresh.credential.clone();
        *cached = Some(fresh);
        Ok(credential)
    }
}

async fn get_text(http: &reqwest::Client, url: &str) -> Result<String> {
    http.get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| Error::identity(format!("metadata request {url}: {e}")))?
        .text()
        .await
        .map_err(|e| Error::identity(format!("metadata request {url}: {e}")))
}

/// Source of the credential used to sign each request
#[derive(Debug)]
pub enum CredentialProvider {
    /// Long-lived key pair
    Static(Credential),
    /// Temporary credential of the instance's CAM role
    CvmRole(CvmRole),
}

impl From<Credential> for CredentialProvider {
    fn from(credential: Credential) -> Self {
        Self::Static(credential)
    }
}

impl CredentialProvider {
    /// Walk the credential sources in order and keep the first one found
    pub async fn discover() -> Result<Self> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self::discover_in(home.as_deref(), CVM_METADATA_ENDPOINT).await
    }

    async fn discover_in(home: Option<&Path>, metadata_endpoint: &str) -> Result<Self> {
        if let Some(credential) = Credential::from_env() {
            info!(source = "environment", "using Tencent Cloud credentials");
            return Ok(credential.into());
        }

        if let Some(path) = home.map(|h| h.join(".tencentcloud").join("credentials")) {
            if path.is_file() {
                info!(source = %path.display(), "using Tencent Cloud credentials");
                return Credential::from_profile_file(&path).map(Self::from);
            }
        }

        match CvmRole::detect(metadata_endpoint).await {
            Ok(role) => {
                info!(source = "cvm-role", role = %role.role(), "using Tencent Cloud credentials");
                return Ok(Self::CvmRole(role));
            }
            Err(e) => debug!(error = %e, "no CVM role credentials"),
        }

        if let Some(path) = home.map(|h| h.join(".tccli").join("default.credential")) {
            if path.is_file() {
                info!(source = %path.display(), "using Tencent Cloud credentials");
                return Credential::from_tccli_file(&path).map(Self::from);
            }
        }

        Err(Error::validation(
            "no Tencent Cloud credentials found in the environment, \
             ~/.tencentcloud/credentials, the CVM role, or ~/.tccli/default.credential",
        ))
    }

    /// Credential to sign the next request with
    pub async fn credential(&self) -> Result<Credential> {
        match self {
            Self::Static(credential) => Ok(credential.clone()),
            Self::CvmRole(role) => role.credential().await,
        }
    }
}
