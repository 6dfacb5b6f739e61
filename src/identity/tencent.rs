//! Tencent Cloud API client for TKE and CAM
//!
//! Requests are JSON POSTs signed with TC3-HMAC-SHA256. Only the three calls
//! the controller needs are implemented.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::credential::{Credential, CredentialProvider};
use super::{CommonName, IdentityService};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "TC3-HMAC-SHA256";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const SIGNED_HEADERS: &str = "content-type;host";

const TKE_SERVICE: &str = "tke";
const TKE_VERSION: &str = "2018-05-25";
const CAM_SERVICE: &str = "cam";
const CAM_VERSION: &str = "2019-01-16";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DESCRIBE_CLUSTERS_PAGE: usize = 100;

/// Regions the client accepts
pub const KNOWN_REGIONS: &[&str] = &[
    "ap-bangkok",
    "ap-beijing",
    "ap-chengdu",
    "ap-chongqing",
    "ap-guangzhou",
    "ap-guangzhou-open",
    "ap-hongkong",
    "ap-mumbai",
    "ap-nanjing",
    "ap-seoul",
    "ap-shanghai",
    "ap-shanghai-fsi",
    "ap-shenzhen-fsi",
    "ap-singapore",
    "ap-tokyo",
    "eu-frankfurt",
    "eu-moscow",
    "na-ashburn",
    "na-siliconvalley",
    "na-toronto",
];

/// Client for one region
pub struct TencentCloudClient {
    credentials: Arc<CredentialProvider>,
    region: String,
    http: reqwest::Client,
}

impl TencentCloudClient {
    /// Create a client for `region`
    pub fn new(credentials: Arc<CredentialProvider>, region: &str) -> Result<Self> {
        if !KNOWN_REGIONS.contains(&region) {
            return Err(Error::validation(format!("unknown region: {region}")));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::validation(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            credentials,
            region: region.to_string(),
            http,
        })
    }

    /// Region this client signs requests for
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Find the id of the TKE cluster named `cluster_name`
    pub async fn find_cluster_id(&self, cluster_name: &str) -> Result<Option<String>> {
        let mut offset = 0usize;
        loop {
            let page: DescribeClustersResponse = self
                .call(
                    TKE_SERVICE,
                    TKE_VERSION,
                    "DescribeClusters",
                    &json!({ "Offset": offset, "Limit": DESCRIBE_CLUSTERS_PAGE }),
                )
                .await?;

            if let Some(cluster) = page.clusters.iter().find(|c| c.cluster_name == cluster_name) {
                return Ok(Some(cluster.cluster_id.clone()));
            }

            offset += page.clusters.len();
            if page.clusters.is_empty() || offset >= page.total_count {
                return Ok(None);
            }
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        service: &str,
        version: &str,
        action: &str,
        payload: &Value,
    ) -> Result<T> {
        let host = format!("{service}.tencentcloudapi.com");
        let body = payload.to_string();
        let credential = self.credentials.credential().await?;
        let timestamp = Utc::now().timestamp();
        let authorization = sign(&credential, service, &host, &body, timestamp);

        debug!(%service, %action, region = %self.region, "calling identity service");

        let mut request = self
            .http
            .post(format!("https://{host}"))
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("Host", &host)
            .header("X-TC-Action", action)
            .header("X-TC-Version", version)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Region", &self.region);
        if let Some(token) = &credential.token {
            request = request.header("X-TC-Token", token);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::identity(format!("{action}: {e}")))?;

        let text = response
            .text()
            .await
            .map_err(|e| Error::identity(format!("{action}: {e}")))?;
        parse_response(action, &text)
    }
}

#[async_trait]
impl IdentityService for TencentCloudClient {
    async fn describe_common_names(
        &self,
        cluster_id: &str,
        sub_account_ids: &[String],
    ) -> Result<Vec<CommonName>> {
        let response: DescribeCommonNamesResponse = self
            .call(
                TKE_SERVICE,
                TKE_VERSION,
                "DescribeClusterCommonNames",
                &json!({ "ClusterId": cluster_id, "SubaccountUins": sub_account_ids }),
            )
            .await?;

        Ok(response
            .common_names
            .into_iter()
            .map(|c| CommonName {
                sub_account_id: c.subaccount_uin,
                name: c.cn,
            })
            .collect())
    }

    async fn lookup_sub_account_id(&self, user_name: &str) -> Result<String> {
        let response: GetUserResponse = self
            .call(CAM_SERVICE, CAM_VERSION, "GetUser", &json!({ "Name": user_name }))
            .await?;
        Ok(response.uin.to_string())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeCommonNamesResponse {
    #[serde(default)]
    common_names: Vec<CommonNameEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonNameEntry {
    subaccount_uin: String,
    #[serde(rename = "CN")]
    cn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetUserResponse {
    uin: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeClustersResponse {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    clusters: Vec<ClusterEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClusterEntry {
    cluster_id: String,
    cluster_name: String,
}

/// Unwrap the `{"Response": {...}}` envelope, surfacing API errors
fn parse_response<T: DeserializeOwned>(action: &str, text: &str) -> Result<T> {
    let mut envelope: Value = serde_json::from_str(text)
        .map_err(|e| Error::serialization(format!("{action}: invalid response: {e}")))?;
    let response = envelope
        .get_mut("Response")
        .map(Value::take)
        .ok_or_else(|| Error::serialization(format!("{action}: response has no Response field")))?;

    if let Some(err) = response.get("Error") {
        let code = err.get("Code").and_then(Value::as_str).unwrap_or("Unknown");
        let message = err.get("Message").and_then(Value::as_str).unwrap_or_default();
        return Err(Error::identity(format!("{action}: {code}: {message}")));
    }

    serde_json::from_value(response)
        .map_err(|e| Error::serialization(format!("{action}: unexpected response shape: {e}")))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Build the TC3-HMAC-SHA256 `Authorization` header value
fn sign(credential: &Credential, service: &str, host: &str, payload: &str, timestamp: i64) -> String {
    let date = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string();

    let canonical_request = format!(
        "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{host}\n\n{SIGNED_HEADERS}\n{}",
        sha256_hex(payload.as_bytes())
    );
    let scope = format!("{date}/{service}/tc3_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{timestamp}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let secret_date = hmac_sha256(
        format!("TC3{}", credential.secret_key).as_bytes(),
        date.as_bytes(),
    );
    let secret_service = hmac_sha256(&secret_date, service.as_bytes());
    let secret_signing = hmac_sha256(&secret_service, b"tc3_request");
    let signature = hex::encode(hmac_sha256(&secret_signing, string_to_sign.as_bytes()));

    format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
        credential.secret_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: i64 = 1_700_000_000; // 2023-11-14 UTC

    fn credential() -> Credential {
        Credential::new("AKIDexample", "secret")
    }

    #[test]
    fn test_authorization_header_shape() {
        let auth = sign(&credential(), "tke", "tke.tencentcloudapi.com", "{}", TS);

        assert!(auth.starts_with(
            "TC3-HMAC-SHA256 Credential=AKIDexample/2023-11-14/tke/tc3_request, \
             SignedHeaders=content-type;host, Signature="
        ));
        let signature = auth.rsplit("Signature=").next().expect("signature");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_depends_on_payload_and_key() {
        let host = "cam.tencentcloudapi.com";
        let a = sign(&credential(), "cam", host, r#"{"Name":"a@x.com"}"#, TS);
        let same = sign(&credential(), "cam", host, r#"{"Name":"a@x.com"}"#, TS);
        let other_payload = sign(&credential(), "cam", host, r#"{"Name":"b@x.com"}"#, TS);
        let other_key = sign(
            &Credential::new("AKIDexample", "other"),
            "cam",
            host,
            r#"{"Name":"a@x.com"}"#,
            TS,
        );

        assert_eq!(a, same);
        assert_ne!(a, other_payload);
        assert_ne!(a, other_key);
    }

    #[test]
    fn test_parse_common_names_response() {
        let body = r#"{"Response":{"CommonNames":[
            {"SubaccountUin":"100000000001","CN":"100000000001-1700000000"}
        ],"RequestId":"req-1"}}"#;

        let parsed: DescribeCommonNamesResponse =
            parse_response("DescribeClusterCommonNames", body).expect("should parse");
        assert_eq!(parsed.common_names.len(), 1);
        assert_eq!(parsed.common_names[0].subaccount_uin, "100000000001");
        assert_eq!(parsed.common_names[0].cn, "100000000001-1700000000");
    }

    #[test]
    fn test_parse_api_error_response() {
        let body = r#"{"Response":{"Error":{"Code":"RequestLimitExceeded",
            "Message":"too many requests"},"RequestId":"req-2"}}"#;

        let err = parse_response::<GetUserResponse>("GetUser", body)
            .err()
            .expect("should fail");
        assert!(matches!(err, Error::Identity(_)));
        assert!(err.to_string().contains("RequestLimitExceeded"));
    }

    #[test]
    fn test_parse_get_user_numeric_uin() {
        let body = r#"{"Response":{"Uin":100000000001,"Name":"a@x.com","RequestId":"r"}}"#;
        let parsed: GetUserResponse = parse_response("GetUser", body).expect("should parse");
        assert_eq!(parsed.uin, 100000000001);
    }

    #[test]
    fn test_parse_rejects_missing_envelope() {
        let err = parse_response::<GetUserResponse>("GetUser", r#"{"Uin":1}"#)
            .err()
            .expect("should fail");
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_unknown_region_is_rejected() {
        let credentials = Arc::new(CredentialProvider::from(credential()));
        assert!(TencentCloudClient::new(credentials.clone(), "ap-seoul").is_ok());
        assert!(TencentCloudClient::new(credentials, "us-east-1").is_err());
    }
}
