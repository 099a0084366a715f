//! Google Cloud Storage adapter.
//!
//! Talks to the GCS JSON API with `reqwest`.  Objects live under
//! `{prefix}/{key}` in a single bucket.  Conditional writes use the
//! `ifGenerationMatch` query parameter, which GCS evaluates atomically;
//! `ifGenerationMatch=0` means "only if no live object exists".
//!
//! Credentials are resolved in order:
//!   - the target's `credentials_file` (service account or ADC JSON)
//!   - `GOOGLE_APPLICATION_CREDENTIALS` environment variable
//!   - gcloud CLI auth (`gcloud auth application-default login`)
//!   - `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable
//!   - GCE metadata server (when running on Google Cloud)
//!
//! A target with a custom `endpoint` (fake-gcs-server) and no credentials
//! file sends unauthenticated requests.

use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::{
    list_prefix, object_name, quote_etag, relative_key, ListPage, ObjectInfo, ObjectMeta,
    PutOptions, StorageBackend, StoreFuture, StoredObject, WriteCondition,
};
use super::condition::{
    classify_failure, failure_to_error, translate, FailureClass, NativePrecondition,
};
use crate::config::{BackendType, TargetConfig};
use crate::errors::StoreError;

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// OAuth2 scope for object reads and writes.
const GCS_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

// -- GCS JSON API response types -----------------------------------------------

/// Object resource. GCS encodes 64-bit integers as strings.
#[derive(Debug, Deserialize)]
struct GcsObject {
    name: Option<String>,
    generation: Option<String>,
    size: Option<String>,
    etag: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsListResponse {
    items: Option<Vec<GcsObject>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorItem {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    code: Option<u16>,
    message: Option<String>,
    #[serde(default)]
    errors: Vec<GcsErrorItem>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

/// Metadata part of a multipart upload.
#[derive(Debug, Serialize)]
struct UploadMetadata<'a> {
    name: &'a str,
    #[serde(rename = "contentType")]
    content_type: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: &'a BTreeMap<String, String>,
}

/// Service account JWT claims for the OAuth2 JWT-bearer grant.
#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

// -- Token management ---------------------------------------------------------

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// Why an access token could not be obtained.
#[derive(Debug, thiserror::Error)]
enum AuthError {
    /// The token endpoint could not be reached, or its answer not read.
    #[error("{0}")]
    Unreachable(String),
    /// The token endpoint answered with an error status.
    #[error("token endpoint returned {status}: {message}")]
    Status { status: u16, message: String },
    /// Missing, unreadable or rejected credentials.
    #[error("{0}")]
    Credentials(String),
}

impl AuthError {
    fn status(&self) -> Option<u16> {
        match self {
            AuthError::Status { status, .. } => Some(*status),
            AuthError::Unreachable(_) | AuthError::Credentials(_) => None,
        }
    }

    /// Throttled, timed out or failing token endpoints are retryable.
    /// Anything else about auth is fatal, never a statement about the object.
    fn class(&self) -> FailureClass {
        match self {
            AuthError::Unreachable(_) => FailureClass::Transient,
            AuthError::Status { status, .. } => {
                match classify_failure(BackendType::Gcs, Some(*status), None) {
                    FailureClass::Transient => FailureClass::Transient,
                    _ => FailureClass::Fatal,
                }
            }
            AuthError::Credentials(_) => FailureClass::Fatal,
        }
    }
}

/// Adapter that forwards operations to a GCS bucket.
pub struct GcsBackend {
    /// Target name, for errors and logs.
    target: String,
    client: reqwest::Client,
    bucket: String,
    /// Key prefix for all objects in the bucket.
    prefix: String,
    /// JSON API base (`https://storage.googleapis.com` or an emulator).
    api_base: String,
    kms_key: Option<String>,
    credentials_file: Option<String>,
    /// Send no Authorization header (emulator endpoints).
    anonymous: bool,
    /// Cached OAuth2 access token; the lock also serializes refreshes.
    token_cache: Mutex<Option<CachedToken>>,
}

impl GcsBackend {
    /// Build the adapter from a validated target configuration.
    ///
    /// Credentials are resolved lazily on first API call.
    pub fn new(config: &TargetConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| StoreError::Config(format!("failed to create HTTP client: {e}")))?;

        let api_base = config
            .endpoint
            .as_deref()
            .unwrap_or(GCS_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let anonymous = config.endpoint.is_some() && config.credentials_file.is_none();

        info!(
            "GCS backend initialized: target={} bucket={} prefix='{}' anonymous={}",
            config.name, config.bucket, config.prefix, anonymous
        );

        Ok(Self {
            target: config.name.clone(),
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            api_base,
            kms_key: config.kms_key.clone(),
            credentials_file: config.credentials_file.clone(),
            anonymous,
            token_cache: Mutex::new(None),
        })
    }

    fn gcs_name(&self, key: &str) -> String {
        object_name(&self.prefix, key)
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.api_base,
            url_encode(&self.bucket),
            url_encode(name)
        )
    }

    fn failure(
        &self,
        key: &str,
        operation: &'static str,
        class: FailureClass,
        status: Option<u16>,
        message: String,
    ) -> StoreError {
        failure_to_error(class, &self.target, key, operation, status, message)
    }

    fn auth_failure(&self, key: &str, operation: &'static str, err: AuthError) -> StoreError {
        self.failure(key, operation, err.class(), err.status(), format!("GCS auth: {err}"))
    }

    /// Get an OAuth2 access token, refreshing the cached one when it is
    /// within 60s of expiry.
    async fn get_access_token(&self) -> Result<String, AuthError> {
        let mut cache = self.token_cache.lock().await;
        if let Some(ref cached) = *cache {
            if cached.expiry > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let (token, expires_in) = self.fetch_access_token().await?;
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        *cache = Some(CachedToken {
            access_token: token.clone(),
            expiry,
        });
        Ok(token)
    }

    /// Fetch a fresh access token from the credential source.
    async fn fetch_access_token(&self) -> Result<(String, u64), AuthError> {
        if let Some(ref path) = self.credentials_file {
            return self.token_from_credentials_file(path).await;
        }

        if let Ok(creds_path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return self.token_from_credentials_file(&creds_path).await;
        }

        let adc_path = application_default_credentials_path();
        if let Ok(true) = tokio::fs::try_exists(&adc_path).await {
            return self.token_from_credentials_file(&adc_path).await;
        }

        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok((token, 3600));
        }

        self.token_from_metadata_server().await
    }

    /// Obtain an access token from a service account key or ADC user
    /// credentials file.
    async fn token_from_credentials_file(
        &self,
        path: &str,
    ) -> Result<(String, u64), AuthError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| {
                AuthError::Credentials(format!("failed to read credentials file {path}: {e}"))
            })?;

        let creds: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| {
                AuthError::Credentials(format!("failed to parse credentials file {path}: {e}"))
            })?;

        let field = |name: &str| creds.get(name).and_then(|v| v.as_str()).unwrap_or("");

        match field("type") {
            "service_account" => {
                let client_email = field("client_email");
                let private_key = field("private_key");
                if client_email.is_empty() || private_key.is_empty() {
                    return Err(AuthError::Credentials(format!(
                        "service account key {path} is missing client_email or private_key"
                    )));
                }
                let token_uri = match field("token_uri") {
                    "" => DEFAULT_TOKEN_URI,
                    uri => uri,
                };
                self.token_from_service_account(client_email, private_key, token_uri)
                    .await
            }
            "authorized_user" => {
                self.token_from_refresh(
                    field("client_id"),
                    field("client_secret"),
                    field("refresh_token"),
                )
                .await
            }
            other => Err(AuthError::Credentials(format!(
                "unsupported credential type in {path}: {other:?}"
            ))),
        }
    }

    /// Sign an RS256 JWT with the service account key and exchange it for
    /// an access token.
    async fn token_from_service_account(
        &self,
        client_email: &str,
        private_key_pem: &str,
        token_uri: &str,
    ) -> Result<(String, u64), AuthError> {
        let assertion = service_account_jwt(client_email, private_key_pem, token_uri, unix_now())
            .map_err(AuthError::Credentials)?;
        let resp = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(format!("token request failed: {e}")))?;
        parse_token_response(resp).await
    }

    /// Exchange a refresh token for an access token.
    async fn token_from_refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<(String, u64), AuthError> {
        let resp = self
            .client
            .post(DEFAULT_TOKEN_URI)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(format!("token refresh request failed: {e}")))?;
        parse_token_response(resp).await
    }

    /// Obtain an access token from the GCE metadata server.
    async fn token_from_metadata_server(&self) -> Result<(String, u64), AuthError> {
        let resp = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                warn!("GCE metadata server unreachable: {e}");
                AuthError::Unreachable(format!(
                    "metadata server request failed: {e}. Set credentials_file, \
                     GOOGLE_APPLICATION_CREDENTIALS, or GOOGLE_OAUTH_ACCESS_TOKEN"
                ))
            })?;
        parse_token_response(resp).await
    }

    /// Send a request with auth, turning non-2xx responses into neutral
    /// errors.
    async fn send(
        &self,
        operation: &'static str,
        key: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let req = if self.anonymous {
            req
        } else {
            let token = self
                .get_access_token()
                .await
                .map_err(|e| self.auth_failure(key, operation, e))?;
            req.header(AUTHORIZATION, format!("Bearer {token}"))
        };

        let resp = req.send().await.map_err(|e| {
            let class = if e.is_builder() {
                FailureClass::Fatal
            } else {
                FailureClass::Transient
            };
            self.failure(key, operation, class, None, format!("GCS request failed: {e}"))
        })?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let (reason, message) = parse_gcs_error(status, &body);
        let class = classify_failure(BackendType::Gcs, Some(status), reason.as_deref());
        Err(self.failure(key, operation, class, Some(status), message))
    }

    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        precondition: Option<NativePrecondition>,
        opts: &PutOptions,
    ) -> Result<ObjectMeta, StoreError> {
        let name = self.gcs_name(key);
        let operation = if precondition.is_some() {
            "conditional_put"
        } else {
            "put"
        };

        debug!(
            "GCS upload: bucket={} object={} precondition={:?}",
            self.bucket, name, precondition
        );

        let metadata = UploadMetadata {
            name: &name,
            content_type: opts.content_type_or_default(),
            metadata: &opts.metadata,
        };
        let metadata_json = serde_json::to_vec(&metadata).map_err(|e| {
            self.failure(key, operation, FailureClass::Fatal, None, e.to_string())
        })?;
        let boundary = format!("activestore-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related(
            &boundary,
            &metadata_json,
            opts.content_type_or_default(),
            &data,
        );

        let mut query: Vec<(&str, String)> = vec![("uploadType", "multipart".to_string())];
        match precondition {
            Some(NativePrecondition::IfGenerationMatch(generation)) => {
                query.push(("ifGenerationMatch", generation.to_string()))
            }
            // The translator never produces these for GCS.
            Some(NativePrecondition::IfMatch(_))
            | Some(NativePrecondition::IfNoneMatchAny)
            | Some(NativePrecondition::LeaseId(_))
            | None => {}
        }
        if let Some(kms_key) = opts.kms_key.as_ref().or(self.kms_key.as_ref()) {
            query.push(("kmsKeyName", kms_key.clone()));
        }

        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.api_base,
            url_encode(&self.bucket)
        );
        let req = self
            .client
            .request(Method::POST, &url)
            .query(&query)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body);

        let resp = self.send(operation, key, req).await?;
        let object: GcsObject = resp.json().await.map_err(|e| {
            self.failure(
                key,
                operation,
                FailureClass::Transient,
                None,
                format!("GCS upload response unreadable: {e}"),
            )
        })?;
        self.meta_from_object(key, operation, &object)
    }

    /// Convert an object resource, rejecting resources without a usable
    /// generation.
    fn meta_from_object(
        &self,
        key: &str,
        operation: &'static str,
        object: &GcsObject,
    ) -> Result<ObjectMeta, StoreError> {
        let generation = object
            .generation
            .as_deref()
            .and_then(|g| g.parse::<i64>().ok())
            .unwrap_or(0);
        self.require_generation(key, operation, generation)?;
        Ok(ObjectMeta {
            etag: object.etag.as_deref().map(quote_etag).unwrap_or_default(),
            generation,
            size: object
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_modified: object.updated.clone(),
            content_type: object.content_type.clone(),
        })
    }

    /// Generation 0 is reserved for "must not exist"; an existing object
    /// reported with it cannot be versioned safely.
    fn require_generation(
        &self,
        key: &str,
        operation: &'static str,
        generation: i64,
    ) -> Result<(), StoreError> {
        if generation > 0 {
            Ok(())
        } else {
            Err(self.failure(
                key,
                operation,
                FailureClass::Fatal,
                None,
                format!("GCS reported invalid generation {generation} for an existing object"),
            ))
        }
    }
}

/// URL-encode a bucket or object name for use in API paths.
fn url_encode(name: &str) -> String {
    percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// Get the path to gcloud application-default credentials.
fn application_default_credentials_path() -> String {
    if let Ok(config_dir) = std::env::var("CLOUDSDK_CONFIG") {
        return format!("{config_dir}/application_default_credentials.json");
    }
    if let Ok(home) = std::env::var("HOME") {
        return format!("{home}/.config/gcloud/application_default_credentials.json");
    }
    ".config/gcloud/application_default_credentials.json".to_string()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build the signed assertion for the JWT-bearer grant. Valid for one hour.
fn service_account_jwt(
    client_email: &str,
    private_key_pem: &str,
    token_uri: &str,
    now: u64,
) -> Result<String, String> {
    let claims = JwtClaims {
        iss: client_email,
        scope: GCS_SCOPE,
        aud: token_uri,
        iat: now,
        exp: now + 3600,
    };
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| format!("invalid service account private key: {e}"))?;
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
        &claims,
        &key,
    )
    .map_err(|e| format!("failed to sign service account JWT: {e}"))
}

/// Read `access_token` / `expires_in` from an OAuth2 token response.
async fn parse_token_response(resp: reqwest::Response) -> Result<(String, u64), AuthError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AuthError::Status {
            status: status.as_u16(),
            message: body,
        });
    }
    let token_resp: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| AuthError::Unreachable(format!("token response unreadable: {e}")))?;
    token_fields(&token_resp).map_err(AuthError::Credentials)
}

fn token_fields(token_resp: &serde_json::Value) -> Result<(String, u64), String> {
    let access_token = token_resp
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "no access_token in token response".to_string())?
        .to_string();
    let expires_in = token_resp
        .get("expires_in")
        .and_then(|v| v.as_u64())
        .unwrap_or(3600);
    Ok((access_token, expires_in))
}

/// Extract the first error reason and a readable message from a GCS error
/// body.
fn parse_gcs_error(status: u16, body: &str) -> (Option<String>, String) {
    if let Ok(err_resp) = serde_json::from_str::<GcsErrorResponse>(body) {
        if let Some(err) = err_resp.error {
            let reason = err.errors.into_iter().find_map(|e| e.reason);
            let message = format!(
                "HTTP {} {}: {}",
                err.code.unwrap_or(status),
                reason.as_deref().unwrap_or("error"),
                err.message.unwrap_or_default()
            );
            return (reason, message);
        }
    }
    (None, format!("HTTP {status}: {}", body.trim()))
}

/// Assemble a `multipart/related` upload body: JSON metadata then media.
fn multipart_related(
    boundary: &str,
    metadata_json: &[u8],
    content_type: &str,
    data: &[u8],
) -> Bytes {
    let mut body = BytesMut::with_capacity(metadata_json.len() + data.len() + 256);
    body.put_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.put_slice(metadata_json);
    body.put_slice(format!("\r\n--{boundary}\r\nContent-Type: {content_type}\r\n\r\n").as_bytes());
    body.put_slice(data);
    body.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body.freeze()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Version metadata from a media download's response headers.
fn meta_from_media_headers(headers: &HeaderMap, body_len: usize) -> ObjectMeta {
    ObjectMeta {
        etag: header_str(headers, "etag").map(quote_etag).unwrap_or_default(),
        generation: header_str(headers, "x-goog-generation")
            .and_then(|g| g.parse().ok())
            .unwrap_or(0),
        size: header_str(headers, "x-goog-stored-content-length")
            .and_then(|s| s.parse().ok())
            .unwrap_or(body_len as u64),
        last_modified: header_str(headers, "last-modified").map(str::to_string),
        content_type: header_str(headers, "content-type").map(str::to_string),
    }
}

impl StorageBackend for GcsBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Gcs
    }

    fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        let opts = opts.clone();
        Box::pin(async move { self.upload(&key, data, None, &opts).await })
    }

    fn get(&self, key: &str) -> StoreFuture<'_, StoredObject> {
        let key = key.to_string();
        Box::pin(async move {
            let name = self.gcs_name(&key);

            debug!("GCS download: bucket={} object={}", self.bucket, name);

            let req = self
                .client
                .get(self.object_url(&name))
                .query(&[("alt", "media")]);
            let resp = self.send("get", &key, req).await?;
            let headers = resp.headers().clone();
            let data = resp.bytes().await.map_err(|e| {
                self.failure(
                    &key,
                    "get",
                    FailureClass::Transient,
                    None,
                    format!("GCS download body read failed: {e}"),
                )
            })?;
            let meta = meta_from_media_headers(&headers, data.len());
            self.require_generation(&key, "get", meta.generation)?;

            Ok(StoredObject { data, meta })
        })
    }

    fn head(&self, key: &str) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        Box::pin(async move {
            let name = self.gcs_name(&key);

            debug!("GCS metadata: bucket={} object={}", self.bucket, name);

            let resp = self
                .send("head", &key, self.client.get(self.object_url(&name)))
                .await?;
            let object: GcsObject = resp.json().await.map_err(|e| {
                self.failure(
                    &key,
                    "head",
                    FailureClass::Transient,
                    None,
                    format!("GCS metadata response unreadable: {e}"),
                )
            })?;
            self.meta_from_object(&key, "head", &object)
        })
    }

    fn delete(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let name = self.gcs_name(&key);

            debug!("GCS delete: bucket={} object={}", self.bucket, name);

            // Idempotent: a missing object is already deleted.
            match self
                .send("delete", &key, self.client.delete(self.object_url(&name)))
                .await
            {
                Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreFuture<'_, ListPage> {
        let prefix = prefix.to_string();
        let page_token = token.map(str::to_string);
        Box::pin(async move {
            let list_prefix = list_prefix(&self.prefix, &prefix);

            debug!(
                "GCS list: bucket={} prefix={} page_token={:?}",
                self.bucket, list_prefix, page_token
            );

            let url = format!(
                "{}/storage/v1/b/{}/o",
                self.api_base,
                url_encode(&self.bucket)
            );
            let mut query: Vec<(&str, String)> = vec![(
                "fields",
                "items(name,size,etag),nextPageToken".to_string(),
            )];
            if !list_prefix.is_empty() {
                query.push(("prefix", list_prefix));
            }
            if let Some(token) = page_token {
                query.push(("pageToken", token));
            }

            let resp = self
                .send("list", &prefix, self.client.get(&url).query(&query))
                .await?;
            let page: GcsListResponse = resp.json().await.map_err(|e| {
                self.failure(
                    &prefix,
                    "list",
                    FailureClass::Transient,
                    None,
                    format!("GCS list response unreadable: {e}"),
                )
            })?;

            let entries = page
                .items
                .unwrap_or_default()
                .into_iter()
                .filter_map(|object| {
                    let name = object.name?;
                    let rel = relative_key(&self.prefix, &name)?;
                    Some(ObjectInfo {
                        key: rel.to_string(),
                        size: object
                            .size
                            .as_deref()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0),
                        etag: object.etag.as_deref().map(quote_etag).unwrap_or_default(),
                    })
                })
                .collect();

            Ok(ListPage {
                entries,
                next_token: page.next_page_token.filter(|t| !t.is_empty()),
            })
        })
    }

    fn conditional_put(
        &self,
        key: &str,
        data: Bytes,
        condition: &WriteCondition,
        opts: &PutOptions,
    ) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        let opts = opts.clone();
        let native = translate(condition, BackendType::Gcs);
        Box::pin(async move {
            let native = native?;
            match self.upload(&key, data, Some(native), &opts).await {
                Err(StoreError::NotFound { target, key }) => {
                    Err(StoreError::PreconditionFailed { target, key })
                }
                other => other,
            }
        })
    }
}

// -- Tests -------------------------------------------------------------------
