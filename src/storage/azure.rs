//! Azure Blob Storage adapter.
//!
//! Talks to the Blob REST API directly with `reqwest`.  Blobs live under
//! `{prefix}/{key}` in a single container.  Conditional writes use the
//! standard `If-Match` / `If-None-Match: *` headers on Put Blob; lease
//! conditions send `x-ms-lease-id`.  Failures are classified from the
//! `x-ms-error-code` response header.
//!
//! Credentials are resolved via:
//!   - `AZURE_STORAGE_KEY` environment variable (Shared Key auth)
//!   - `AZURE_STORAGE_CONNECTION_STRING` environment variable
//!   - `AZURE_STORAGE_SAS_TOKEN` environment variable (SAS token auth)
//!
//! Azure has no object generations: every [`ObjectMeta`] produced here has
//! `generation == 0` and is versioned by ETag alone.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::Method;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{
    list_prefix, object_name, quote_etag, relative_key, LeaseManager, ListPage, ObjectInfo,
    ObjectMeta, PutOptions, StorageBackend, StoreFuture, StoredObject, WriteCondition,
};
use super::condition::{
    classify_failure, failure_to_error, translate, FailureClass, NativePrecondition,
};
use crate::config::{BackendType, TargetConfig};
use crate::errors::StoreError;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Percent-encoding set for Azure blob names: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Adapter that forwards operations to an Azure Blob Storage container.
pub struct AzureBackend {
    /// Target name, for errors and logs.
    target: String,
    client: reqwest::Client,
    container: String,
    account: String,
    /// Key prefix for all blobs in the container.
    prefix: String,
    /// Blob service endpoint, without trailing slash.
    base_url: String,
    /// Path component of `base_url` (non-empty for Azurite-style
    /// endpoints such as `http://127.0.0.1:10000/devstoreaccount1`).
    base_path: String,
    encryption_scope: Option<String>,
    auth: AzureAuth,
}

/// Azure authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AzureAuth {
    /// Shared Key authentication using the storage account key.
    SharedKey { key_bytes: Vec<u8> },
    /// SAS token authentication (appended as query parameter).
    SasToken { token: String },
}

/// One Blob REST call before signing.
struct BlobRequest<'a> {
    method: Method,
    /// Blob name, or `None` for container-level calls.
    blob: Option<&'a str>,
    query: Vec<(&'static str, String)>,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Option<Bytes>,
}

impl<'a> BlobRequest<'a> {
    fn new(method: Method, blob: Option<&'a str>) -> Self {
        Self {
            method,
            blob,
            query: Vec::new(),
            headers: Vec::new(),
            content_type: None,
            body: None,
        }
    }

    fn query(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn header_value(&self, name: &str) -> &str {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }
}

impl AzureBackend {
    /// Build the adapter from a validated target configuration.
    pub fn new(config: &TargetConfig) -> Result<Self, StoreError> {
        let account = config
            .account
            .clone()
            .ok_or_else(|| {
                StoreError::Config(format!("target '{}': azure requires an account", config.name))
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| StoreError::Config(format!("failed to create HTTP client: {e}")))?;

        let base_url = match &config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", account),
        };
        let base_path = reqwest::Url::parse(&base_url)
            .map_err(|e| StoreError::Config(format!("invalid azure endpoint '{base_url}': {e}")))?
            .path()
            .trim_end_matches('/')
            .to_string();

        // Resolve credentials from environment.
        let auth = resolve_auth(|name| std::env::var(name).ok())?;

        info!(
            "Azure backend initialized: target={} container={} account={} prefix='{}'",
            config.name, config.bucket, account, config.prefix
        );

        Ok(Self {
            target: config.name.clone(),
            client,
            container: config.bucket.clone(),
            account,
            prefix: config.prefix.clone(),
            base_url,
            base_path,
            encryption_scope: config.encryption_scope.clone(),
            auth,
        })
    }

    fn blob_name(&self, key: &str) -> String {
        object_name(&self.prefix, key)
    }

    fn url(&self, blob: Option<&str>) -> String {
        match blob {
            Some(name) => {
                let encoded_blob =
                    percent_encoding::utf8_percent_encode(name, &AZURE_BLOB_ENCODE_SET).to_string();
                format!("{}/{}/{}", self.base_url, self.container, encoded_blob)
            }
            None => format!("{}/{}", self.base_url, self.container),
        }
    }

    /// Append SAS token to a URL if using SAS auth.
    fn maybe_append_sas(&self, url: String) -> String {
        match &self.auth {
            AzureAuth::SasToken { token } => {
                if url.contains('?') {
                    format!("{}&{}", url, token)
                } else {
                    format!("{}?{}", url, token)
                }
            }
            AzureAuth::SharedKey { .. } => url,
        }
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

    /// Sign and send `req`, turning any non-2xx response into a neutral
    /// error.
    async fn send(
        &self,
        operation: &'static str,
        key: &str,
        req: BlobRequest<'_>,
    ) -> Result<reqwest::Response, StoreError> {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        let url = self.maybe_append_sas(self.url(req.blob));
        let body = match (&req.body, &req.method) {
            (Some(body), _) => Some(body.clone()),
            (None, &Method::PUT) => Some(Bytes::new()),
            (None, _) => None,
        };

        let mut builder = self
            .client
            .request(req.method.clone(), &url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref content_type) = req.content_type {
            builder = builder.header("Content-Type", content_type.as_str());
        }

        if let AzureAuth::SharedKey { key_bytes } = &self.auth {
            let mut ms_headers = vec![
                ("x-ms-date".to_string(), date.clone()),
                ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
            ];
            ms_headers.extend(req.headers.iter().cloned());
            let mut resource_path = format!("{}/{}", self.base_path, self.container);
            if let Some(blob) = req.blob {
                resource_path.push('/');
                resource_path.push_str(blob);
            }
            let string_to_sign = string_to_sign(&SignParts {
                method: req.method.as_str(),
                content_length: body.as_ref().map_or(0, |b| b.len()),
                content_type: req.content_type.as_deref().unwrap_or(""),
                if_match: req.header_value("If-Match"),
                if_none_match: req.header_value("If-None-Match"),
                canonicalized_headers: canonicalized_headers(&ms_headers),
                canonicalized_resource: canonicalized_resource(
                    &self.account,
                    &resource_path,
                    &req.query,
                ),
            });
            let signature = sign(key_bytes, &string_to_sign).map_err(|e| {
                self.failure(key, operation, FailureClass::Fatal, None, e)
            })?;
            builder = builder.header(
                "Authorization",
                format!("SharedKey {}:{}", self.account, signature),
            );
        }

        if let Some(body) = body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(|e| {
            let class = if e.is_builder() {
                FailureClass::Fatal
            } else {
                FailureClass::Transient
            };
            self.failure(key, operation, class, None, format!("Azure request failed: {e}"))
        })?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let code = header_str(resp.headers(), "x-ms-error-code").map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        let class = classify_failure(BackendType::Azure, Some(status), code.as_deref());
        let message = match code {
            Some(code) => format!("HTTP {status} {code}: {}", error_message(&body)),
            None => format!("HTTP {status}"),
        };
        Err(self.failure(key, operation, class, Some(status), message))
    }

    async fn put_blob(
        &self,
        key: &str,
        data: Bytes,
        precondition: Option<NativePrecondition>,
        opts: &PutOptions,
    ) -> Result<ObjectMeta, StoreError> {
        let blob_name = self.blob_name(key);
        let size = data.len() as u64;
        let operation = if precondition.is_some() {
            "conditional_put"
        } else {
            "put"
        };

        debug!(
            "Azure put_blob: container={} blob={} precondition={:?}",
            self.container, blob_name, precondition
        );

        let mut req = BlobRequest::new(Method::PUT, Some(&blob_name))
            .header("x-ms-blob-type", "BlockBlob");
        req.content_type = Some(opts.content_type_or_default().to_string());
        req.body = Some(data);
        for (name, value) in &opts.metadata {
            req = req.header(format!("x-ms-meta-{}", name.to_lowercase()), value.clone());
        }
        if let Some(ref scope) = self.encryption_scope {
            req = req.header("x-ms-encryption-scope", scope.clone());
        }
        match precondition {
            Some(NativePrecondition::IfMatch(etag)) => req = req.header("If-Match", etag),
            Some(NativePrecondition::IfNoneMatchAny) => req = req.header("If-None-Match", "*"),
            Some(NativePrecondition::LeaseId(id)) => req = req.header("x-ms-lease-id", id),
            // The translator never produces generations for Azure.
            Some(NativePrecondition::IfGenerationMatch(_)) | None => {}
        }

        let resp = self.send(operation, key, req).await?;
        let mut meta = meta_from_headers(resp.headers());
        meta.size = size;
        meta.content_type = Some(opts.content_type_or_default().to_string());
        Ok(meta)
    }

    /// Delete Blob, optionally under a held lease. A missing blob counts as
    /// deleted.
    async fn delete_blob(&self, key: &str, lease_id: Option<String>) -> Result<(), StoreError> {
        let blob_name = self.blob_name(key);

        debug!(
            "Azure delete: container={} blob={} leased={}",
            self.container,
            blob_name,
            lease_id.is_some()
        );

        let mut req = BlobRequest::new(Method::DELETE, Some(&blob_name));
        if let Some(id) = lease_id {
            req = req.header("x-ms-lease-id", id);
        }
        match self.send("delete", key, req).await {
            Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn lease_call(
        &self,
        operation: &'static str,
        key: &str,
        action: &str,
        headers: Vec<(String, String)>,
    ) -> Result<HeaderMap, StoreError> {
        let blob_name = self.blob_name(key);

        debug!(
            "Azure lease {}: container={} blob={}",
            action, self.container, blob_name
        );

        let mut req = BlobRequest::new(Method::PUT, Some(&blob_name))
            .query("comp", "lease")
            .header("x-ms-lease-action", action);
        req.headers.extend(headers);
        let resp = self.send(operation, key, req).await?;
        Ok(resp.headers().clone())
    }
}

/// Resolve Azure authentication from environment-style lookups.
fn resolve_auth(lookup: impl Fn(&str) -> Option<String>) -> Result<AzureAuth, StoreError> {
    // 1. Try AZURE_STORAGE_KEY
    if let Some(key) = lookup("AZURE_STORAGE_KEY") {
        let key_bytes = BASE64_STANDARD.decode(key.trim()).map_err(|e| {
            StoreError::Config(format!("Invalid AZURE_STORAGE_KEY (not valid base64): {e}"))
        })?;
        return Ok(AzureAuth::SharedKey { key_bytes });
    }

    // 2. Try AZURE_STORAGE_CONNECTION_STRING (extract AccountKey)
    if let Some(conn_str) = lookup("AZURE_STORAGE_CONNECTION_STRING") {
        for part in conn_str.split(';') {
            if let Some(key_val) = part.trim().strip_prefix("AccountKey=") {
                let key_bytes = BASE64_STANDARD.decode(key_val).map_err(|e| {
                    StoreError::Config(format!("Invalid AccountKey in connection string: {e}"))
                })?;
                return Ok(AzureAuth::SharedKey { key_bytes });
            }
        }
    }

    // 3. Try AZURE_STORAGE_SAS_TOKEN
    if let Some(sas) = lookup("AZURE_STORAGE_SAS_TOKEN") {
        let token = sas.strip_prefix('?').unwrap_or(&sas).to_string();
        return Ok(AzureAuth::SasToken { token });
    }

    Err(StoreError::Config(
        "No Azure credentials found. Set AZURE_STORAGE_KEY, \
         AZURE_STORAGE_CONNECTION_STRING, or AZURE_STORAGE_SAS_TOKEN."
            .to_string(),
    ))
}

/// Inputs to the Shared Key string-to-sign.
struct SignParts<'a> {
    method: &'a str,
    content_length: usize,
    content_type: &'a str,
    if_match: &'a str,
    if_none_match: &'a str,
    canonicalized_headers: String,
    canonicalized_resource: String,
}

/// Build the Shared Key string-to-sign:
///
/// ```text
/// VERB\n
/// Content-Encoding\n
/// Content-Language\n
/// Content-Length\n
/// Content-MD5\n
/// Content-Type\n
/// Date\n
/// If-Modified-Since\n
/// If-Match\n
/// If-None-Match\n
/// If-Unmodified-Since\n
/// Range\n
/// CanonicalizedHeaders\n
/// CanonicalizedResource
/// ```
fn string_to_sign(parts: &SignParts<'_>) -> String {
    // Content-Length: empty for 0 (GET/DELETE/HEAD and empty PUTs).
    let content_length = match parts.content_length {
        0 => String::new(),
        len => len.to_string(),
    };
    format!(
        "{}\n\n\n{}\n\n{}\n\n\n{}\n{}\n\n\n{}\n{}",
        parts.method,
        content_length,
        parts.content_type,
        parts.if_match,
        parts.if_none_match,
        parts.canonicalized_headers,
        parts.canonicalized_resource
    )
}

/// `x-ms-*` headers, lowercased, sorted, one `name:value` per line.
fn canonicalized_headers(headers: &[(String, String)]) -> String {
    let mut ms_headers: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .filter(|(k, _)| k.starts_with("x-ms-"))
        .collect();
    ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
    ms_headers
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `/{account}{path}` followed by the sorted query parameters.
///
/// Uses the un-encoded blob name (not the percent-encoded URL form).
fn canonicalized_resource(account: &str, path: &str, query: &[(&'static str, String)]) -> String {
    let mut resource = format!("/{}{}", account, path);
    let mut sorted_params = query.to_vec();
    sorted_params.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in &sorted_params {
        resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
    }
    resource
}

/// HMAC-SHA256 sign, base64 encoded.
fn sign(key_bytes: &[u8], string_to_sign: &str) -> Result<String, String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        HmacSha256::new_from_slice(key_bytes).map_err(|e| format!("HMAC key error: {}", e))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn meta_from_headers(headers: &HeaderMap) -> ObjectMeta {
    ObjectMeta {
        etag: header_str(headers, "etag")
            .map(quote_etag)
            .unwrap_or_default(),
        generation: 0,
        size: header_str(headers, "content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        last_modified: header_str(headers, "last-modified").map(str::to_string),
        content_type: header_str(headers, "content-type").map(str::to_string),
    }
}

/// `x-ms-lease-duration` value: `-1` for infinite, else 15..=60 seconds.
fn lease_duration_header(duration: Option<Duration>) -> Result<String, StoreError> {
    match duration {
        None => Ok("-1".to_string()),
        Some(d) if (15..=60).contains(&d.as_secs()) => Ok(d.as_secs().to_string()),
        Some(d) => Err(StoreError::InvalidCondition(format!(
            "lease duration must be 15-60 seconds or infinite, got {d:?}"
        ))),
    }
}

/// Extract `<Message>` from an Azure error body, or the body itself.
fn error_message(body: &str) -> String {
    xml_text(body, "Message").unwrap_or_else(|| body.trim().to_string())
}

fn xml_text(body: &str, tag: &str) -> Option<String> {
    let start = body.find(&format!("<{tag}>"))? + tag.len() + 2;
    let end = body[start..].find(&format!("</{tag}>"))?;
    Some(body[start..start + end].to_string())
}

/// One page of a List Blobs response.
#[derive(Debug, Default, PartialEq)]
struct BlobPage {
    blobs: Vec<(String, u64, String)>,
    next_marker: Option<String>,
}

/// Parse a List Blobs `EnumerationResults` document.
fn parse_list_blobs(body: &[u8]) -> Result<BlobPage, String> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut page = BlobPage::default();
    let mut in_blob = false;
    let mut current_tag = String::new();
    let mut name = String::new();
    let mut etag = String::new();
    let mut size: u64 = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current_tag == "Blob" {
                    in_blob = true;
                    name.clear();
                    etag.clear();
                    size = 0;
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Blob" && in_blob {
                    page.blobs
                        .push((name.clone(), size, quote_etag(&etag)));
                    in_blob = false;
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|e| e.to_string())?.to_string();
                match current_tag.as_str() {
                    "Name" if in_blob => name = text,
                    "Etag" if in_blob => etag = text,
                    "Content-Length" if in_blob => size = text.parse().unwrap_or(0),
                    "NextMarker" if !text.is_empty() => page.next_marker = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("malformed List Blobs response: {e}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(page)
}

impl StorageBackend for AzureBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Azure
    }

    fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        let opts = opts.clone();
        Box::pin(async move { self.put_blob(&key, data, None, &opts).await })
    }

    fn get(&self, key: &str) -> StoreFuture<'_, StoredObject> {
        let key = key.to_string();
        Box::pin(async move {
            let blob_name = self.blob_name(&key);

            debug!("Azure get: container={} blob={}", self.container, blob_name);

            let resp = self
                .send("get", &key, BlobRequest::new(Method::GET, Some(&blob_name)))
                .await?;
            let meta = meta_from_headers(resp.headers());
            let data = resp.bytes().await.map_err(|e| {
                self.failure(
                    &key,
                    "get",
                    FailureClass::Transient,
                    None,
                    format!("Azure download body read failed: {e}"),
                )
            })?;

            Ok(StoredObject { data, meta })
        })
    }

    fn head(&self, key: &str) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        Box::pin(async move {
            let blob_name = self.blob_name(&key);

            debug!("Azure head: container={} blob={}", self.container, blob_name);

            let resp = self
                .send("head", &key, BlobRequest::new(Method::HEAD, Some(&blob_name)))
                .await?;
            Ok(meta_from_headers(resp.headers()))
        })
    }

    fn delete(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move { self.delete_blob(&key, None).await })
    }

    fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreFuture<'_, ListPage> {
        let prefix = prefix.to_string();
        let marker = token.map(str::to_string);
        Box::pin(async move {
            let list_prefix = list_prefix(&self.prefix, &prefix);

            debug!(
                "Azure list: container={} prefix={} marker={:?}",
                self.container, list_prefix, marker
            );

            let mut req = BlobRequest::new(Method::GET, None)
                .query("restype", "container")
                .query("comp", "list");
            if !list_prefix.is_empty() {
                req = req.query("prefix", list_prefix);
            }
            if let Some(marker) = marker {
                req = req.query("marker", marker);
            }

            let resp = self.send("list", &prefix, req).await?;
            let body = resp.bytes().await.map_err(|e| {
                self.failure(
                    &prefix,
                    "list",
                    FailureClass::Transient,
                    None,
                    format!("Azure list body read failed: {e}"),
                )
            })?;
            let page = parse_list_blobs(&body)
                .map_err(|e| self.failure(&prefix, "list", FailureClass::Fatal, None, e))?;

            let entries = page
                .blobs
                .into_iter()
                .filter_map(|(name, size, etag)| {
                    let rel = relative_key(&self.prefix, &name)?;
                    Some(ObjectInfo {
                        key: rel.to_string(),
                        size,
                        etag,
                    })
                })
                .collect();

            Ok(ListPage {
                entries,
                next_token: page.next_marker,
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
        let native = translate(condition, BackendType::Azure);
        Box::pin(async move {
            let native = native?;
            match self.put_blob(&key, data, Some(native), &opts).await {
                Err(StoreError::NotFound { target, key }) => {
                    Err(StoreError::PreconditionFailed { target, key })
                }
                other => other,
            }
        })
    }

    fn leases(&self) -> Option<&dyn LeaseManager> {
        Some(self)
    }
}

impl LeaseManager for AzureBackend {
    fn acquire_lease(
        &self,
        key: &str,
        duration: Option<Duration>,
        proposed_id: Option<String>,
    ) -> StoreFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let proposed = proposed_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let headers = vec![
                ("x-ms-lease-duration".to_string(), lease_duration_header(duration)?),
                ("x-ms-proposed-lease-id".to_string(), proposed.clone()),
            ];
            let resp = self.lease_call("acquire_lease", &key, "acquire", headers).await?;
            Ok(header_str(&resp, "x-ms-lease-id")
                .map(str::to_string)
                .unwrap_or(proposed))
        })
    }

    fn renew_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        let lease_id = lease_id.to_string();
        Box::pin(async move {
            let headers = vec![("x-ms-lease-id".to_string(), lease_id)];
            self.lease_call("renew_lease", &key, "renew", headers).await?;
            Ok(())
        })
    }

    fn release_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        let lease_id = lease_id.to_string();
        Box::pin(async move {
            let headers = vec![("x-ms-lease-id".to_string(), lease_id)];
            self.lease_call("release_lease", &key, "release", headers).await?;
            Ok(())
        })
    }

    fn break_lease(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let headers = vec![("x-ms-lease-break-period".to_string(), "0".to_string())];
            self.lease_call("break_lease", &key, "break", headers).await?;
            Ok(())
        })
    }

    fn delete_with_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        let lease_id = lease_id.to_string();
        Box::pin(async move { self.delete_blob(&key, Some(lease_id)).await })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn env<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_blob_url_encoding() {
        // Verify that '/' is preserved but spaces are encoded.
        let name = "state/key with spaces.txt";
        let encoded =
            percent_encoding::utf8_percent_encode(name, &AZURE_BLOB_ENCODE_SET).to_string();
        assert_eq!(encoded, "state/key%20with%20spaces.txt");
    }

    #[test]
    fn test_resolve_auth_shared_key() {
        let auth = resolve_auth(env(&[("AZURE_STORAGE_KEY", "c2VjcmV0")])).unwrap();
        assert_eq!(
            auth,
            AzureAuth::SharedKey {
                key_bytes: b"secret".to_vec()
            }
        );
    }

    #[test]
    fn test_resolve_auth_connection_string() {
        let conn = "DefaultEndpointsProtocol=https;AccountName=acct;\
                    AccountKey=c2VjcmV0;EndpointSuffix=core.windows.net";
        let auth = resolve_auth(env(&[("AZURE_STORAGE_CONNECTION_STRING", conn)])).unwrap();
        assert!(matches!(auth, AzureAuth::SharedKey { .. }));
    }

    #[test]
    fn test_resolve_auth_sas_prefix_stripped() {
        let auth = resolve_auth(env(&[(
            "AZURE_STORAGE_SAS_TOKEN",
            "?sv=2023-11-03&ss=b&srt=sco&sig=xxx",
        )]))
        .unwrap();
        assert_eq!(
            auth,
            AzureAuth::SasToken {
                token: "sv=2023-11-03&ss=b&srt=sco&sig=xxx".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_auth_missing() {
        let err = resolve_auth(env(&[])).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
        let err = resolve_auth(env(&[("AZURE_STORAGE_KEY", "not base64!")])).unwrap_err();
        assert!(err.to_string().contains("AZURE_STORAGE_KEY"));
    }

    #[test]
    fn test_string_to_sign_conditional_put() {
        let sts = string_to_sign(&SignParts {
            method: "PUT",
            content_length: 11,
            content_type: "application/json",
            if_match: "",
            if_none_match: "*",
            canonicalized_headers: "x-ms-blob-type:BlockBlob".to_string(),
            canonicalized_resource: "/acct/state/ACTIVE".to_string(),
        });
        let lines: Vec<&str> = sts.split('\n').collect();
        assert_eq!(lines.len(), 14);
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[3], "11");
        assert_eq!(lines[5], "application/json");
        assert_eq!(lines[8], "");
        assert_eq!(lines[9], "*");
        assert_eq!(lines[12], "x-ms-blob-type:BlockBlob");
        assert_eq!(lines[13], "/acct/state/ACTIVE");
    }

    #[test]
    fn test_string_to_sign_if_match_and_empty_length() {
        let sts = string_to_sign(&SignParts {
            method: "PUT",
            content_length: 0,
            content_type: "",
            if_match: "\"0x8DC\"",
            if_none_match: "",
            canonicalized_headers: String::new(),
            canonicalized_resource: "/acct/c/b".to_string(),
        });
        let lines: Vec<&str> = sts.split('\n').collect();
        assert_eq!(lines[3], "");
        assert_eq!(lines[8], "\"0x8DC\"");
        assert_eq!(lines[9], "");
    }

    #[test]
    fn test_canonicalized_headers_sorted_and_filtered() {
        let headers = vec![
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
            ("If-Match".to_string(), "\"abc\"".to_string()),
            ("X-MS-Meta-Owner".to_string(), " svc ".to_string()),
            ("x-ms-date".to_string(), "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        ];
        assert_eq!(
            canonicalized_headers(&headers),
            "x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\nx-ms-meta-owner:svc\nx-ms-version:2023-11-03"
        );
    }

    #[test]
    fn test_canonicalized_resource_with_query() {
        let query = vec![
            ("restype", "container".to_string()),
            ("comp", "list".to_string()),
            ("prefix", "state/".to_string()),
        ];
        assert_eq!(
            canonicalized_resource("acct", "/c", &query),
            "/acct/c\ncomp:list\nprefix:state/\nrestype:container"
        );
    }

    #[test]
    fn test_canonicalized_resource_azurite_path() {
        assert_eq!(
            canonicalized_resource("devstoreaccount1", "/devstoreaccount1/c/ACTIVE", &[]),
            "/devstoreaccount1/devstoreaccount1/c/ACTIVE"
        );
    }

    #[test]
    fn test_sign_is_base64_sha256() {
        let sig = sign(b"secret", "GET\n").unwrap();
        assert_eq!(BASE64_STANDARD.decode(&sig).unwrap().len(), 32);
        assert_eq!(sig, sign(b"secret", "GET\n").unwrap());
        assert_ne!(sig, sign(b"other", "GET\n").unwrap());
    }

    #[test]
    fn test_meta_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("etag", HeaderValue::from_static("\"0x8DBF2A1C3E4F5A6\""));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert(
            "last-modified",
            HeaderValue::from_static("Tue, 14 Nov 2023 22:13:20 GMT"),
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let meta = meta_from_headers(&headers);
        assert_eq!(meta.etag, "\"0x8DBF2A1C3E4F5A6\"");
        assert_eq!(meta.generation, 0);
        assert_eq!(meta.size, 42);
        assert_eq!(meta.content_type.as_deref(), Some("application/json"));
        assert!(meta.has_version());
    }

    #[test]
    fn test_lease_duration_header() {
        assert_eq!(lease_duration_header(None).unwrap(), "-1");
        assert_eq!(
            lease_duration_header(Some(Duration::from_secs(30))).unwrap(),
            "30"
        );
        assert!(lease_duration_header(Some(Duration::from_secs(5))).is_err());
        assert!(lease_duration_header(Some(Duration::from_secs(61))).is_err());
    }

    #[test]
    fn test_parse_list_blobs_page() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="c">
  <Prefix>state/</Prefix>
  <Blobs>
    <Blob>
      <Name>state/ACTIVE</Name>
      <Properties>
        <Last-Modified>Tue, 14 Nov 2023 22:13:20 GMT</Last-Modified>
        <Etag>0x8DBF2A1C3E4F5A6</Etag>
        <Content-Length>12</Content-Length>
      </Properties>
    </Blob>
    <Blob>
      <Name>state/v/1</Name>
      <Properties>
        <Etag>0x8DBF2A1C3E4F5A7</Etag>
        <Content-Length>3</Content-Length>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker>2!72!MDAwMDE</NextMarker>
</EnumerationResults>"#;
        let page = parse_list_blobs(body).unwrap();
        assert_eq!(
            page.blobs,
            vec![
                (
                    "state/ACTIVE".to_string(),
                    12,
                    "\"0x8DBF2A1C3E4F5A6\"".to_string()
                ),
                ("state/v/1".to_string(), 3, "\"0x8DBF2A1C3E4F5A7\"".to_string()),
            ]
        );
        assert_eq!(page.next_marker.as_deref(), Some("2!72!MDAwMDE"));
    }

    #[test]
    fn test_parse_list_blobs_last_page() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ContainerName="c"><Blobs /><NextMarker /></EnumerationResults>"#;
        let page = parse_list_blobs(body).unwrap();
        assert!(page.blobs.is_empty());
        assert!(page.next_marker.is_none());
    }

    #[test]
    fn test_error_message_extraction() {
        let body = "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error>\
                    <Code>ConditionNotMet</Code>\
                    <Message>The condition specified using HTTP conditional header(s) is not met.\
                    </Message></Error>";
        assert_eq!(
            error_message(body),
            "The condition specified using HTTP conditional header(s) is not met."
        );
        assert_eq!(error_message(" plain "), "plain");
    }
}
