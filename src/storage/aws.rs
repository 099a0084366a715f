//! AWS S3 storage adapter.
//!
//! Objects live under `{prefix}/{key}` in a single bucket.  Conditional
//! writes use the native `If-Match` / `If-None-Match: *` headers on
//! `PutObject`, which S3 evaluates atomically.
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless a static
//! key pair is configured.
//!
//! S3 has no object generations: every [`ObjectMeta`] produced here has
//! `generation == 0` and is versioned by ETag alone.
//!
//! For single-part uploads the ETag is the MD5 of the content, so it names
//! the bytes, not the write.  If a writer puts A, another puts B and a third
//! puts A again, the ETag is back to its first value, and an `If-Match`
//! holding that first ETag succeeds even though two writes happened in
//! between (A-B-A).  Callers that need to detect every intervening write
//! must put something unique in each payload, such as a sequence number.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime, DateTimeFormat};
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info};

use super::backend::{
    list_prefix, object_name, quote_etag, relative_key, ListPage, ObjectInfo, ObjectMeta,
    PutOptions, StorageBackend, StoreFuture, StoredObject, WriteCondition,
};
use super::condition::{classify_failure, failure_to_error, translate, NativePrecondition};
use crate::config::{BackendType, TargetConfig};
use crate::errors::StoreError;

/// Adapter that forwards operations to an S3 bucket.
pub struct S3Backend {
    /// Target name, for errors and logs.
    target: String,
    client: Client,
    bucket: String,
    /// Key prefix for all objects in the bucket.
    prefix: String,
    /// Default SSE-KMS key for writes.
    kms_key: Option<String>,
}

impl S3Backend {
    /// Build the S3 client from a validated target configuration.
    pub async fn new(config: &TargetConfig) -> Result<Self, StoreError> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint) = config.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        // If explicit credentials are provided, inject them as static credentials.
        if let (Some(ak), Some(sk)) = (&config.access_key_id, &config.secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                None, // session_token
                None, // expiry
                "activestore-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "S3 backend initialized: target={} bucket={} prefix='{}' region={}",
            config.name, config.bucket, config.prefix, config.region
        );

        Ok(Self {
            target: config.name.clone(),
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            kms_key: config.kms_key.clone(),
        })
    }

    fn s3_key(&self, key: &str) -> String {
        object_name(&self.prefix, key)
    }

    /// Translate an SDK failure into the neutral taxonomy.
    fn map_sdk_error<E>(
        &self,
        key: &str,
        operation: &'static str,
        err: SdkError<E, HttpResponse>,
    ) -> StoreError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let message = format!("{}", DisplayErrorContext(&err));
        let (status, code) = match &err {
            SdkError::ConstructionFailure(_) => {
                return StoreError::Backend {
                    target: self.target.clone(),
                    key: key.to_string(),
                    operation,
                    status: None,
                    message,
                };
            }
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => (None, None),
            _ => (
                err.raw_response().map(|r| r.status().as_u16()),
                err.as_service_error()
                    .and_then(|e| e.code())
                    .map(str::to_string),
            ),
        };
        let class = classify_failure(BackendType::S3, status, code.as_deref());
        failure_to_error(class, &self.target, key, operation, status, message)
    }

    fn transient_body_error(&self, key: &str, err: impl std::fmt::Display) -> StoreError {
        StoreError::Transient {
            target: self.target.clone(),
            key: key.to_string(),
            operation: "get",
            message: format!("reading object body: {err}"),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        precondition: Option<NativePrecondition>,
        opts: &PutOptions,
    ) -> Result<ObjectMeta, StoreError> {
        let s3_key = self.s3_key(key);
        let size = data.len() as u64;
        let operation = if precondition.is_some() {
            "conditional_put"
        } else {
            "put"
        };

        debug!(
            "S3 put_object: bucket={} key={} precondition={:?}",
            self.bucket, s3_key, precondition
        );

        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .content_type(opts.content_type_or_default())
            .body(ByteStream::from(data));

        for (name, value) in &opts.metadata {
            req = req.metadata(name, value);
        }
        if let Some(kms_key) = opts.kms_key.as_ref().or(self.kms_key.as_ref()) {
            req = req
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key);
        }
        let (if_match, if_none_match) = precondition_headers(precondition.as_ref());
        req = req.set_if_match(if_match).set_if_none_match(if_none_match);

        let resp = req
            .send()
            .await
            .map_err(|e| self.map_sdk_error(key, operation, e))?;

        Ok(ObjectMeta {
            etag: resp.e_tag().map(quote_etag).unwrap_or_default(),
            generation: 0,
            size,
            last_modified: None,
            content_type: Some(opts.content_type_or_default().to_string()),
        })
    }
}

/// `(If-Match, If-None-Match)` header values for a native precondition.
fn precondition_headers(
    precondition: Option<&NativePrecondition>,
) -> (Option<String>, Option<String>) {
    match precondition {
        Some(NativePrecondition::IfMatch(etag)) => (Some(etag.clone()), None),
        Some(NativePrecondition::IfNoneMatchAny) => (None, Some("*".to_string())),
        // The translator never produces these for S3.
        Some(NativePrecondition::IfGenerationMatch(_)) | Some(NativePrecondition::LeaseId(_)) => {
            (None, None)
        }
        None => (None, None),
    }
}

fn http_date(ts: Option<&DateTime>) -> Option<String> {
    ts.and_then(|t| t.fmt(DateTimeFormat::HttpDate).ok())
}

fn meta_from_parts(
    etag: Option<&str>,
    content_length: Option<i64>,
    last_modified: Option<&DateTime>,
    content_type: Option<&str>,
) -> ObjectMeta {
    ObjectMeta {
        etag: etag.map(quote_etag).unwrap_or_default(),
        generation: 0,
        size: content_length.unwrap_or(0).max(0) as u64,
        last_modified: http_date(last_modified),
        content_type: content_type.map(str::to_string),
    }
}

impl StorageBackend for S3Backend {
    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }

    fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        let opts = opts.clone();
        Box::pin(async move { self.put_object(&key, data, None, &opts).await })
    }

    fn get(&self, key: &str) -> StoreFuture<'_, StoredObject> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("S3 get_object: bucket={} key={}", self.bucket, s3_key);

            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| self.map_sdk_error(&key, "get", e))?;

            let meta = meta_from_parts(
                resp.e_tag(),
                resp.content_length(),
                resp.last_modified(),
                resp.content_type(),
            );

            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| self.transient_body_error(&key, e))?
                .into_bytes();

            Ok(StoredObject { data, meta })
        })
    }

    fn head(&self, key: &str) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("S3 head_object: bucket={} key={}", self.bucket, s3_key);

            let resp = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| self.map_sdk_error(&key, "head", e))?;

            Ok(meta_from_parts(
                resp.e_tag(),
                resp.content_length(),
                resp.last_modified(),
                resp.content_type(),
            ))
        })
    }

    fn delete(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!("S3 delete_object: bucket={} key={}", self.bucket, s3_key);

            // S3 delete_object is idempotent -- no error for missing keys.
            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => match self.map_sdk_error(&key, "delete", e) {
                    StoreError::NotFound { .. } => Ok(()),
                    other => Err(other),
                },
            }
        })
    }

    fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreFuture<'_, ListPage> {
        let prefix = prefix.to_string();
        let token = token.map(str::to_string);
        Box::pin(async move {
            let list_prefix = list_prefix(&self.prefix, &prefix);

            debug!(
                "S3 list_objects_v2: bucket={} prefix={} continuation={:?}",
                self.bucket, list_prefix, token
            );

            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(|e| self.map_sdk_error(&prefix, "list", e))?;

            let entries = resp
                .contents()
                .iter()
                .filter_map(|obj| {
                    let rel = relative_key(&self.prefix, obj.key()?)?;
                    Some(ObjectInfo {
                        key: rel.to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        etag: obj.e_tag().map(quote_etag).unwrap_or_default(),
                    })
                })
                .collect();

            let next_token = if resp.is_truncated() == Some(true) {
                resp.next_continuation_token().map(str::to_string)
            } else {
                None
            };
            Ok(ListPage {
                entries,
                next_token,
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
        let native = translate(condition, BackendType::S3);
        Box::pin(async move {
            let native = native?;
            match self.put_object(&key, data, Some(native), &opts).await {
                // If-Match on a missing key: the expected version is gone.
                Err(StoreError::NotFound { target, key }) => {
                    Err(StoreError::PreconditionFailed { target, key })
                }
                other => other,
            }
        })
    }
}

// -- Tests -------------------------------------------------------------------
