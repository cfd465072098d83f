use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, RequestChecksumCalculation, ResponseChecksumValidation};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration, ObjectCannedAcl,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use super::hints::{extract_tag, region_from_message, strip_bucket_label};
use super::{
    BucketSummary, ClientFactory, ClientSpec, ListPage, ListRequest, ObjectBody, ObjectHead, ObjectSummary,
    StorageBackend,
};
use crate::config::{AddressingStyle, DEFAULT_SIGNING_REGION};
use crate::error::StoreError;

/// Endpoint the SDK should be configured with. A virtual-style client for a
/// host that already starts with the bucket gets the bare service host, since
/// the SDK adds the bucket label on its own.
fn sdk_endpoint(spec: &ClientSpec) -> Option<String> {
    if spec.endpoint_url.is_empty() {
        return None;
    }
    if spec.addressing_style == AddressingStyle::Virtual {
        if let Some(bucket) = &spec.bound_bucket {
            if let Some(stripped) = strip_bucket_label(&spec.endpoint_url, bucket) {
                return Some(stripped);
            }
        }
    }
    Some(spec.endpoint_url.clone())
}

pub fn create_s3_client(spec: &ClientSpec) -> Client {
    let credentials = Credentials::new(&spec.access_key, &spec.secret_key, None, None, "s3duck-profile");

    let mut builder = S3ConfigBuilder::new()
        .credentials_provider(credentials)
        .region(Region::new(spec.region.clone()))
        .timeout_config(TimeoutConfig::builder().connect_timeout(spec.connect_timeout).build())
        .retry_config(RetryConfig::standard().with_max_attempts(spec.retries.max(1)))
        // Many S3-compatible servers reject the default CRC trailers.
        .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
        .response_checksum_validation(ResponseChecksumValidation::WhenRequired);

    if let Some(endpoint_url) = sdk_endpoint(spec) {
        builder = builder.endpoint_url(endpoint_url);
    }

    if spec.addressing_style == AddressingStyle::Path {
        builder = builder.force_path_style(true);
    }

    Client::from_conf(builder.build())
}

/// Turn an SDK failure into a [`StoreError`], keeping the backend's code and
/// message verbatim and picking up redirect and region hints.
fn classify<E>(err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let Some(response) = err.raw_response() else {
        return StoreError::Transport {
            message: DisplayErrorContext(&err).to_string(),
        };
    };

    let status = response.status().as_u16();
    let body = response
        .body()
        .bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();

    let code = err
        .code()
        .map(str::to_string)
        .or_else(|| extract_tag(&body, "Code"))
        .unwrap_or_else(|| status.to_string());
    let message = err
        .message()
        .map(str::to_string)
        .or_else(|| extract_tag(&body, "Message"))
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());

    let region_hint = response
        .headers()
        .get("x-amz-bucket-region")
        .map(str::to_string)
        .or_else(|| extract_tag(&body, "Region"))
        .or_else(|| region_from_message(&message));

    let mut store_err = StoreError::service(code, message).with_status(status);
    if let Some(endpoint) = extract_tag(&body, "Endpoint") {
        store_err = store_err.with_endpoint_hint(endpoint);
    }
    if let Some(region) = region_hint {
        store_err = store_err.with_region_hint(region);
    }
    store_err
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn non_negative(value: Option<i64>) -> u64 {
    value.unwrap_or(0).max(0) as u64
}

/// [`StorageBackend`] over the AWS SDK.
pub struct S3Backend {
    client: Client,
    spec: ClientSpec,
}

impl S3Backend {
    pub fn new(spec: ClientSpec) -> Self {
        let client = create_s3_client(&spec);
        Self { client, spec }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn spec(&self) -> &ClientSpec {
        &self.spec
    }

    async fn list_buckets(&self) -> Result<Vec<BucketSummary>, StoreError> {
        let mut buckets = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_buckets();
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(classify)?;

            buckets.extend(response.buckets().iter().filter_map(|bucket| {
                Some(BucketSummary {
                    name: bucket.name()?.to_string(),
                    created: bucket.creation_date().and_then(to_chrono),
                })
            }));

            match response.continuation_token() {
                Some(token) if !token.is_empty() => continuation_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(buckets)
    }

    async fn list_objects(&self, request: &ListRequest) -> Result<ListPage, StoreError> {
        let mut call = self
            .client
            .list_objects_v2()
            .bucket(&request.bucket)
            .max_keys(request.max_keys);

        if !request.prefix.is_empty() {
            call = call.prefix(&request.prefix);
        }
        if let Some(d) = &request.delimiter {
            call = call.delimiter(d);
        }
        if let Some(token) = &request.continuation_token {
            call = call.continuation_token(token);
        }

        let response = call.send().await.map_err(classify)?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectSummary {
                    key: obj.key()?.to_string(),
                    size: non_negative(obj.size()),
                    last_modified: obj.last_modified().and_then(to_chrono),
                })
            })
            .collect();

        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|prefix| prefix.prefix().map(|s| s.to_string()))
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(|s| s.to_string())
        } else {
            None
        };

        Ok(ListPage {
            objects,
            common_prefixes,
            next_token,
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, StoreError> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        Ok(ObjectHead {
            key: key.to_string(),
            size: non_negative(response.content_length()),
            etag: response.e_tag().map(|s| s.to_string()),
            last_modified: response.last_modified().and_then(to_chrono),
            content_type: response.content_type().map(|s| s.to_string()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        let content_length = response.content_length().map(|l| l.max(0) as u64);
        let chunks = stream::unfold(response.body, |mut body| async move {
            let chunk = body.next().await?;
            let chunk = chunk.map_err(|e| StoreError::Transport {
                message: DisplayErrorContext(&e).to_string(),
            });
            Some((chunk, body))
        })
        .boxed();

        Ok(ObjectBody { content_length, chunks })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        response
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| StoreError::service("MissingUploadId", "no upload id returned"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let response = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;

        Ok(response.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), StoreError> {
        let completed_parts: Vec<CompletedPart> = parts
            .into_iter()
            .map(|(part_number, etag)| CompletedPart::builder().part_number(part_number).e_tag(etag).build())
            .collect();

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn put_public_read_acl(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .put_object_acl()
            .bucket(bucket)
            .key(key)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn presigned_get_url(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        let presigning_config = PresigningConfig::expires_in(expires_in).map_err(|e| StoreError::InvalidConfig {
            message: format!("presign expiry: {}", e),
        })?;

        let presigned_request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(classify)?;

        Ok(presigned_request.uri().to_string())
    }

    async fn create_bucket(&self, bucket: &str, region: Option<&str>) -> Result<(), StoreError> {
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 must not be sent as a location constraint
        if let Some(region) = region.filter(|r| !r.is_empty() && *r != DEFAULT_SIGNING_REGION) {
            let configuration = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build();
            request = request.create_bucket_configuration(configuration);
        }
        request.send().await.map_err(classify)?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Builds [`S3Backend`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct S3ClientFactory;

impl ClientFactory for S3ClientFactory {
    fn build(&self, spec: &ClientSpec) -> Result<Arc<dyn StorageBackend>, StoreError> {
        if !spec.endpoint_url.is_empty() && !spec.endpoint_url.contains("://") {
            return Err(StoreError::InvalidConfig {
                message: format!("endpoint `{}` has no scheme", spec.endpoint_url),
            });
        }
        if !spec.verify_tls {
            warn!(
                "verify_tls: disabling certificate checks is not supported, verifying {}",
                spec.endpoint_url
            );
        }
        debug!(
            "s3_client: endpoint={} region={} style={}",
            spec.endpoint_url, spec.region, spec.addressing_style
        );
        Ok(Arc::new(S3Backend::new(spec.clone())))
    }
}
