//! S3 object store implementation

use super::error::{StoreError, StoreResult};
use super::{ByteStream, CompletedPart, ObjectHead, ObjectStore};
use crate::config::StoreConfig;
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart};
use aws_sdk_s3::Client as AwsS3Client;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;

/// Object store backed by AWS S3 or an S3-compatible service
#[derive(Clone)]
pub struct S3Store {
    client: AwsS3Client,
    bucket: String,
}

impl S3Store {
    /// Create a store for the bucket described by `config`
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ferry::config::StoreConfig;
    /// use ferry::store::S3Store;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = StoreConfig::new("my-bucket");
    ///     let store = S3Store::new(&config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn new(config: &StoreConfig) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        let client = Self::build_aws_client(config).await;
        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    /// Build the AWS SDK S3 client from configuration
    async fn build_aws_client(config: &StoreConfig) -> AwsS3Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        let region_provider = if let Some(region) = &config.region {
            RegionProviderChain::first_try(Region::new(region.clone()))
        } else {
            RegionProviderChain::default_provider()
        };
        loader = loader.region(region_provider);

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials = Credentials::new(
                access_key,
                secret_key,
                config.session_token.clone(),
                None,
                "ferry-explicit",
            );
            loader = loader.credentials_provider(credentials);
        }

        let aws_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        // Required for MinIO and LocalStack
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        // Per-request bound; step timeouts sit above this
        let timeout_config = aws_sdk_s3::config::timeout::TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.timeout_seconds))
            .build();
        builder = builder.timeout_config(timeout_config);

        AwsS3Client::from_conf(builder.build())
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Adapt an SDK body into the store's chunk stream
fn body_stream(body: AwsByteStream) -> ByteStream {
    futures::stream::try_unfold(body, |mut body| async move {
        match body.try_next().await {
            Ok(Some(chunk)) => Ok(Some((chunk, body))),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Network(format!("Body read failed: {}", e))),
        }
    })
    .boxed()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head_object(&self, key: &str) -> StoreResult<ObjectHead> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(StoreError::from)?;

        Ok(ObjectHead {
            content_length: response
                .content_length()
                .and_then(|len| u64::try_from(len).ok()),
        })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StoreResult<ByteStream> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={}-{}", start, end))
            .send()
            .await
            .map_err(StoreError::from)?;

        Ok(body_stream(response.body))
    }

    async fn get_object(&self, key: &str) -> StoreResult<ByteStream> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(StoreError::from)?;

        Ok(body_stream(response.body))
    }

    async fn create_multipart_upload(&self, key: &str) -> StoreResult<Option<String>> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(StoreError::from)?;

        Ok(response.upload_id().map(|s| s.to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<Option<String>> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| StoreError::InvalidConfig(format!("Part number {} out of range", part_number)))?;

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(StoreError::from)?;

        Ok(response.e_tag().map(|s| s.to_string()))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let completed_parts: Vec<AwsCompletedPart> = parts
            .iter()
            .map(|p| {
                AwsCompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(multipart_upload)
            .send()
            .await
            .map_err(StoreError::from)?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(StoreError::from)?;

        Ok(())
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(StoreError::from)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> StoreConfig {
        StoreConfig {
            region: Some("us-east-1".to_string()),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            force_path_style: true,
            ..StoreConfig::new("test-bucket")
        }
    }

    #[tokio::test]
    async fn test_store_creation() {
        let store = S3Store::new(&local_config()).await.unwrap();
        assert_eq!(store.bucket(), "test-bucket");
    }

    #[tokio::test]
    async fn test_store_with_invalid_bucket() {
        let config = StoreConfig {
            bucket: String::new(),
            ..local_config()
        };
        let result = S3Store::new(&config).await;
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }
}
