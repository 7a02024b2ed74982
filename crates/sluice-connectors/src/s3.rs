//! S3-backed slice store for the unload path.

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::debug;
use url::Url;

use sluice_core::{Error, SliceStore};

fn store_err(err: object_store::Error) -> Error {
    Error::Request(err.to_string())
}

/// Configuration for connecting to S3-compatible storage.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// AWS region (e.g. "us-east-1")
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Optional custom endpoint URL (for MinIO / LocalStack)
    pub endpoint_url: Option<String>,
    /// Allow HTTP (non-TLS) connections to a local store
    pub allow_http: bool,
}

impl S3Config {
    /// Build an S3Config from environment variables:
    ///   AWS_REGION, AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_ENDPOINT_URL
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self {
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID")
                .map_err(|_| Error::Request("AWS_ACCESS_KEY_ID not set".to_string()))?,
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY")
                .map_err(|_| Error::Request("AWS_SECRET_ACCESS_KEY not set".to_string()))?,
            endpoint_url: std::env::var("AWS_ENDPOINT_URL").ok(),
            allow_http: std::env::var("AWS_ALLOW_HTTP")
                .map(|value| value == "true" || value == "1")
                .unwrap_or(false),
        })
    }
}

/// Parse an `s3://bucket/key` URI into (bucket, key).
pub fn parse_s3_uri(uri: &str) -> Result<(String, String), Error> {
    let url = Url::parse(uri).map_err(|err| Error::Request(format!("invalid S3 URI: {}", err)))?;

    if url.scheme() != "s3" {
        return Err(Error::Request(format!(
            "URI scheme must be s3://, got {}",
            uri
        )));
    }

    let bucket = url
        .host_str()
        .ok_or_else(|| Error::Request(format!("missing bucket in S3 URI: {}", uri)))?
        .to_string();

    // path() starts with '/', strip the leading slash
    let key = url.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(Error::Request(format!(
            "missing object key in S3 URI: {}",
            uri
        )));
    }

    Ok((bucket, key))
}

/// Fetches unloaded slices and manifests from S3.
pub struct S3SliceStore {
    config: S3Config,
}

impl S3SliceStore {
    pub fn new(config: S3Config) -> Self {
        Self { config }
    }

    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(S3Config::from_env()?))
    }

    fn build_store(&self, bucket: &str) -> Result<object_store::aws::AmazonS3, Error> {
        let mut builder = AmazonS3Builder::new()
            .with_region(&self.config.region)
            .with_bucket_name(bucket)
            .with_access_key_id(&self.config.access_key_id)
            .with_secret_access_key(&self.config.secret_access_key);

        if let Some(endpoint) = &self.config.endpoint_url {
            builder = builder.with_endpoint(endpoint);
        }
        if self.config.allow_http {
            builder = builder.with_allow_http(true);
        }

        builder.build().map_err(store_err)
    }
}

#[async_trait]
impl SliceStore for S3SliceStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, Error> {
        debug!("reading S3 object: s3://{}/{}", bucket, key);

        let store = self.build_store(bucket)?;
        let path = ObjectPath::from(key);

        let result = store.get(&path).await.map_err(store_err)?;
        let bytes = result.bytes().await.map_err(store_err)?;

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> S3Config {
        S3Config {
            region: "us-east-1".to_string(),
            access_key_id: "test-key".to_string(),
            secret_access_key: "test-secret".to_string(),
            endpoint_url: Some("http://localhost:9000".to_string()),
            allow_http: true,
        }
    }

    #[test]
    fn parses_bucket_and_key() {
        let (bucket, key) = parse_s3_uri("s3://my-bucket/path/to/slice_0000").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(key, "path/to/slice_0000");
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert!(parse_s3_uri("http://bucket/key").is_err());
    }

    #[test]
    fn rejects_missing_key() {
        assert!(parse_s3_uri("s3://bucket/").is_err());
        assert!(parse_s3_uri("s3://bucket").is_err());
    }

    #[test]
    fn rejects_missing_bucket() {
        assert!(parse_s3_uri("s3:///key").is_err());
    }

    #[test]
    fn builds_a_store_for_a_bucket() {
        let store = S3SliceStore::new(test_config());
        assert!(store.build_store("my-bucket").is_ok());
    }
}
