use async_trait::async_trait;
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::models::MediaKind;

#[derive(Debug, Error)]
pub enum MediaStoreError {
    #[error("duplicate")]
    Duplicate,
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Media collaborator: blobs addressed by their SHA-256 reference.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn save(&self, reference: &str, mime: &str, bytes: &[u8]) -> Result<(), MediaStoreError>;
    async fn load(&self, reference: &str) -> Result<(Vec<u8>, String), MediaStoreError>;
    async fn delete(&self, reference: &str) -> Result<(), MediaStoreError>;
}

const IMAGE_LIMIT: usize = 10 * 1024 * 1024;
const VIDEO_LIMIT: usize = 100 * 1024 * 1024;
const AUDIO_LIMIT: usize = 20 * 1024 * 1024;

/// Largest upload accepted for any kind.
pub const UPLOAD_LIMIT: usize = VIDEO_LIMIT;

const ALLOWED_MIME: &[(&str, MediaKind)] = &[
    ("image/png", MediaKind::Image),
    ("image/jpeg", MediaKind::Image),
    ("image/gif", MediaKind::Image),
    ("image/webp", MediaKind::Image),
    ("video/mp4", MediaKind::Video),
    ("video/quicktime", MediaKind::Video),
    ("video/webm", MediaKind::Video),
    ("audio/mpeg", MediaKind::Audio),
    ("audio/x-wav", MediaKind::Audio),
    ("audio/ogg", MediaKind::Audio),
    ("audio/m4a", MediaKind::Audio),
    ("audio/aac", MediaKind::Audio),
];

pub fn size_limit(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Image => IMAGE_LIMIT,
        MediaKind::Video => VIDEO_LIMIT,
        MediaKind::Audio => AUDIO_LIMIT,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Rejection {
    UnsupportedType(String),
    TooLarge { kind: MediaKind, limit: usize },
}

/// Sniffs the payload and checks it against the per-kind size limit.
pub fn classify(bytes: &[u8]) -> Result<(MediaKind, String), Rejection> {
    let mime = infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into());
    let kind = ALLOWED_MIME
        .iter()
        .find(|(m, _)| *m == mime)
        .map(|(_, k)| *k)
        .ok_or_else(|| Rejection::UnsupportedType(mime.clone()))?;
    let limit = size_limit(kind);
    if bytes.len() > limit {
        return Err(Rejection::TooLarge { kind, limit });
    }
    Ok((kind, mime))
}

pub fn reference_for(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// References are lowercase hex digests; anything else never reaches a backend.
pub fn is_valid_reference(reference: &str) -> bool {
    reference.len() == 64 && reference.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into())
}

// ---------------- Filesystem implementation ----------------
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    /// Rooted at `MEDIA_DIR` (default `./uploads`).
    pub fn new() -> Self {
        let root = std::env::var("MEDIA_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("uploads"));
        Self::at(root)
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, reference: &str) -> PathBuf {
        self.root.join(&reference[0..2]).join(reference)
    }
}

impl Default for FsMediaStore {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn save(&self, reference: &str, _mime: &str, bytes: &[u8]) -> Result<(), MediaStoreError> {
        if !is_valid_reference(reference) {
            return Err(MediaStoreError::Other(format!("invalid reference '{reference}'")));
        }
        let path = self.path_for(reference);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(MediaStoreError::Duplicate);
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| MediaStoreError::Other(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            error!("media write failed path={} err={e}", path.display());
            MediaStoreError::Other(e.to_string())
        })
    }

    async fn load(&self, reference: &str) -> Result<(Vec<u8>, String), MediaStoreError> {
        if !is_valid_reference(reference) {
            return Err(MediaStoreError::NotFound);
        }
        let bytes = tokio::fs::read(self.path_for(reference)).await.map_err(|_| MediaStoreError::NotFound)?;
        let mime = sniff_mime(&bytes);
        Ok((bytes, mime))
    }

    async fn delete(&self, reference: &str) -> Result<(), MediaStoreError> {
        if !is_valid_reference(reference) {
            return Ok(());
        }
        match tokio::fs::remove_file(self.path_for(reference)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MediaStoreError::Other(e.to_string())),
        }
    }
}

// ---------------- S3 implementation (MinIO compatible) ----------------
pub struct S3MediaStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
}

impl S3MediaStore {
    pub async fn new() -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "pulse-media".into());
        let endpoint = std::env::var("S3_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // path-style addressing: MinIO and local endpoints have no wildcard DNS
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("initialized S3 media client bucket={bucket}");

        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}', creating it: {e:?}");
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e2) if attempt >= 5 => {
                        error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e2:?}");
                        return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
                    }
                    Err(e2) => {
                        let backoff_ms = 200 * u64::from(attempt.pow(2));
                        warn!("create_bucket attempt {attempt} failed: {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Ok(Self { bucket, client, prefix: "media".into() })
    }

    fn key_for(&self, reference: &str) -> String {
        format!("{}/{}/{}", self.prefix, &reference[0..2], reference)
    }
}

#[async_trait]
impl MediaStore for S3MediaStore {
    async fn save(&self, reference: &str, mime: &str, bytes: &[u8]) -> Result<(), MediaStoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        if !is_valid_reference(reference) {
            return Err(MediaStoreError::Other(format!("invalid reference '{reference}'")));
        }
        let key = self.key_for(reference);
        if self.client.head_object().bucket(&self.bucket).key(&key).send().await.is_ok() {
            return Err(MediaStoreError::Duplicate);
        }
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(mime);
        if let Err(e) = put.send().await {
            error!("put_object failed reference={reference} key={key} bucket={} err={:?}", self.bucket, e);
            return Err(MediaStoreError::Other(e.to_string()));
        }
        Ok(())
    }

    async fn load(&self, reference: &str) -> Result<(Vec<u8>, String), MediaStoreError> {
        if !is_valid_reference(reference) {
            return Err(MediaStoreError::NotFound);
        }
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key_for(reference))
            .send()
            .await
            .map_err(|_| MediaStoreError::NotFound)?;
        let data = obj.body.collect().await.map_err(|e| MediaStoreError::Other(e.to_string()))?;
        let bytes = data.into_bytes().to_vec();
        let mime = sniff_mime(&bytes);
        Ok((bytes, mime))
    }

    async fn delete(&self, reference: &str) -> Result<(), MediaStoreError> {
        if !is_valid_reference(reference) {
            return Ok(());
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key_for(reference))
            .send()
            .await
            .map_err(|e| MediaStoreError::Other(e.to_string()))?;
        Ok(())
    }
}

/// `MEDIA_BACKEND=s3` selects S3/MinIO, anything else the local filesystem.
pub async fn build_media_store() -> anyhow::Result<Arc<dyn MediaStore>> {
    match std::env::var("MEDIA_BACKEND").as_deref() {
        Ok("s3") => Ok(Arc::new(S3MediaStore::new().await?)),
        _ => Ok(Arc::new(FsMediaStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4, 0x89,
    ];

    #[test]
    fn classify_png_as_image() {
        let (kind, mime) = classify(PNG).unwrap();
        assert_eq!(kind, MediaKind::Image);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn classify_rejects_plain_text() {
        assert!(matches!(classify(b"hello world"), Err(Rejection::UnsupportedType(_))));
    }

    #[test]
    fn classify_rejects_oversized_image() {
        let mut big = PNG.to_vec();
        big.resize(IMAGE_LIMIT + 1, 0);
        assert_eq!(classify(&big), Err(Rejection::TooLarge { kind: MediaKind::Image, limit: IMAGE_LIMIT }));
    }

    #[test]
    fn references_are_hex_digests() {
        let r = reference_for(b"abc");
        assert!(is_valid_reference(&r));
        assert!(!is_valid_reference("../etc/passwd"));
    }

    #[tokio::test]
    async fn fs_store_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMediaStore::at(dir.path());
        let r = reference_for(PNG);
        store.save(&r, "image/png", PNG).await.unwrap();
        assert!(matches!(store.save(&r, "image/png", PNG).await, Err(MediaStoreError::Duplicate)));
        let (bytes, mime) = store.load(&r).await.unwrap();
        assert_eq!(bytes, PNG);
        assert_eq!(mime, "image/png");
        store.delete(&r).await.unwrap();
        assert!(matches!(store.load(&r).await, Err(MediaStoreError::NotFound)));
    }
}
