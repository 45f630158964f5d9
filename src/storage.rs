//! Object storage for uploaded originals and generated artifacts
//!
//! Objects are written once under a fresh key and never updated or deleted.
//! Every `put` returns the public URL the object can be read back from.

use crate::config::StorageConfig;
use crate::error::{FuseError, Result};
use crate::retry::ensure_success;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Write-once blob store returning public URLs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return its public URL
    ///
    /// # Errors
    /// - Upload rejected by the backend
    /// - Network failures
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    /// Human-readable backend name for logs
    fn name(&self) -> &'static str;
}

/// Fresh object key of the form `{uuid}-{suffix}`
pub fn object_key(suffix: &str) -> String {
    format!("{}-{}", uuid::Uuid::new_v4(), suffix)
}

/// Restrict a client-provided file name to `[A-Za-z0-9._-]`
///
/// Other characters become `_`; leading dots are stripped so the key never
/// looks like a hidden or relative path. Empty results fall back to `upload`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.chars().take(128).collect()
    }
}

/// Supabase Storage over its REST API
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    client: Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl SupabaseStorage {
    pub fn new(client: Client, config: &StorageConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
        }
    }

    fn upload_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, key)
    }

    /// Public URL of an object in a public bucket
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, key
        )
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let size = bytes.len();
        log::debug!("Uploading {} ({} bytes, {})", key, size, content_type);

        let response = self
            .client
            .post(self.upload_url(key))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|e| FuseError::storage(format!("Upload of '{}' failed: {}", key, e)))?;

        ensure_success("Supabase Storage", response)
            .await
            .map_err(|e| FuseError::storage(format!("Upload of '{}' rejected: {}", key, e)))?;

        log::info!("Stored {} in bucket {} ({} bytes)", key, self.bucket, size);
        Ok(self.public_url(key))
    }

    fn name(&self) -> &'static str {
        "supabase"
    }
}

/// A stored object in `MemoryStore`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-process store for tests and offline runs
///
/// URLs are built from a configurable prefix so that tests can serve them.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    url_prefix: String,
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl MemoryStore {
    pub fn new<S: Into<String>>(url_prefix: S) -> Self {
        Self {
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
            objects: Arc::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(key).cloned())
    }

    /// Look an object up by the URL `put` returned for it
    pub fn get_by_url(&self, url: &str) -> Option<StoredObject> {
        let key = url.strip_prefix(&self.url_prefix)?.trim_start_matches('/');
        self.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| {
                let mut keys: Vec<String> = objects.keys().cloned().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| FuseError::storage("memory store lock poisoned"))?;
        if objects.contains_key(key) {
            return Err(FuseError::storage(format!("Object '{}' already exists", key)));
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("{}/{}", self.url_prefix, key))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
