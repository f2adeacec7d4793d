//! Collaborators the worker drives inside the render lock: the opaque
//! renderer that turns parameters into an image file, and the publisher that
//! turns that file into a fetchable URL.

use crate::config::StorageArgs;
use crate::{Fingerprint, RenderRequest};
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

const ASSET_CONTENT_TYPE: &str = "image/png";
/// Published assets are content-addressed and never rewritten.
const ASSET_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{0}")]
    Renderer(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeOption {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Produces the image for `request` at `output`, or fails with a message.
    async fn render(&self, request: &RenderRequest, output: &Path) -> Result<(), RenderError>;

    async fn list_themes(&self) -> Result<Vec<ThemeOption>, RenderError>;

    async fn has_theme(&self, theme_id: &str) -> bool;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Makes `file` durable under `fingerprint` and returns where it can be fetched.
    async fn publish(&self, fingerprint: &Fingerprint, file: &Path) -> Result<String, RenderError>;
}

/// Runs an external poster program once per render.
///
/// The program is called as
/// `<program> --city C --country K --theme T --distance D --width W --height H --output PATH`
/// and must exit with status 0 after writing `PATH`.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: PathBuf,
    themes_dir: PathBuf,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>, themes_dir: impl Into<PathBuf>) -> Self {
        CommandRenderer {
            program: program.into(),
            themes_dir: themes_dir.into(),
        }
    }

    fn theme_path(&self, theme_id: &str) -> PathBuf {
        self.themes_dir.join(format!("{theme_id}.json"))
    }
}

#[derive(Deserialize)]
struct ThemeFile {
    name: Option<String>,
    description: Option<String>,
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, request: &RenderRequest, output: &Path) -> Result<(), RenderError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(message = "Running renderer", program = ?self.program, output = ?output);
        let result = Command::new(&self.program)
            .arg("--city")
            .arg(&request.city)
            .arg("--country")
            .arg(&request.country)
            .arg("--theme")
            .arg(&request.theme)
            .arg("--distance")
            .arg(request.distance.to_string())
            .arg("--width")
            .arg(request.width.to_string())
            .arg("--height")
            .arg(request.height.to_string())
            .arg("--output")
            .arg(output)
            .env("POSTER_THEMES_DIR", &self.themes_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = stderr.trim();
            return Err(RenderError::Renderer(if detail.is_empty() {
                format!("renderer exited with {}", result.status)
            } else {
                detail.to_string()
            }));
        }
        if !tokio::fs::try_exists(output).await? {
            return Err(RenderError::Renderer(format!(
                "renderer produced no file at {}",
                output.display()
            )));
        }
        Ok(())
    }

    async fn list_themes(&self) -> Result<Vec<ThemeOption>, RenderError> {
        let mut entries = tokio::fs::read_dir(&self.themes_dir).await?;
        let mut themes = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let raw = tokio::fs::read_to_string(&path).await?;
            let file: ThemeFile = match serde_json::from_str(&raw) {
                Ok(file) => file,
                Err(err) => {
                    warn!(message = "Skipping unreadable theme", theme = %id, error = %err);
                    continue;
                }
            };
            themes.push(ThemeOption {
                name: file.name.unwrap_or_else(|| id.clone()),
                description: file.description.unwrap_or_default(),
                id,
            });
        }
        themes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(themes)
    }

    async fn has_theme(&self, theme_id: &str) -> bool {
        tokio::fs::try_exists(self.theme_path(theme_id))
            .await
            .unwrap_or(false)
    }
}

/// Publishes into a local directory served under `url_prefix`.
#[derive(Debug, Clone)]
pub struct LocalPublisher {
    cache_dir: PathBuf,
    url_prefix: String,
}

impl LocalPublisher {
    pub fn new(cache_dir: impl Into<PathBuf>, url_prefix: &str) -> Self {
        LocalPublisher {
            cache_dir: cache_dir.into(),
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn local_asset_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.cache_dir.join(format!("{fingerprint}.png"))
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, fingerprint: &Fingerprint, file: &Path) -> Result<String, RenderError> {
        let target = self.local_asset_path(fingerprint);
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| RenderError::Publish(e.to_string()))?;
        tokio::fs::copy(file, &target)
            .await
            .map_err(|e| RenderError::Publish(format!("{}: {e}", target.display())))?;
        Ok(format!("{}/{fingerprint}.png", self.url_prefix))
    }
}

/// Uploads assets to an S3-compatible bucket as `{prefix}/{fingerprint}.png`.
///
/// Without a public base URL the bucket copy is not fetchable, so the file
/// is also published locally and the local URL returned.
#[derive(Debug, Clone)]
pub struct ObjectStorePublisher {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    public_base_url: Option<String>,
    local: LocalPublisher,
}

impl ObjectStorePublisher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        public_base_url: Option<&str>,
        local: LocalPublisher,
    ) -> Self {
        ObjectStorePublisher {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            public_base_url: public_base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            local,
        }
    }

    pub fn object_key(&self, fingerprint: &Fingerprint) -> String {
        if self.prefix.is_empty() {
            format!("{fingerprint}.png")
        } else {
            format!("{}/{fingerprint}.png", self.prefix)
        }
    }
}

#[async_trait]
impl Publisher for ObjectStorePublisher {
    async fn publish(&self, fingerprint: &Fingerprint, file: &Path) -> Result<String, RenderError> {
        let body = tokio::fs::read(file)
            .await
            .map_err(|e| RenderError::Publish(format!("{}: {e}", file.display())))?;
        let key = self.object_key(fingerprint);

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, ASSET_CONTENT_TYPE.into());
        attributes.insert(Attribute::CacheControl, ASSET_CACHE_CONTROL.into());
        let options = PutOptions {
            attributes,
            ..PutOptions::default()
        };
        self.store
            .put_opts(&ObjectPath::from(key.as_str()), PutPayload::from(body), options)
            .await
            .map_err(|e| RenderError::Publish(format!("{key}: {e}")))?;
        debug!(message = "Uploaded asset", key = %key);

        match &self.public_base_url {
            Some(base) => Ok(format!("{base}/{key}")),
            None => self.local.publish(fingerprint, file).await,
        }
    }
}

/// Bucket publisher when object storage is fully configured, local otherwise.
pub fn publisher(storage: &StorageArgs, local: LocalPublisher) -> Result<Arc<dyn Publisher>, RenderError> {
    let Some(bucket) = storage.bucket() else {
        debug!("Object storage not configured, publishing locally");
        return Ok(Arc::new(local));
    };
    let store = AmazonS3Builder::new()
        .with_endpoint(bucket.endpoint)
        .with_region(bucket.region)
        .with_bucket_name(bucket.name)
        .with_access_key_id(bucket.access_key_id)
        .with_secret_access_key(bucket.secret_access_key)
        .build()
        .map_err(|e| RenderError::Publish(e.to_string()))?;
    info!(message = "Publishing to object storage", bucket = %bucket.name);
    Ok(Arc::new(ObjectStorePublisher::new(
        Arc::new(store),
        &storage.object_prefix,
        storage.public_base_url.as_deref(),
        local,
    )))
}

/// Joins a relative asset URL onto `base`; absolute URLs pass through.
pub fn absolute_asset_url(base: &str, asset_url: &str) -> String {
    if asset_url.starts_with("http://") || asset_url.starts_with("https://") {
        return asset_url.to_string();
    }
    let base = base.trim_end_matches('/');
    if asset_url.starts_with('/') {
        format!("{base}{asset_url}")
    } else {
        format!("{base}/{asset_url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("posterq-test-{}", Uuid::new_v4()))
    }

    #[test]
    fn absolute_urls() {
        assert_eq!(
            absolute_asset_url("http://api:8000/", "/v1/assets/a.png"),
            "http://api:8000/v1/assets/a.png"
        );
        assert_eq!(absolute_asset_url("http://api", "v1/a.png"), "http://api/v1/a.png");
        assert_eq!(
            absolute_asset_url("http://api", "https://cdn/x.png"),
            "https://cdn/x.png"
        );
    }

    #[tokio::test]
    async fn local_publisher_copies_into_cache() {
        let dir = scratch_dir();
        let source = dir.join("render.png");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&source, b"png").await.unwrap();

        let publisher = LocalPublisher::new(dir.join("cache"), "/v1/assets/");
        let fp = Fingerprint::from_hex("beef");
        let url = publisher.publish(&fp, &source).await.unwrap();
        assert_eq!(url, "/v1/assets/beef.png");
        let copied = tokio::fs::read(publisher.local_asset_path(&fp)).await.unwrap();
        assert_eq!(copied, b"png");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn publishing_missing_file_fails() {
        let dir = scratch_dir();
        let publisher = LocalPublisher::new(&dir, "/v1/assets");
        let err = publisher
            .publish(&Fingerprint::from_hex("beef"), &dir.join("nope.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Publish(_)));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    fn bucket_publisher(dir: &Path, public_base_url: Option<&str>) -> (Arc<InMemory>, ObjectStorePublisher) {
        let bucket = Arc::new(InMemory::new());
        let local = LocalPublisher::new(dir.join("cache"), "/v1/assets");
        let publisher = ObjectStorePublisher::new(bucket.clone(), "/posters/", public_base_url, local);
        (bucket, publisher)
    }

    #[tokio::test]
    async fn object_store_publisher_uploads_under_prefix() {
        let dir = scratch_dir();
        let source = dir.join("render.png");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&source, b"png").await.unwrap();

        let (bucket, publisher) = bucket_publisher(&dir, Some("https://cdn.example.com/"));
        let fp = Fingerprint::from_hex("beef");
        assert_eq!(publisher.object_key(&fp), "posters/beef.png");

        let url = publisher.publish(&fp, &source).await.unwrap();
        assert_eq!(url, "https://cdn.example.com/posters/beef.png");
        let stored = bucket
            .get(&ObjectPath::from("posters/beef.png"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), b"png");
        assert!(!tokio::fs::try_exists(dir.join("cache/beef.png")).await.unwrap());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn object_store_publisher_without_public_url_serves_locally() {
        let dir = scratch_dir();
        let source = dir.join("render.png");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&source, b"png").await.unwrap();

        let (bucket, publisher) = bucket_publisher(&dir, None);
        let fp = Fingerprint::from_hex("cafe");
        let url = publisher.publish(&fp, &source).await.unwrap();
        assert_eq!(url, "/v1/assets/cafe.png");
        assert!(bucket.head(&ObjectPath::from("posters/cafe.png")).await.is_ok());
        assert!(tokio::fs::try_exists(dir.join("cache/cafe.png")).await.unwrap());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn unconfigured_storage_falls_back_to_local() {
        let dir = scratch_dir();
        let source = dir.join("render.png");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&source, b"png").await.unwrap();

        let storage = StorageArgs {
            endpoint: Some("https://r2.example.com".into()),
            bucket: Some("  ".into()),
            ..StorageArgs::default()
        };
        let publisher = publisher(&storage, LocalPublisher::new(dir.join("cache"), "/v1/assets")).unwrap();
        let url = publisher.publish(&Fingerprint::from_hex("f00d"), &source).await.unwrap();
        assert_eq!(url, "/v1/assets/f00d.png");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn themes_are_listed_from_json_files() {
        let dir = scratch_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("noir.json"), r#"{"name":"Noir","description":"Dark"}"#)
            .await
            .unwrap();
        tokio::fs::write(dir.join("blank.json"), "{}").await.unwrap();
        tokio::fs::write(dir.join("notes.txt"), "ignored").await.unwrap();

        let renderer = CommandRenderer::new("/bin/false", &dir);
        let themes = renderer.list_themes().await.unwrap();
        assert_eq!(
            themes,
            vec![
                ThemeOption {
                    id: "blank".into(),
                    name: "blank".into(),
                    description: String::new(),
                },
                ThemeOption {
                    id: "noir".into(),
                    name: "Noir".into(),
                    description: "Dark".into(),
                },
            ]
        );
        assert!(renderer.has_theme("noir").await);
        assert!(!renderer.has_theme("sepia").await);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_reports_renderer_error() {
        let dir = scratch_dir();
        let renderer = CommandRenderer::new("/bin/false", &dir);
        let request = RenderRequest::new("Paris", "France", "noir", crate::JobKind::Poster);
        let err = renderer.render(&request, &dir.join("out.png")).await.unwrap_err();
        assert!(matches!(err, RenderError::Renderer(_)), "{err:?}");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
