use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use atelier_config::PathsConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ImageGenError, Result};

/// Where generated images land and how they are addressed publicly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    image_output: PathBuf,
    client: PathBuf,
}

impl OutputPaths {
    pub fn new(image_output: impl Into<PathBuf>, client: impl Into<PathBuf>) -> Self {
        Self {
            image_output: image_output.into(),
            client: client.into(),
        }
    }

    pub fn from_config(config: &PathsConfig) -> Self {
        Self::new(&config.image_output, &config.client)
    }

    /// Directory holding one user's images
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailed` unless the user id is a single plain path
    /// component
    pub fn user_dir(&self, user_id: &str) -> Result<PathBuf> {
        validate_user_id(user_id)?;
        Ok(self.image_output.join(user_id))
    }

    /// Create the user's directory if needed and return it
    ///
    /// Creation is idempotent, so concurrent calls for one user are safe.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailed` if the directory cannot be created
    pub async fn ensure_user_dir(&self, user_id: &str) -> Result<PathBuf> {
        let dir = self.user_dir(user_id)?;

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ImageGenError::PersistenceFailed(format!("failed to create {}: {e}", dir.display()))
        })?;

        Ok(dir)
    }

    /// URL path under which the client serves a stored image
    ///
    /// Both roots are resolved against the working directory before the
    /// output root is taken relative to the client root. The first
    /// `public/` segment is then dropped and separators become `/`.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailed` for an invalid user id or a root that
    /// cannot be resolved
    pub fn public_url(&self, user_id: &str, filename: &str) -> Result<String> {
        validate_user_id(user_id)?;

        let relative = relative_to(&resolve(&self.image_output)?, &resolve(&self.client)?);

        let joined = relative.join(user_id).join(filename);
        let normalized = joined.to_string_lossy().replace('\\', "/");
        let path = normalized.replacen("public/", "", 1);

        Ok(format!("/{}", path.trim_start_matches('/')))
    }
}

/// Absolute path with `.` and `..` folded away, without touching the disk
fn resolve(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .map_err(|e| ImageGenError::PersistenceFailed(format!("failed to resolve {}: {e}", path.display())))?;

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other),
        }
    }

    Ok(resolved)
}

// `..` for every base component not shared with `path`, then the rest of `path`
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path: Vec<Component<'_>> = path.components().collect();
    let base: Vec<Component<'_>> = base.components().collect();

    let common = path.iter().zip(&base).take_while(|(a, b)| a == b).count();

    base[common..]
        .iter()
        .map(|_| Component::ParentDir)
        .chain(path[common..].iter().copied())
        .collect()
}

fn validate_user_id(user_id: &str) -> Result<()> {
    let mut components = Path::new(user_id).components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !user_id.contains(['/', '\\']) => Ok(()),
        _ => Err(ImageGenError::PersistenceFailed(format!("invalid user id '{user_id}'"))),
    }
}

/// Purpose a stored file was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileContext {
    ImageGeneration,
}

/// Image handed to an [`ImageUploader`]
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    pub buffer: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub filename: String,
    pub mime_type: String,
    pub file_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: String,
    pub context: FileContext,
    pub metadata: UploadMetadata,
}

/// Record describing a stored image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFile {
    pub file_id: Uuid,
    pub filename: String,
    pub filepath: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub context: FileContext,
    /// Storage-specific fields passed through untouched
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

/// Storage collaborator for persisted generations
#[async_trait]
pub trait ImageUploader: Send + Sync {
    /// Store the image and describe where it went
    async fn upload(&self, request: UploadRequest) -> Result<StoredFile>;
}

/// Writes uploads under the per-user output directory
#[derive(Debug, Clone)]
pub struct LocalImageStorage {
    paths: OutputPaths,
}

impl LocalImageStorage {
    pub fn new(paths: OutputPaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl ImageUploader for LocalImageStorage {
    async fn upload(&self, request: UploadRequest) -> Result<StoredFile> {
        let metadata = request.metadata;
        let dir = self.paths.ensure_user_dir(&request.user_id).await?;
        let target = dir.join(&metadata.filename);

        tokio::fs::write(&target, &metadata.buffer).await.map_err(|e| {
            ImageGenError::PersistenceFailed(format!("failed to write {}: {e}", target.display()))
        })?;

        tracing::debug!(path = %target.display(), bytes = metadata.bytes, "stored generated image");

        Ok(StoredFile {
            file_id: metadata.file_id,
            filepath: self.paths.public_url(&request.user_id, &metadata.filename)?,
            filename: metadata.filename,
            width: metadata.width,
            height: metadata.height,
            bytes: metadata.bytes,
            mime_type: metadata.mime_type,
            context: request.context,
            extra: Map::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_drops_public_segment() {
        let paths = OutputPaths::new("client/public/images", "client");

        assert_eq!(
            paths.public_url("user-1", "abc.png").unwrap(),
            "/images/user-1/abc.png"
        );
    }

    #[test]
    fn public_url_for_absolute_roots() {
        let paths = OutputPaths::new("/srv/app/client/public/images", "/srv/app/client");

        assert_eq!(
            paths.public_url("u", "abc.png").unwrap(),
            "/images/u/abc.png"
        );
    }

    #[test]
    fn public_url_for_differently_spelled_roots() {
        let cwd = std::env::current_dir().unwrap();
        let cases = [
            OutputPaths::new("./client/public/images", "client"),
            OutputPaths::new("client/public/images", "./client/"),
            OutputPaths::new(cwd.join("client/public/images"), "client"),
            OutputPaths::new("client/public/images", cwd.join("client")),
            OutputPaths::new("client/assets/../public/images", "client"),
        ];

        for paths in cases {
            assert_eq!(paths.public_url("u", "a.png").unwrap(), "/images/u/a.png", "{paths:?}");
        }
    }

    #[test]
    fn public_url_outside_the_client_root_climbs_out() {
        let paths = OutputPaths::new("/srv/images", "/srv/app/client");

        assert_eq!(paths.public_url("u", "a.png").unwrap(), "/../../images/u/a.png");
    }

    #[test]
    fn rejects_user_ids_that_escape_the_output_root() {
        let paths = OutputPaths::new("client/public/images", "client");

        for user in ["", "..", ".", "a/b", "../other", "/etc", "a\\b"] {
            assert!(paths.user_dir(user).is_err(), "accepted {user:?}");
        }
        assert!(paths.user_dir("64f0c2a1e9").is_ok());
    }

    #[test]
    fn stored_file_wire_format() {
        let file = StoredFile {
            file_id: Uuid::nil(),
            filename: "x.png".to_owned(),
            filepath: "/images/u/x.png".to_owned(),
            width: 512,
            height: 512,
            bytes: 42,
            mime_type: "image/png".to_owned(),
            context: FileContext::ImageGeneration,
            extra: Map::new(),
        };

        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["type"], "image/png");
        assert_eq!(value["context"], "image_generation");
        assert_eq!(value["file_id"], "00000000-0000-0000-0000-000000000000");
    }

    #[tokio::test]
    async fn local_storage_creates_user_dir_and_writes() {
        let root = tempfile::tempdir().unwrap();
        let client = root.path().join("client");
        let paths = OutputPaths::new(client.join("public/images"), &client);
        let storage = LocalImageStorage::new(paths);

        let file_id = Uuid::new_v4();
        let stored = storage
            .upload(UploadRequest {
                user_id: "u1".to_owned(),
                context: FileContext::ImageGeneration,
                metadata: UploadMetadata {
                    buffer: vec![1, 2, 3, 4],
                    width: 2,
                    height: 2,
                    bytes: 4,
                    filename: format!("{file_id}.png"),
                    mime_type: "image/png".to_owned(),
                    file_id,
                },
            })
            .await
            .unwrap();

        let written = std::fs::read(client.join("public/images/u1").join(&stored.filename)).unwrap();
        assert_eq!(written, vec![1, 2, 3, 4]);
        assert_eq!(stored.filepath, format!("/images/u1/{file_id}.png"));
        assert_eq!(stored.file_id, file_id);
    }

    #[tokio::test]
    async fn concurrent_directory_creation_is_harmless() {
        let root = tempfile::tempdir().unwrap();
        let paths = OutputPaths::new(root.path().join("out"), root.path());

        let (a, b) = tokio::join!(paths.ensure_user_dir("same"), paths.ensure_user_dir("same"));

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert!(root.path().join("out/same").is_dir());
    }
}
