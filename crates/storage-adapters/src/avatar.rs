//! # Filesystem avatar store
//!
//! Content-addressable layout `<root>/<bucket>/<sha1(user id)>.image` where the bucket is
//! `crc64(sha1) % 100`, printed with two digits. Images are shrunk to fit `resize_limit`
//! on the longest side and re-encoded as PNG.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use crc::{Crc, CRC_64_XZ};
use domains::AvatarStore;
use image::imageops::FilterType;
use image::ImageFormat;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);
const AVATAR_EXT: &str = ".image";

#[derive(Error, Debug)]
pub enum AvatarError {
    #[error("invalid avatar name {0:?}")]
    InvalidName(String),
    #[error("avatar {0} not found")]
    NotFound(String),
    #[error("can't process avatar image: {0}")]
    Image(#[from] image::ImageError),
}

pub struct FsAvatarStore {
    root: PathBuf,
    resize_limit: u32,
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl FsAvatarStore {
    pub fn new(root: impl Into<PathBuf>, resize_limit: u32) -> Self {
        Self { root: root.into(), resize_limit }
    }

    /// Avatar name for a user id.
    pub fn avatar_name(user_id: &str) -> String {
        format!("{}{AVATAR_EXT}", sha1_hex(user_id.as_bytes()))
    }

    fn location(&self, avatar: &str) -> Result<PathBuf, AvatarError> {
        let hash = avatar
            .strip_suffix(AVATAR_EXT)
            .filter(|h| h.len() == 40 && h.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| AvatarError::InvalidName(avatar.to_string()))?;
        let bucket = CRC64.checksum(hash.as_bytes()) % 100;
        Ok(self.root.join(format!("{bucket:02}")).join(avatar))
    }

    /// Fits the image into `limit` pixels on its longest side and encodes it as PNG.
    fn resize(data: &[u8], limit: u32) -> Result<Vec<u8>, AvatarError> {
        let mut img = image::load_from_memory(data)?;
        if limit > 0 && (img.width() > limit || img.height() > limit) {
            img = img.resize(limit, limit, FilterType::Triangle);
        }
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        match oxipng::optimize_from_memory(&png, &oxipng::Options::default()) {
            Ok(optimized) => Ok(optimized),
            Err(e) => {
                debug!("png optimization skipped, {e}");
                Ok(png)
            }
        }
    }

    async fn files_in(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(AVATAR_EXT) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl AvatarStore for FsAvatarStore {
    async fn put(&self, user_id: &str, data: Bytes) -> anyhow::Result<String> {
        let avatar = Self::avatar_name(user_id);
        let path = self.location(&avatar)?;
        let limit = self.resize_limit;
        let png = tokio::task::spawn_blocking(move || Self::resize(&data, limit)).await??;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &png).await?;
        debug!(user = user_id, avatar, size = png.len(), "avatar saved");
        Ok(avatar)
    }

    async fn get(&self, avatar: &str) -> anyhow::Result<Bytes> {
        let path = self.location(avatar)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AvatarError::NotFound(avatar.to_string()).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn id(&self, avatar: &str) -> anyhow::Result<String> {
        let path = self.location(avatar)?;
        let modified = match fs::metadata(&path).await {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AvatarError::NotFound(avatar.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };
        let mtime = modified.duration_since(std::time::UNIX_EPOCH)?.as_secs();
        Ok(sha1_hex(format!("{avatar}{mtime}").as_bytes()))
    }

    async fn remove(&self, avatar: &str) -> anyhow::Result<()> {
        let path = self.location(avatar)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AvatarError::NotFound(avatar.to_string()).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut avatars = Vec::new();
        let mut buckets = match fs::read_dir(&self.root).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(avatars),
            Err(e) => return Err(e.into()),
        };
        while let Some(bucket) = buckets.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            match Self::files_in(&bucket.path()).await {
                Ok(names) => avatars.extend(names),
                Err(e) => warn!("can't list avatar bucket {}, {e}", bucket.path().display()),
            }
        }
        avatars.sort();
        Ok(avatars)
    }
}
