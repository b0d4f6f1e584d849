use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;
use tracing::debug;

use crate::application::ports::ImageSourcePort;
use crate::application::services::decode_image;
use crate::domain::errors::{DomainError, DomainResult};

/// Loads images from local paths or http(s) URLs.
pub struct FsHttpImageSource {
    client: reqwest::Client,
}

impl FsHttpImageSource {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    async fn fetch(&self, url: &str) -> DomainResult<Vec<u8>> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DomainError::ImageLoad(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            return Err(DomainError::ImageLoad(format!("{url} returned {status}")));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| DomainError::ImageLoad(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageSourcePort for FsHttpImageSource {
    async fn load(&self, source: &str) -> DomainResult<DynamicImage> {
        let bytes = if is_remote(source) {
            self.fetch(source).await?
        } else {
            tokio::fs::read(source)
                .await
                .map_err(|e| DomainError::ImageLoad(format!("{source}: {e}")))?
        };
        debug!("Loaded {} bytes from {}", bytes.len(), source);

        tokio::task::spawn_blocking(move || decode_image(&bytes))
            .await
            .map_err(|e| DomainError::ImageLoad(e.to_string()))?
    }
}

pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    fn source() -> FsHttpImageSource {
        FsHttpImageSource::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn loads_local_png() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(6, 4, Rgb([1, 2, 3])).save_with_format(&path, ImageFormat::Png)?;

        let img = source().load(path.to_str().unwrap()).await?;
        assert_eq!((img.width(), img.height()), (6, 4));
        assert_eq!(img.to_rgb8().get_pixel(0, 0), &Rgb([1, 2, 3]));
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_image_load_error() {
        let err = source().load("/definitely/not/here.jpg").await.unwrap_err();
        assert!(matches!(err, DomainError::ImageLoad(_)));
        assert!(err.to_string().starts_with("Error loading image:"));
    }

    #[tokio::test]
    async fn garbage_bytes_are_image_load_error() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image at all")?;

        let err = source().load(path.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, DomainError::ImageLoad(_)));
        Ok(())
    }

    #[test]
    fn recognises_remote_sources() {
        assert!(is_remote("https://example.com/a.jpg"));
        assert!(is_remote("http://example.com/a.jpg"));
        assert!(!is_remote("demos/example1.ppm"));
        assert!(!is_remote("httpdocs/a.jpg"));
    }
}
