use async_trait::async_trait;
use image::{DynamicImage, RgbImage};

use crate::domain::{
    config::ModelConfig, counts::VehicleCounts, detection::Detection, errors::DomainResult,
    model::ModelFiles,
};

/// Opaque object detector: image in, thresholded scored boxes out.
///
/// Implementations are called from blocking threads and may be shared across
/// concurrent requests.
pub trait DetectionModelPort: Send + Sync {
    fn detect(&self, image: &RgbImage, threshold: f32) -> DomainResult<Vec<Detection>>;
}

#[async_trait]
pub trait ImageSourcePort: Send + Sync {
    /// Loads a filesystem path or an http(s) URL.
    async fn load(&self, source: &str) -> DomainResult<DynamicImage>;
}

#[async_trait]
pub trait ModelCatalogPort: Send + Sync {
    async fn resolve(&self, model: &ModelConfig) -> DomainResult<ModelFiles>;
}

pub trait RenderPort: Send + Sync {
    fn render(
        &self,
        image: &RgbImage,
        detections: &[Detection],
        counts: &VehicleCounts,
    ) -> DomainResult<RgbImage>;
}
