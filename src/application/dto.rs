use base64::{prelude::BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::application::services::ProcessOutcome;
use crate::domain::{
    config::{AppConfig, VehicleConfig},
    counts::VehicleCounts,
    detection::DetectionInfo,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub title: String,
    pub description: String,
    pub examples: Vec<String>,
    pub theme: String,
    pub allow_flagging: bool,
    pub classes: Vec<ClassInfo>,
}

impl ConfigResponse {
    pub fn new(app: &AppConfig, vehicles: &VehicleConfig) -> Self {
        let classes = vehicles
            .target_classes()
            .iter()
            .map(|name| ClassInfo {
                name: name.clone(),
                color: vehicles
                    .color_for(name)
                    .map(|c| c.token().to_string())
                    .unwrap_or_default(),
            })
            .collect();
        Self {
            title: app.title.clone(),
            description: app.description.clone(),
            examples: app.examples.clone(),
            theme: app.theme.clone(),
            allow_flagging: app.allow_flagging,
            classes,
        }
    }
}

/// Body of `POST /api/detect`. `image` is a base64 PNG, absent on error.
#[derive(Debug, Clone, Serialize)]
pub struct DetectResponse {
    pub image: Option<String>,
    pub summary: String,
    pub counts: Option<VehicleCounts>,
    pub detections: Vec<DetectionInfo>,
}

impl From<ProcessOutcome> for DetectResponse {
    fn from(o: ProcessOutcome) -> Self {
        Self {
            image: o.image_png.map(|png| BASE64_STANDARD.encode(png)),
            summary: o.summary,
            counts: o.counts,
            detections: o.detections,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}
