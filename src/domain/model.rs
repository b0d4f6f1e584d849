use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// On-disk layout of an exported model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFiles {
    pub name: String,         // identifier, e.g. "facebook/detr-resnet-50"
    pub onnx_path: PathBuf,   // <models>/<name>/model.onnx
    pub config_path: PathBuf, // <models>/<name>/config.json
    pub preprocessor_path: Option<PathBuf>,
}

/// DETR image processor settings (mirrors `preprocessor_config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetrParams {
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub size: ResizeParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResizeParams {
    pub shortest_edge: u32,
    pub longest_edge: u32,
}

impl Default for ResizeParams {
    fn default() -> Self {
        Self {
            shortest_edge: 800,
            longest_edge: 1333,
        }
    }
}

impl Default for DetrParams {
    fn default() -> Self {
        Self {
            image_mean: [0.485, 0.456, 0.406],
            image_std: [0.229, 0.224, 0.225],
            size: ResizeParams::default(),
        }
    }
}

/// The slice of a Hugging Face `config.json` this service reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelMap {
    #[serde(default)]
    pub id2label: HashMap<String, String>,
}

impl LabelMap {
    pub fn label(&self, class_id: usize) -> String {
        self.id2label
            .get(&class_id.to_string())
            .cloned()
            .unwrap_or_else(|| format!("LABEL_{class_id}"))
    }
}
