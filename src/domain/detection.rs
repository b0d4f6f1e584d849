use serde::{Deserialize, Serialize};

/// One scored box reported by the detection model, in source-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub class_id: usize,
    pub label: String,
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Text drawn next to the box, e.g. `car: 0.91`.
    pub fn caption(&self) -> String {
        format!("{}: {:.2}", self.label, self.score)
    }
}

/// Vehicle-only view of a detection, as handed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionInfo {
    pub label: String,
    pub score: f32,
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    pub color: String,
}
