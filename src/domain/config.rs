use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::{DomainError, DomainResult};

/// Where inference runs. `Accelerator` falls back to CPU when no GPU provider registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Accelerator,
}

impl FromStr for Device {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "accelerator" | "gpu" | "cuda" => Ok(Device::Accelerator),
            other => Err(DomainError::InvalidInput(format!("unknown device: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_identifier: String,
    pub confidence_threshold: f32,
    pub device: Device,
}

impl ModelConfig {
    pub fn new(
        model_identifier: impl Into<String>,
        confidence_threshold: f32,
        device: Device,
    ) -> DomainResult<Self> {
        let model_identifier = model_identifier.into();
        if model_identifier.trim().is_empty() {
            return Err(DomainError::InvalidInput("model identifier empty".into()));
        }
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(DomainError::InvalidInput(format!(
                "confidence threshold must be within [0, 1], got {confidence_threshold}"
            )));
        }
        Ok(Self {
            model_identifier,
            confidence_threshold,
            device,
        })
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_identifier: "facebook/detr-resnet-50".to_string(),
            confidence_threshold: 0.7,
            device: Device::Accelerator,
        }
    }
}

/// Display color parsed from a token such as `red` or `#ff8800`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Color {
    token: String,
    rgb: [u8; 3],
}

impl Color {
    pub fn rgb(&self) -> [u8; 3] {
        self.rgb
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl FromStr for Color {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        let token = s.trim().to_ascii_lowercase();
        let rgb = match token.as_str() {
            "red" => [255, 0, 0],
            "green" => [0, 128, 0],
            "blue" => [0, 0, 255],
            "yellow" => [255, 255, 0],
            "orange" => [255, 165, 0],
            "purple" => [128, 0, 128],
            "cyan" => [0, 255, 255],
            "magenta" => [255, 0, 255],
            "white" => [255, 255, 255],
            "black" => [0, 0, 0],
            "gray" | "grey" => [128, 128, 128],
            hex if hex.starts_with('#') && hex.len() == 7 && hex.is_ascii() => {
                let channel = |i: usize| {
                    u8::from_str_radix(&hex[i..i + 2], 16)
                        .map_err(|_| DomainError::InvalidInput(format!("bad color: {s}")))
                };
                [channel(1)?, channel(3)?, channel(5)?]
            }
            _ => return Err(DomainError::InvalidInput(format!("bad color: {s}"))),
        };
        Ok(Self { token, rgb })
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

impl Serialize for Color {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.token)
    }
}

/// Vehicle taxonomy: which labels are counted and how each one is drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleConfig {
    target_classes: Vec<String>,
    colors: HashMap<String, Color>,
}

impl VehicleConfig {
    pub fn new(target_classes: Vec<String>, colors: HashMap<String, Color>) -> DomainResult<Self> {
        if target_classes.is_empty() {
            return Err(DomainError::InvalidInput("no target classes".into()));
        }
        for (i, class) in target_classes.iter().enumerate() {
            if target_classes[..i].contains(class) {
                return Err(DomainError::InvalidInput(format!("duplicate class: {class}")));
            }
            if !colors.contains_key(class) {
                return Err(DomainError::InvalidInput(format!("no color for class: {class}")));
            }
        }
        Ok(Self {
            target_classes,
            colors,
        })
    }

    /// Builds a config from `(class, color token)` pairs, keeping their order.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> DomainResult<Self> {
        let mut classes = Vec::new();
        let mut colors = HashMap::new();
        for (class, token) in pairs {
            classes.push(class.to_string());
            colors.insert(class.to_string(), token.parse()?);
        }
        Self::new(classes, colors)
    }

    pub fn target_classes(&self) -> &[String] {
        &self.target_classes
    }

    pub fn is_target(&self, label: &str) -> bool {
        self.target_classes.iter().any(|c| c == label)
    }

    pub fn color_for(&self, label: &str) -> Option<&Color> {
        if self.is_target(label) {
            self.colors.get(label)
        } else {
            None
        }
    }
}

impl Default for VehicleConfig {
    fn default() -> Self {
        let mut target_classes = Vec::new();
        let mut colors = HashMap::new();
        for (class, token, rgb) in [
            ("car", "red", [255, 0, 0]),
            ("truck", "blue", [0, 0, 255]),
            ("motorcycle", "green", [0, 128, 0]),
        ] {
            target_classes.push(class.to_string());
            colors.insert(
                class.to_string(),
                Color {
                    token: token.to_string(),
                    rgb,
                },
            );
        }
        Self {
            target_classes,
            colors,
        }
    }
}

/// Presentation settings for the web widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub title: String,
    pub description: String,
    pub examples: Vec<String>,
    pub theme: String,
    pub allow_flagging: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Vehicle Detection and Counting".to_string(),
            description: "Detect and count vehicles (cars, trucks, motorcycles) using DETR".to_string(),
            examples: vec![
                "demos/example1.ppm".to_string(),
                "demos/example2.ppm".to_string(),
            ],
            theme: "default".to_string(),
            allow_flagging: false,
        }
    }
}
