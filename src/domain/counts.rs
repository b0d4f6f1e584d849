use serde::ser::SerializeMap;
use serde::Serialize;

use super::config::VehicleConfig;

/// Per-class vehicle tally for one image.
///
/// Always holds exactly one entry per target class, in config order, even when
/// nothing was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleCounts {
    entries: Vec<(String, usize)>,
}

impl VehicleCounts {
    pub fn zeroed(config: &VehicleConfig) -> Self {
        Self {
            entries: config
                .target_classes()
                .iter()
                .map(|class| (class.clone(), 0))
                .collect(),
        }
    }

    /// Bumps `label` by one. Returns `false` and leaves the tally untouched for
    /// labels that are not target classes.
    pub fn increment(&mut self, label: &str) -> bool {
        match self.entries.iter_mut().find(|(class, _)| class == label) {
            Some((_, count)) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, label: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(class, _)| class == label)
            .map(|(_, count)| *count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(class, count)| (class.as_str(), *count))
    }

    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, count)| count).sum()
    }

    /// Lines shown both in the image overlay and in the text summary.
    pub fn summary_lines(&self) -> Vec<String> {
        std::iter::once("Vehicle Counts:".to_string())
            .chain(
                self.iter()
                    .map(|(class, count)| format!("{}: {}", capitalize(class), count)),
            )
            .collect()
    }

    pub fn summary_text(&self) -> String {
        self.summary_lines()
            .into_iter()
            .map(|line| line + "\n")
            .collect()
    }
}

impl Serialize for VehicleCounts {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (class, count) in &self.entries {
            map.serialize_entry(class, count)?;
        }
        map.end()
    }
}

/// Upper-cases the first character and lower-cases the rest (`"SUV"` -> `"Suv"`).
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
