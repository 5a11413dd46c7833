use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Maps detector label indices to names.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelMap {
    labels: BTreeMap<u32, String>,
}

impl Default for LabelMap {
    fn default() -> Self {
        Self {
            labels: COCO_LABELS
                .iter()
                .enumerate()
                .map(|(i, label)| (i as u32, label.to_string()))
                .collect(),
        }
    }
}

impl LabelMap {
    pub fn coco() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read label map {}", path.display()))?;
        Ok(Self::parse(&contents))
    }

    /// Lines are either `"<id> <label>"` or a bare label numbered by position.
    pub fn parse(contents: &str) -> Self {
        let mut labels = BTreeMap::new();
        let mut position = 0u32;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let numbered = line
                .split_once(char::is_whitespace)
                .and_then(|(id, label)| id.parse::<u32>().ok().map(|id| (id, label.trim())));
            match numbered {
                Some((id, label)) => {
                    labels.insert(id, label.to_string());
                }
                None => {
                    labels.insert(position, line.to_string());
                }
            }
            position += 1;
        }
        Self { labels }
    }

    /// Label for an index; unknown indices get a numeric placeholder.
    pub fn label(&self, index: u32) -> String {
        self.labels
            .get(&index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_coco() {
        let labels = LabelMap::coco();
        assert_eq!(labels.len(), 80);
        assert_eq!(labels.label(0), "person");
        assert_eq!(labels.label(2), "car");
        assert_eq!(labels.label(500), "500");
    }

    #[test]
    fn parses_both_line_formats() {
        let numbered = LabelMap::parse("0 person\n1 license plate\n\n15 cat\n");
        assert_eq!(numbered.label(1), "license plate");
        assert_eq!(numbered.label(15), "cat");

        let bare = LabelMap::parse("person\nbicycle\ncar\n");
        assert_eq!(bare.label(2), "car");
    }
}
