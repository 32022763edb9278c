//! Configuration of all pipeline stages.
//!
//! A [`PipelineConfig`] is loaded from a JSON document. Every field is optional: the document is
//! merged onto the built-in presets, so that a partial `palm` section keeps the palm and hand
//! network parameters it does not mention.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detection::DetectorConfig;
use crate::filter::FilterParams;
use crate::landmark::LandmarkConfig;
use crate::pose::CameraIntrinsics;
use crate::roi::RoiConfig;
use crate::transport::TransportConfig;
use crate::Result;

/// Settings of a detector followed by a landmark network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub detector: DetectorConfig,
    /// Crop of the detection that is passed to the landmark network.
    pub roi: RoiConfig,
    pub landmarks: LandmarkConfig,
    /// Stabilizes the primary detection box across frames.
    pub box_filter: Option<FilterParams>,
}

impl StageConfig {
    pub fn face() -> Self {
        Self {
            detector: DetectorConfig::face(),
            roi: RoiConfig::face_landmark(),
            landmarks: LandmarkConfig::face_mesh(),
            box_filter: Some(FilterParams::EDGES),
        }
    }

    pub fn palm() -> Self {
        Self {
            detector: DetectorConfig::palm(),
            roi: RoiConfig::palm(),
            landmarks: LandmarkConfig::hand(),
            box_filter: Some(FilterParams::EDGES),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        self.roi.validate()?;
        self.landmarks.validate()?;
        Ok(())
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::face()
    }
}

/// Settings of the iris network run on both eyes of a face mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrisConfig {
    pub roi: RoiConfig,
    /// Network settings for the left eye. The right eye uses the opposite `flip_horizontal`.
    pub landmarks: LandmarkConfig,
}

impl Default for IrisConfig {
    fn default() -> Self {
        Self {
            roi: RoiConfig::eye(),
            landmarks: LandmarkConfig::iris(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub face: StageConfig,
    pub palm: StageConfig,
    pub iris: IrisConfig,
    /// Intrinsics used for head pose estimation. Approximated from the frame size if absent.
    pub camera: Option<CameraIntrinsics>,
    pub transport: TransportConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            face: StageConfig::face(),
            palm: StageConfig::palm(),
            iris: IrisConfig::default(),
            camera: None,
            transport: TransportConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON document, fills in missing fields from the presets, and validates the result.
    pub fn from_json(json: &str) -> Result<Self> {
        let overrides: Value = serde_json::from_str(json)?;
        let mut merged = serde_json::to_value(Self::default())?;
        merge(&mut merged, overrides);
        let config: Self = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::from_json(&fs::read_to_string(path)?)?;
        log::debug!("loaded configuration from '{}'", path.display());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.face.validate()?;
        self.palm.validate()?;
        self.iris.roi.validate()?;
        self.iris.landmarks.validate()?;
        if let Some(camera) = &self.camera {
            camera.validate()?;
        }
        self.transport.validate()?;
        Ok(())
    }
}

/// Recursively overwrites `base` with the fields present in `overrides`.
///
/// Objects are merged key by key; every other value (including arrays and `null`) replaces the
/// base value wholesale.
fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_document_gives_defaults() {
        let config = PipelineConfig::from_json("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn partial_document() {
        let config = PipelineConfig::from_json(
            r#"{ "face": { "detector": { "min_score_threshold": 0.6 } }, "transport": { "default_rate": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.face.detector.min_score_threshold, 0.6);
        assert_eq!(config.face.detector.num_boxes, 896);
        assert_eq!(config.face.landmarks, LandmarkConfig::face_mesh());
        assert_eq!(config.transport.default_rate, 10);
        assert_eq!(config.palm, StageConfig::palm());
    }

    #[test]
    fn camera_intrinsics() {
        let config = PipelineConfig::from_json(
            r#"{ "camera": { "focal_length": [600, 600], "principal_point": [320, 240] } }"#,
        )
        .unwrap();
        let camera = config.camera.unwrap();
        assert_eq!(camera.focal_length, [600.0, 600.0]);
        assert_eq!(camera.principal_point, [320.0, 240.0]);

        let err = PipelineConfig::from_json(
            r#"{ "camera": { "focal_length": [-1, 600], "principal_point": [320, 240] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn partial_stages_keep_their_presets() {
        let config = PipelineConfig::from_json(
            r#"{
                "palm": {
                    "detector": { "min_score_threshold": 0.7 },
                    "landmarks": { "presence_threshold": 0.6 }
                },
                "iris": { "landmarks": { "filter": null } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.palm.detector.min_score_threshold, 0.7);
        assert_eq!(config.palm.detector.num_coords, 18);
        assert_eq!(config.palm.detector.num_keypoints, 7);
        assert_eq!(config.palm.landmarks.presence_threshold, 0.6);
        assert_eq!(config.palm.landmarks.num_landmarks, 21);
        assert_eq!(config.palm.landmarks.encoder.width, 224);
        assert_eq!(config.palm.roi, RoiConfig::palm());

        assert_eq!(config.iris.landmarks.filter, None);
        assert_eq!(config.iris.landmarks.num_landmarks, 76);
        assert_eq!(config.iris.landmarks.encoder.width, 64);
    }

    #[test]
    fn overrides_replace_arrays_and_add_keys() {
        let config = PipelineConfig::from_json(
            r#"{ "transport": { "rates": { "gaze": 5 } }, "face": { "landmarks": { "surface_outputs": [2] } } }"#,
        )
        .unwrap();
        assert_eq!(config.transport.rates.get("gaze"), Some(&5));
        assert_eq!(config.transport.default_rate, 30);
        assert_eq!(config.face.landmarks.surface_outputs, [2]);
        assert_eq!(config.face.landmarks.num_landmarks, 468);
    }

    #[test]
    fn serialized_config_reloads() {
        let mut config = PipelineConfig::default();
        config.palm.box_filter = None;
        config.iris.landmarks.flip_horizontal = true;
        let json = config.to_json().unwrap();
        assert_eq!(PipelineConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn rejects_invalid() {
        let err = PipelineConfig::from_json(r#"{ "face": { "detector": { "num_boxes": 100 } } }"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");

        let err = PipelineConfig::from_json(r#"{ "palm": { "detector": { "num_coords": 4 } } }"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");

        let err = PipelineConfig::from_json(r#"{ "iris": { "roi": { "margin_x": -1.0 } } }"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");

        let err = PipelineConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)), "{err}");
    }

    #[test]
    fn missing_file() {
        let err = PipelineConfig::load("/nonexistent/sightline.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
    }
}
