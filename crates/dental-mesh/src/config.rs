//! Configuration file support.
//!
//! [`DentalConfig`] gathers the tunables of every stage. Every field has a
//! default, so a file only needs the values it changes:
//!
//! ```toml
//! [selection]
//! scope = "connected"
//!
//! [intersection]
//! sample_count = 1000
//!
//! [segmentation]
//! archType = "upper"
//! expectedToothCount = 14
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::autoseg::SegmentationConfig;
use crate::error::{DentalError, DentalResult};
use crate::intersect::IntersectionParams;
use crate::movement::MovementParams;
use crate::planning::PlanningParams;
use crate::selection::SelectionParams;

/// All stage parameters in one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DentalConfig {
    /// Optional label, shown in logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub selection: SelectionParams,
    pub intersection: IntersectionParams,
    pub movement: MovementParams,
    pub planning: PlanningParams,
    pub segmentation: SegmentationConfig,
}

impl DentalConfig {
    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> DentalResult<Self> {
        toml::from_str(toml_str).map_err(|e| DentalError::config(e.to_string()))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json_str: &str) -> DentalResult<Self> {
        serde_json::from_str(json_str).map_err(|e| DentalError::config(e.to_string()))
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> DentalResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| DentalError::io_read(path, e))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json(&contents)?,
            _ => Self::from_toml(&contents)?,
        };
        config.validate()?;
        info!(
            path = %path.display(),
            name = config.name.as_deref().unwrap_or("unnamed"),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn to_toml(&self) -> DentalResult<String> {
        toml::to_string_pretty(self).map_err(|e| DentalError::config(e.to_string()))
    }

    pub fn to_json(&self) -> DentalResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| DentalError::config(e.to_string()))
    }

    /// Write as TOML, or JSON for a `.json` path.
    pub fn save(&self, path: &Path) -> DentalResult<()> {
        let text = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => self.to_json()?,
            _ => self.to_toml()?,
        };
        std::fs::write(path, text).map_err(|e| DentalError::io_write(path, e))?;
        debug!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Reject values no stage can work with.
    pub fn validate(&self) -> DentalResult<()> {
        let s = &self.selection;
        if !(s.brush.radius.is_finite() && s.brush.radius > 0.0) {
            return Err(DentalError::config(format!(
                "selection.brush.radius must be positive, got {}",
                s.brush.radius
            )));
        }
        if !(0.0..=1.0).contains(&s.brush.hardness) {
            return Err(DentalError::config(format!(
                "selection.brush.hardness must be within 0..=1, got {}",
                s.brush.hardness
            )));
        }

        let i = &self.intersection;
        if i.sample_count == 0 {
            return Err(DentalError::config("intersection.sample_count must be at least 1"));
        }
        if i.severity_low > i.severity_medium {
            return Err(DentalError::config(format!(
                "intersection.severity_low ({}) exceeds severity_medium ({})",
                i.severity_low, i.severity_medium
            )));
        }

        let up = nalgebra::Vector3::from(self.movement.up);
        if up.norm() < 1e-9 {
            return Err(DentalError::config("movement.up must be a non-zero vector"));
        }

        let m = &self.planning.max_movement_per_step;
        if [m.anteroposterior, m.vertical, m.transverse]
            .iter()
            .any(|v| !(v.is_finite() && *v > 0.0))
        {
            return Err(DentalError::config(
                "planning.max_movement_per_step values must be positive",
            ));
        }

        self.segmentation
            .validate()
            .map_err(|e| DentalError::config(format!("segmentation: {}", e)))
    }

    /// Conservative planning with strict, dense intersection checks.
    pub fn preset_clinical() -> Self {
        Self {
            name: Some("clinical".to_string()),
            intersection: IntersectionParams {
                bbox_fallback: false,
                ..IntersectionParams::thorough()
            },
            planning: PlanningParams::conservative(),
            ..Default::default()
        }
    }

    /// Curvature-guided selection for tooth-by-tooth cleanup.
    pub fn preset_dental_aware() -> Self {
        Self {
            name: Some("dental-aware".to_string()),
            selection: SelectionParams::dental_aware(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoseg::ArchType;
    use crate::selection::SelectionScope;
    use tempfile::TempDir;

    #[test]
    fn test_empty_toml_is_default() {
        let config = DentalConfig::from_toml("").expect("empty document");
        assert_eq!(config.intersection, IntersectionParams::default());
        assert_eq!(config.segmentation, SegmentationConfig::default());
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_partial_toml() {
        let config = DentalConfig::from_toml(
            r#"
            name = "upper arch"

            [selection]
            scope = "connected"

            [intersection]
            sample_count = 1000

            [segmentation]
            archType = "upper"
            expectedToothCount = 14
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.selection.scope, SelectionScope::Connected);
        assert_eq!(config.intersection.sample_count, 1000);
        assert!(config.intersection.bbox_fallback);
        assert_eq!(config.segmentation.arch_type, ArchType::Upper);
        assert_eq!(config.segmentation.expected_tooth_count, 14);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DentalConfig::default();
        config.intersection.severity_low = 10.0;
        assert!(config.validate().is_err());

        let mut config = DentalConfig::default();
        config.movement.up = [0.0; 3];
        assert!(config.validate().is_err());

        let mut config = DentalConfig::default();
        config.segmentation.voxel_size = 0.0;
        assert!(matches!(config.validate(), Err(DentalError::Config { .. })));
    }

    #[test]
    fn test_bad_syntax_is_config_error() {
        let err = DentalConfig::from_toml("[selection").expect_err("broken toml");
        assert!(matches!(err, DentalError::Config { .. }));
        assert!(DentalConfig::from_json("{").is_err());
    }

    #[test]
    fn test_save_and_load_both_formats() {
        let dir = TempDir::new().expect("temp dir");
        let preset = DentalConfig::preset_clinical();

        for file in ["config.toml", "config.json"] {
            let path = dir.path().join(file);
            preset.save(&path).expect("save");
            let loaded = DentalConfig::load(&path).expect("load");
            assert_eq!(loaded.name.as_deref(), Some("clinical"));
            assert!(!loaded.intersection.bbox_fallback);
            assert_eq!(loaded.intersection.sample_count, 2000);
        }
    }
}
