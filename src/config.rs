use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the guidance channel marks the believed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SeedingPolicy {
    /// Fill the tight bounding rectangle of the foreground
    #[default]
    BoundingBox,
    /// Fill exactly the foreground pixels
    ExactMask,
}

/// Pixel convention expected by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    /// RGB order, values scaled to [0, 1]
    #[default]
    UnitScale,
    /// BGR order, raw 0-255 values minus the per-channel dataset mean
    MeanSubtracted,
}

impl Normalization {
    /// Per-channel means in BGR order
    pub const BGR_MEAN: [f32; 3] = [104.00699, 116.66877, 122.67892];

    /// Guidance magnitude that lives on the same scale as the image channels
    pub fn default_guidance_magnitude(self) -> f32 {
        match self {
            Normalization::UnitScale => 100.0 / 255.0,
            Normalization::MeanSubtracted => 100.0,
        }
    }
}

/// What to do with frames whose IoU union is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum UndefinedIouPolicy {
    /// Leave the frame out of the sequence mean
    #[default]
    Exclude,
    /// Count the frame as a perfect match
    CountAsOne,
}

impl UndefinedIouPolicy {
    pub fn resolve(self, iou: Option<f64>) -> Option<f64> {
        match (iou, self) {
            (Some(value), _) => Some(value),
            (None, UndefinedIouPolicy::Exclude) => None,
            (None, UndefinedIouPolicy::CountAsOne) => Some(1.0),
        }
    }
}

/// Settings that stay fixed for a whole evaluation run
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvalConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub seeding: SeedingPolicy,
    pub normalization: Normalization,
    /// Overrides the magnitude derived from `normalization`
    pub guidance_magnitude: Option<f32>,
    pub undefined_iou: UndefinedIouPolicy,
    pub background_class: u8,
    pub foreground_class: usize,
    /// Abort the run on the first unreadable frame instead of skipping the sequence
    pub strict: bool,
    pub max_inference_ms: Option<u64>,
    /// Index of the model output holding the class scores
    pub model_output: usize,
    /// ONNX Runtime intra-op threads per model
    pub intra_threads: usize,
    pub workers: usize,
    pub report_path: PathBuf,
    pub dump_dir: Option<PathBuf>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            input_width: 321,
            input_height: 321,
            seeding: SeedingPolicy::default(),
            normalization: Normalization::default(),
            guidance_magnitude: None,
            undefined_iou: UndefinedIouPolicy::default(),
            background_class: 0,
            foreground_class: 1,
            strict: false,
            max_inference_ms: None,
            model_output: 0,
            intra_threads: 4,
            workers: 1,
            report_path: PathBuf::from("result.json"),
            dump_dir: None,
        }
    }
}

impl EvalConfig {
    /// Load a TOML config file; missing keys fall back to defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: EvalConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.input_width > 0 && self.input_height > 0,
            "network input size must be non-zero, got {}x{}",
            self.input_width,
            self.input_height
        );
        anyhow::ensure!(self.workers > 0, "workers must be at least 1");
        anyhow::ensure!(self.intra_threads > 0, "intra_threads must be at least 1");
        anyhow::ensure!(
            self.background_class <= 1,
            "background_class must be 0 or 1 for single-object evaluation"
        );
        anyhow::ensure!(
            self.foreground_class != usize::from(self.background_class),
            "foreground_class and background_class are both {}",
            self.foreground_class
        );
        if let Some(magnitude) = self.guidance_magnitude {
            anyhow::ensure!(
                magnitude.is_finite() && magnitude > 0.0,
                "guidance_magnitude must be positive, got {}",
                magnitude
            );
        }
        Ok(())
    }

    pub fn network_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    pub fn guidance_magnitude(&self) -> f32 {
        self.guidance_magnitude
            .unwrap_or_else(|| self.normalization.default_guidance_magnitude())
    }

    pub fn max_inference_time(&self) -> Option<Duration> {
        self.max_inference_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EvalConfig = toml::from_str(
            r#"
            seeding = "exact-mask"
            normalization = "mean-subtracted"
            undefined_iou = "count-as-one"
            "#,
        )
        .unwrap();

        assert_eq!(config.seeding, SeedingPolicy::ExactMask);
        assert_eq!(config.normalization, Normalization::MeanSubtracted);
        assert_eq!(config.undefined_iou, UndefinedIouPolicy::CountAsOne);
        assert_eq!(config.network_size(), (321, 321));
        assert_eq!(config.guidance_magnitude(), 100.0);
    }

    #[test]
    fn test_guidance_magnitude_follows_normalization() {
        let config = EvalConfig::default();
        assert!((config.guidance_magnitude() - 100.0 / 255.0).abs() < 1e-6);

        let config = EvalConfig {
            guidance_magnitude: Some(5.0),
            ..EvalConfig::default()
        };
        assert_eq!(config.guidance_magnitude(), 5.0);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<EvalConfig>("input_size = 3").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = EvalConfig {
            workers: 0,
            ..EvalConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_foreground_equal_to_background() {
        let config = EvalConfig {
            background_class: 1,
            foreground_class: 1,
            ..EvalConfig::default()
        };
        assert!(config.validate().is_err());

        let swapped = EvalConfig {
            background_class: 1,
            foreground_class: 0,
            ..EvalConfig::default()
        };
        assert!(swapped.validate().is_ok());
    }

    #[test]
    fn test_backend_settings() {
        let config: EvalConfig = toml::from_str("model_output = 3\nintra_threads = 2").unwrap();
        assert_eq!(config.model_output, 3);
        assert_eq!(config.intra_threads, 2);
        assert!(config.validate().is_ok());

        let defaults = EvalConfig::default();
        assert_eq!((defaults.model_output, defaults.intra_threads), (0, 4));

        let no_threads = EvalConfig {
            intra_threads: 0,
            ..EvalConfig::default()
        };
        assert!(no_threads.validate().is_err());
    }

    #[test]
    fn test_undefined_policy_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(UndefinedIouPolicy::Exclude.resolve(None), None);
            assert_eq!(UndefinedIouPolicy::CountAsOne.resolve(None), Some(1.0));
        }
        assert_eq!(UndefinedIouPolicy::CountAsOne.resolve(Some(0.25)), Some(0.25));
    }
}
