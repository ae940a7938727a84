//! Configuration loading for the `signlab` binary.

use signlab_core::SignLabConfig;
use std::path::Path;

/// Load and validate a YAML configuration file.
///
/// Missing sections and fields fall back to their defaults.
pub fn load_config(path: &Path) -> anyhow::Result<SignLabConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: SignLabConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {}", e))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    /// Helper to write YAML to a temp file and return the path.
    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_config_full() {
        let yaml = r#"
dataset_root: "/srv/signlab/dataset"
model_dir: "/srv/signlab/models"
capture_dir: "/srv/signlab/captures"
processed_dir: "/srv/signlab/processed"
sequence:
  target_length: 40
training:
  test_size: 0.25
  validation_size: 0.15
  batch_size: 16
  epochs: 80
  patience: 8
  learning_rate: 0.0005
  seed: 7
inference:
  confidence_threshold: 0.9
logging:
  level: "debug"
  format: "json"
"#;
        let f = write_yaml(yaml);
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.dataset_root, PathBuf::from("/srv/signlab/dataset"));
        assert_eq!(config.processed_dir, Some(PathBuf::from("/srv/signlab/processed")));
        assert_eq!(config.sequence.target_length, 40);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.patience, 8);
        assert_eq!(config.training.seed, 7);
        assert!((config.inference.confidence_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_config_empty_mapping_uses_defaults() {
        let f = write_yaml("{}\n");
        let config = load_config(f.path()).unwrap();
        assert_eq!(config, SignLabConfig::default());
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let f = write_yaml("inference:\n  confidence_threshold: 2.0\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/signlab.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let f = write_yaml("training: [unclosed");
        assert!(load_config(f.path()).is_err());
    }
}
