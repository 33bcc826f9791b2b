//! Loading model configurations from disk

use std::fs;
use tempfile::TempDir;
use tpzero_model::{ConfigError, LlamaConfig};

#[test]
fn test_config_default() {
    let config = LlamaConfig::default();

    assert_eq!(config.vocab_size, 32000);
    assert_eq!(config.hidden_size, 4096);
    assert_eq!(config.num_hidden_layers, 32);
    assert!(!config.sequence_parallel_enabled);
    assert!(config.name_or_path.is_empty());
}

#[test]
fn test_from_pretrained_reads_config_json() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("config.json"),
        r#"{"vocab_size": 64, "hidden_size": 8, "num_hidden_layers": 2, "model_type": "llama"}"#,
    )?;

    let config = LlamaConfig::from_pretrained(dir.path())?;
    assert_eq!(config.vocab_size, 64);
    assert_eq!(config.hidden_size, 8);
    assert_eq!(config.num_hidden_layers, 2);
    // Unspecified fields fall back to defaults.
    assert_eq!(config.max_position_embeddings, 4096);
    assert_eq!(config.name_or_path, dir.path().display().to_string());
    Ok(())
}

#[test]
fn test_from_pretrained_keeps_recorded_name() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let file = dir.path().join("tiny.json");
    fs::write(&file, r#"{"_name_or_path": "tiny-llama", "hidden_size": 4}"#)?;

    let config = LlamaConfig::from_pretrained(&file)?;
    assert_eq!(config.name_or_path, "tiny-llama");
    Ok(())
}

#[test]
fn test_missing_config_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = LlamaConfig::from_pretrained(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_malformed_config_is_parse_error() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config.json"), "{ not json").unwrap();
    let err = LlamaConfig::from_pretrained(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_invalid_dimensions_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config.json"), r#"{"vocab_size": 0}"#).unwrap();
    let err = LlamaConfig::from_pretrained(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_display_is_json() {
    let text = LlamaConfig::default().to_string();
    assert!(text.starts_with("LlamaConfig {"));
    assert!(text.contains("\"_name_or_path\""));
}
