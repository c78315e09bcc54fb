use super::data::{path_display, AssistantConfig, Config, DEFAULT_MODEL};
use super::io::ConfigError;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_nonexistent_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nonexistent_config.toml");

    let config = Config::load_from_path(&config_path).expect("Failed to load config");

    assert_eq!(config, Config::default());
    assert_eq!(config.provider.model, DEFAULT_MODEL);
    assert_eq!(config.provider.api_key_env, "OPENAI_API_KEY");
}

#[test]
fn test_config_persistence_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let mut config = Config {
        default_assistant: Some("writer".to_string()),
        data_dir: Some(PathBuf::from("/tmp/chatpipe-data")),
        ..Default::default()
    };
    config.stream.checkpoint_every = 8;
    config.assistants.push(AssistantConfig {
        id: "writer".to_string(),
        prompt: "You edit prose.".to_string(),
        temperature: Some(0.2),
        ..Default::default()
    });
    config
        .save_to_path(&config_path)
        .expect("Failed to save config");

    let loaded = Config::load_from_path(&config_path).expect("Failed to load config");
    assert_eq!(loaded, config);

    // Overwrite in place
    let mut changed = loaded;
    changed.default_assistant = None;
    changed
        .save_to_path(&config_path)
        .expect("Failed to save config");
    let reloaded = Config::load_from_path(&config_path).expect("Failed to load config");
    assert_eq!(reloaded.default_assistant, None);
    assert_eq!(reloaded.assistants.len(), 1);
}

#[test]
fn test_partial_sections_fill_defaults() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
[provider]
model = "llama3"

[stream]
pause_grace_ms = 250

[[assistants]]
id = "coder"
name = "Coder"
context_count = 10
"#,
    )
    .expect("write config");

    let config = Config::load_from_path(&config_path).expect("Failed to load config");

    assert_eq!(config.provider.model, "llama3");
    assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
    let stream = config.stream.settings();
    assert_eq!(stream.pause_grace, Duration::from_millis(250));
    assert_eq!(stream.checkpoint_every, 0);

    let assistants = config.assistants();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].name, "Coder");
    assert_eq!(assistants[0].settings.context_count, 10);
    assert_eq!(assistants[0].settings.temperature, 0.7);
    assert_eq!(assistants[0].settings.max_tokens, 4096);
    assert!(!assistants[0].settings.enable_max_tokens);
}

#[test]
fn test_invalid_toml_reports_parse_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "[provider\nmodel = ").expect("write config");

    let err = Config::load_from_path(&config_path).expect_err("parse should fail");

    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().starts_with("Failed to parse config at"));
}

#[test]
fn test_unreadable_config_reports_read_error_with_source() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    // A directory cannot be read as a file.
    let config_path = temp_dir.path().join("config.toml");
    std::fs::create_dir(&config_path).expect("create dir");

    let err = Config::load_from_path(&config_path).expect_err("read should fail");

    assert!(matches!(err, ConfigError::Read { .. }));
    assert!(err
        .to_string()
        .starts_with(&format!("Failed to read config at {}", path_display(&config_path))));
    assert!(std::error::Error::source(&err).is_some());
}

#[test]
fn test_init_writes_defaults_once_unless_forced() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("chatpipe").join("config.toml");

    assert!(Config::init_at(&config_path, false).expect("init"));
    assert_eq!(
        Config::load_from_path(&config_path).expect("load"),
        Config::default()
    );

    std::fs::write(&config_path, "data_dir = \"/srv/chat\"\n").expect("write config");
    assert!(!Config::init_at(&config_path, false).expect("init"));
    assert_eq!(
        Config::load_from_path(&config_path).expect("load").data_dir,
        Some(PathBuf::from("/srv/chat"))
    );

    assert!(Config::init_at(&config_path, true).expect("forced init"));
    assert_eq!(
        Config::load_from_path(&config_path).expect("load"),
        Config::default()
    );
}

#[test]
fn test_resolve_assistant_prefers_flag_then_default() {
    let config = Config {
        default_assistant: Some("second".to_string()),
        assistants: vec![
            AssistantConfig {
                id: "first".to_string(),
                ..Default::default()
            },
            AssistantConfig {
                id: "second".to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    let picked = |flag| config.resolve_assistant(flag).map(|a| a.id);
    assert_eq!(picked(Some("FIRST")), Some("first".to_string()));
    assert_eq!(picked(None), Some("second".to_string()));
    assert_eq!(picked(Some("missing")), None);

    let empty = Config::default();
    assert_eq!(
        empty.resolve_assistant(None).map(|a| a.id),
        Some("default".to_string())
    );
}

#[test]
fn test_data_dir_override() {
    let config = Config {
        data_dir: Some(PathBuf::from("/srv/chatpipe")),
        ..Default::default()
    };
    assert_eq!(
        config.resolve_data_dir().expect("data dir"),
        PathBuf::from("/srv/chatpipe")
    );
}

#[cfg(unix)]
#[test]
fn test_path_display_uses_tilde_under_home() {
    if let Some(home) = std::env::var_os("HOME") {
        let path = PathBuf::from(home).join(".config").join("chatpipe");
        assert_eq!(path_display(&path), "~/.config/chatpipe");
    }
}
