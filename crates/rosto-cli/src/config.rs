use anyhow::{Context, Result};
use rosto_core::detector::DEFAULT_MIN_REGION_SIZE;
use rosto_core::KeyPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: defaults, then the TOML file, then `ROSTO_*` variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base directory for the registry and images (default: $XDG_DATA_HOME/rosto).
    pub data_dir: PathBuf,
    /// Registry file (default: <data_dir>/registry.json).
    pub registry_path: Option<PathBuf>,
    /// Directory for cropped and original images (default: <data_dir>/images).
    pub images_dir: Option<PathBuf>,
    pub key_policy: KeyPolicy,
    /// Store the full source image next to each new crop.
    pub keep_originals: bool,
    /// V4L2 device path for `rosto capture`.
    pub camera_device: String,
    /// External detector command line, used when no region manifest is given.
    pub detector_command: Option<String>,
    /// Regions smaller than this in either dimension are dropped.
    pub min_region_size: u32,
    pub export_delimiter: char,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: xdg_dir("XDG_DATA_HOME", ".local/share").join("rosto"),
            registry_path: None,
            images_dir: None,
            key_policy: KeyPolicy::default(),
            keep_originals: true,
            camera_device: "/dev/video0".to_string(),
            detector_command: None,
            min_region_size: DEFAULT_MIN_REGION_SIZE,
            export_delimiter: rosto_store::DEFAULT_DELIMITER,
        }
    }
}

impl Config {
    /// Resolve the configuration.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = default_config_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `ROSTO_*` variables. Unparseable values are
    /// logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROSTO_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROSTO_REGISTRY_PATH") {
            self.registry_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ROSTO_IMAGES_DIR") {
            self.images_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ROSTO_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROSTO_DETECTOR_COMMAND") {
            self.detector_command = Some(v).filter(|v| !v.trim().is_empty());
        }
        parse_env(&lookup, "ROSTO_KEY_POLICY", &mut self.key_policy);
        parse_env(&lookup, "ROSTO_MIN_REGION_SIZE", &mut self.min_region_size);
        parse_env(&lookup, "ROSTO_EXPORT_DELIMITER", &mut self.export_delimiter);
        if let Some(v) = lookup("ROSTO_KEEP_ORIGINALS") {
            self.keep_originals = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("registry.json"))
    }

    pub fn images_dir(&self) -> PathBuf {
        self.images_dir.clone().unwrap_or_else(|| self.data_dir.join("images"))
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting"),
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

/// `$XDG_CONFIG_HOME/rosto/config.toml`.
pub fn default_config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join("rosto").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.key_policy, KeyPolicy::Positional);
        assert!(config.keep_originals);
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.min_region_size, 30);
        assert_eq!(config.export_delimiter, ',');
        assert!(config.detector_command.is_none());
        assert!(config.data_dir.ends_with("rosto"));
    }

    #[test]
    fn test_toml_overrides_and_derived_paths() {
        let config = Config::from_toml(
            r#"
            data_dir = "/srv/rosto"
            key_policy = "ordinal"
            keep_originals = false
            export_delimiter = ";"
            detector_command = "python3 detect.py"
            "#,
        )
        .unwrap();

        assert_eq!(config.key_policy, KeyPolicy::Ordinal);
        assert!(!config.keep_originals);
        assert_eq!(config.export_delimiter, ';');
        assert_eq!(config.registry_path(), PathBuf::from("/srv/rosto/registry.json"));
        assert_eq!(config.images_dir(), PathBuf::from("/srv/rosto/images"));
    }

    #[test]
    fn test_explicit_paths_win_over_data_dir() {
        let config = Config::from_toml(
            r#"
            data_dir = "/srv/rosto"
            registry_path = "/var/lib/faces.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.registry_path(), PathBuf::from("/var/lib/faces.json"));
        assert_eq!(config.images_dir(), PathBuf::from("/srv/rosto/images"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::from_toml("similarity = 0.4").is_err());
        assert!(Config::from_toml(r#"key_policy = "random""#).is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml(r#"key_policy = "ordinal""#).unwrap();
        config.apply_env(env(&[
            ("ROSTO_KEY_POLICY", "positional"),
            ("ROSTO_DATA_DIR", "/data"),
            ("ROSTO_KEEP_ORIGINALS", "0"),
            ("ROSTO_MIN_REGION_SIZE", "48"),
            ("ROSTO_EXPORT_DELIMITER", "\t"),
        ]));
        assert_eq!(config.key_policy, KeyPolicy::Positional);
        assert_eq!(config.registry_path(), PathBuf::from("/data/registry.json"));
        assert!(!config.keep_originals);
        assert_eq!(config.min_region_size, 48);
        assert_eq!(config.export_delimiter, '\t');
    }

    #[test]
    fn test_bad_env_value_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("ROSTO_MIN_REGION_SIZE", "big"), ("ROSTO_KEY_POLICY", "random")]));
        assert_eq!(config.min_region_size, 30);
        assert_eq!(config.key_policy, KeyPolicy::Positional);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "camera_device = \"/dev/video2\"\n").unwrap();
        assert_eq!(Config::from_file(&path).unwrap().camera_device, "/dev/video2");
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
