use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Values read from the line-oriented config file. `None` means the key was
/// absent so the CLI or built-in default applies.
#[derive(Debug, Default)]
pub struct Config {
    pub module_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub mount_source: Option<String>,
    pub log_file: Option<String>,
    pub partitions: Vec<String>,
    pub debug: bool,
    pub umount: Option<bool>,
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "on"
    )
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("read config {}", path.as_ref().display()))?;
        Ok(Self::parse(&content))
    }

    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                log::warn!("config line {}: no '=', ignoring", lineno + 1);
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "module_dir" => config.module_dir = Some(PathBuf::from(value)),
                "temp_dir" => config.temp_dir = Some(PathBuf::from(value)),
                "mount_source" => config.mount_source = Some(value.to_string()),
                "log_file" => config.log_file = Some(value.to_string()),
                "partitions" => config.partitions = split_list(value),
                "debug" => config.debug = is_truthy(value),
                "umount" => config.umount = Some(is_truthy(value)),
                _ => log::warn!("config line {}: unknown key '{key}', ignoring", lineno + 1),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let config = Config::parse(
            "# comment\n\
             module_dir = /data/adb/modules_update\n\
             mount_source = MM\n\
             log_file = -\n\
             partitions = my_stock, mi_ext\n\
             debug = Yes\n\
             umount = off\n",
        );
        assert_eq!(
            config.module_dir.as_deref(),
            Some(Path::new("/data/adb/modules_update"))
        );
        assert_eq!(config.mount_source.as_deref(), Some("MM"));
        assert_eq!(config.log_file.as_deref(), Some("-"));
        assert_eq!(config.partitions, vec!["my_stock", "mi_ext"]);
        assert!(config.debug);
        assert_eq!(config.umount, Some(false));
    }

    #[test]
    fn unknown_and_malformed_lines_are_ignored() {
        let config = Config::parse("bogus_key = 1\nno equals sign\n");
        assert!(config.module_dir.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn truthy_values() {
        for v in ["true", "TRUE", "yes", "1", "on", "On"] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["false", "no", "0", "off", "2", ""] {
            assert!(!is_truthy(v), "{v} should be falsy");
        }
    }

    #[test]
    fn partition_list_splits_on_commas_and_whitespace() {
        assert_eq!(
            split_list("my_stock, mi_ext\todm_dlkm  extra"),
            vec!["my_stock", "mi_ext", "odm_dlkm", "extra"]
        );
        assert!(split_list(" ,, ").is_empty());
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(Config::load("/nonexistent/mm.conf").is_err());
    }
}
