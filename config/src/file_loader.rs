//! # Configuration File Loading
//!
//! Reads a [`Config`] from a TOML or YAML file. The format follows the file
//! extension; sections and fields missing from the file keep their defaults.

use crate::config::Config;
use errors::{PermsError, PermsResult};
use std::path::Path;

/// On-disk configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml
}

impl ConfigFormat {
    /// Picks the format from the extension, case-insensitively. `.yml` and
    /// `.yaml` are both YAML.
    pub fn from_path(path: &Path) -> PermsResult<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| config_error(path, "no file extension"))?;

        match extension.to_ascii_lowercase().as_str() {
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(config_error(path, format!("unsupported format .{other}")))
        }
    }
}

fn config_error(path: &Path, reason: impl std::fmt::Display) -> PermsError {
    PermsError::Configuration {
        message: format!("{}: {reason}", path.display())
    }
}

/// Parses configuration text in the given format.
///
/// Unknown enum values, such as an unsupported bind mode, are parse errors.
pub fn parse_config(contents: &str, format: ConfigFormat) -> PermsResult<Config> {
    let parsed = match format {
        ConfigFormat::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|e| e.to_string())
    };
    parsed.map_err(|reason| PermsError::Configuration {
        message: format!("invalid {format:?} configuration: {reason}")
    })
}

/// Load configuration from a file, detecting the format from its extension.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Reads the file layer that [`crate::merge_configs`] places between the
/// environment and the defaults. Hot reload reads the same file.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_file;
/// use std::path::Path;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_file(Path::new("authz.yaml"))?;
///     println!("Bind mode: {}", config.permissions_user_mapping.bind_id);
///     Ok(())
/// }
/// ```
///
/// ## Error Handling
/// Every failure is a `PermsError::Configuration` naming the path: a missing
/// or unreadable file, an unknown extension, or contents that do not parse.
pub fn load_from_file(path: &Path) -> PermsResult<Config> {
    let format = ConfigFormat::from_path(path)?;
    let contents = std::fs::read_to_string(path).map_err(|e| config_error(path, e))?;
    parse_config(&contents, format).map_err(|e| match e {
        PermsError::Configuration { message } => config_error(path, message),
        other => other
    })
}
