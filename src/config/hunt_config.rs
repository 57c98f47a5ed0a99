use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::rules::{Accuracy, Relevance, RuleDescriptor, RuleSet, SearchLocation};
use crate::constants::{
    DEFAULT_MAX_ARCHIVE_DEPTH, DEFAULT_MAX_ARCHIVE_SIZE_BYTES, DEFAULT_MAX_FILE_SIZE_BYTES,
};
use crate::error::HuntError;

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE_BYTES
}

fn default_max_archive_size() -> u64 {
    DEFAULT_MAX_ARCHIVE_SIZE_BYTES
}

fn default_max_archive_depth() -> usize {
    DEFAULT_MAX_ARCHIVE_DEPTH
}

/// The hunt configuration: size gates, archive handling and the match
/// rules. Loaded once at startup and immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntConfig {
    /// Files larger than this are never fetched; 0 disables the gate.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Archive containers larger than this are never fetched; 0 disables
    /// the gate.
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size_bytes: u64,

    /// Nested archives deeper than this are skipped.
    #[serde(default = "default_max_archive_depth")]
    pub max_archive_depth: usize,

    /// Lowercase extensions (without the leading dot) treated as archive
    /// containers.
    pub supported_archives: Vec<String>,

    pub match_rules: Vec<RuleDescriptor>,
}

impl Default for HuntConfig {
    fn default() -> Self {
        HuntConfig {
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            max_archive_size_bytes: DEFAULT_MAX_ARCHIVE_SIZE_BYTES,
            max_archive_depth: DEFAULT_MAX_ARCHIVE_DEPTH,
            supported_archives: ["zip", "jar", "war", "tar", "gz", "tgz"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            match_rules: default_match_rules(),
        }
    }
}

impl HuntConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        let config: HuntConfig = serde_yaml::from_str(&content)
            .map_err(|e| HuntError::MalformedRule(e.to_string()))
            .context("Failed to parse YAML config")?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn save_to_yaml_file(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;
        fs::write(path, yaml).context(format!("Failed to write config to {}", path.display()))?;
        info!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Check invariants that serde cannot express and normalize the
    /// archive extension list.
    pub fn validate(&mut self) -> Result<(), HuntError> {
        if self.max_archive_depth == 0 {
            return Err(HuntError::BadThreshold(
                "max_archive_depth must be at least 1".to_string(),
            ));
        }
        for extension in &mut self.supported_archives {
            *extension = extension.trim_start_matches('.').to_ascii_lowercase();
        }
        self.supported_archives.retain(|e| !e.is_empty());
        Ok(())
    }

    /// Whether the file name carries an extension configured as an archive
    /// container.
    pub fn is_archive_name(&self, file_name: &str) -> bool {
        match file_name.rsplit_once('.') {
            Some((stem, extension)) if !stem.is_empty() => self
                .supported_archives
                .iter()
                .any(|e| e.eq_ignore_ascii_case(extension)),
            _ => false,
        }
    }

    /// Whether a file of this name and size passes the size gate. Drivers
    /// consult this before transferring any bytes; the analyzer re-checks
    /// it before invoking a fetcher.
    pub fn within_gate(&self, file_name: &str, size: u64) -> bool {
        let gate = if self.is_archive_name(file_name) {
            self.max_archive_size_bytes
        } else {
            self.max_file_size_bytes
        };
        gate == 0 || size <= gate
    }

    /// Compile the configured match rules into the priority-sorted set.
    pub fn compile_rules(&self) -> Result<RuleSet, HuntError> {
        RuleSet::compile(&self.match_rules)
    }
}

/// Load a configuration file or fall back to the built-in defaults.
///
/// When a path is given but the file does not exist, the defaults are
/// written there so the operator has a starting point to edit.
pub fn load_or_create_config(config_path: Option<&Path>) -> Result<HuntConfig> {
    let mut config = match config_path {
        Some(path) if path.exists() => HuntConfig::from_yaml_file(path)?,
        Some(path) => {
            info!(
                "Config file {} not found, writing built-in defaults",
                path.display()
            );
            let config = HuntConfig::default();
            config.save_to_yaml_file(path)?;
            config
        }
        None => {
            info!("No config path provided, using built-in default rules");
            HuntConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

fn rule(
    location: SearchLocation,
    pattern: &str,
    category: &str,
    relevance: Relevance,
    accuracy: Accuracy,
) -> RuleDescriptor {
    RuleDescriptor {
        search_location: location,
        search_pattern: pattern.to_string(),
        category: category.to_string(),
        relevance,
        accuracy,
    }
}

/// The built-in rule set. Operators are expected to extend this per
/// engagement; it covers the classic findings.
fn default_match_rules() -> Vec<RuleDescriptor> {
    use Accuracy as A;
    use Relevance as R;
    use SearchLocation::{FileContent, FileName, FullPath};
    vec![
        rule(
            FileContent,
            r"-+BEGIN.*?PRIVATE KEY-+",
            "Private Key",
            R::High,
            A::High,
        ),
        rule(
            FileContent,
            r"aws_secret_access_key\s*[=:]",
            "Cloud Credential",
            R::High,
            A::High,
        ),
        rule(
            FileContent,
            r"(password|passwd|pwd)\s*[=:]\s*\S+",
            "Generic Password Pattern",
            R::Medium,
            A::Medium,
        ),
        rule(
            FileContent,
            r"sqlplus\s+\S+/\S+",
            "Oracle Connect String",
            R::Medium,
            A::Medium,
        ),
        rule(
            FileName,
            r"^id_(rsa|dsa|ecdsa|ed25519)$",
            "SSH Private Key",
            R::High,
            A::High,
        ),
        rule(FileName, r"\.(kdbx?|psafe3)$", "Password Database", R::High, A::High),
        rule(FileName, r"\.(pem|key|pfx|p12)$", "Key Material File", R::Medium, A::Medium),
        rule(FileName, r"^(web|app)\.config$", "Application Config", R::Medium, A::Low),
        rule(FileName, r"unattend\.xml$", "Windows Deployment File", R::Medium, A::Medium),
        rule(FileName, r"^\.?htpasswd$", "HTTP Credential File", R::Medium, A::High),
        rule(FileName, r"^.*\.bak$", "Backup File", R::Low, A::Low),
        rule(FullPath, r"(^|/)\.ssh(/|$)", "SSH Directory", R::Medium, A::Medium),
        rule(FullPath, r"(^|/)etc/(shadow|passwd)$", "Unix Account File", R::High, A::Medium),
        rule(
            FullPath,
            r"(^|/)\.aws/credentials$",
            "Cloud Credential",
            R::High,
            A::High,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn yaml_round_trip_preserves_rules() {
        let config = HuntConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: HuntConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.match_rules.len(), config.match_rules.len());
        assert_eq!(parsed.supported_archives, config.supported_archives);
        assert_eq!(parsed.max_file_size_bytes, config.max_file_size_bytes);
    }

    #[test]
    fn unknown_attribute_value_is_rejected() {
        let yaml = r#"
supported_archives: [zip]
match_rules:
  - search_location: file_magic
    search_pattern: x
    category: y
    relevance: low
    accuracy: low
"#;
        assert!(serde_yaml::from_str::<HuntConfig>(yaml).is_err());
    }

    #[test]
    fn default_rules_compile() {
        let config = HuntConfig::default();
        let rules = config.compile_rules().unwrap();
        assert_eq!(rules.len(), config.match_rules.len());
    }

    #[test]
    fn archive_extension_check_is_case_insensitive() {
        let config = HuntConfig::default();
        assert!(config.is_archive_name("backup.ZIP"));
        assert!(config.is_archive_name("release.tar"));
        assert!(!config.is_archive_name("notes.txt"));
        assert!(!config.is_archive_name("zip"));
        assert!(!config.is_archive_name(".zip"));
    }

    #[test]
    fn validate_rejects_zero_archive_depth() {
        let mut config = HuntConfig::default();
        config.max_archive_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(HuntError::BadThreshold(_))
        ));
    }

    #[test]
    fn validate_normalizes_extension_list() {
        let mut config = HuntConfig::default();
        config.supported_archives = vec![".Zip".to_string(), "TAR".to_string(), String::new()];
        config.validate().unwrap();
        assert_eq!(config.supported_archives, vec!["zip", "tar"]);
    }

    #[test]
    fn missing_config_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hunt.yaml");
        let config = load_or_create_config(Some(&path)).unwrap();
        assert!(path.exists());
        assert!(!config.match_rules.is_empty());
        // Loading again reads the file that was just written.
        let reloaded = load_or_create_config(Some(&path)).unwrap();
        assert_eq!(reloaded.match_rules.len(), config.match_rules.len());
    }
}
