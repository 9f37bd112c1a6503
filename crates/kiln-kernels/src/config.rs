//! Kernel configuration.
//!
//! Loaded from JSON and optionally overridden from the environment:
//!
//! | variable                   | field                       |
//! |----------------------------|-----------------------------|
//! | `KILN_CAT_BATCH_SIZE`      | `cat.batch_size`            |
//! | `KILN_CAT_BATCHED_COPY`    | `cat.enable_batched_copy`   |
//! | `KILN_LINEAR_FUSION`       | `linear.enable_fusion`      |
//! | `KILN_LINALG_BACKEND`      | `linalg.backend`            |
//! | `KILN_MAX_WORK_GROUP_SIZE` | `runtime.max_work_group_size` |

use std::path::Path;
use std::str::FromStr;

use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on inputs copied by one batched-concat dispatch.
pub const MAX_CAT_BATCH_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub runtime: RuntimeConfig,
    pub cat: CatConfig,
    pub linear: LinearConfig,
    pub linalg: LinalgConfig,
}

/// Shape of the simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of compute units. Defaults to the rayon pool size.
    pub max_compute_units: usize,
    /// Work-items per work-group.
    pub max_work_group_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_compute_units: rayon::current_num_threads(),
            max_work_group_size: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatConfig {
    /// Inputs per batched-copy dispatch, `1..=1024`.
    pub batch_size: usize,
    /// When false every concat takes the narrow-and-copy path.
    pub enable_batched_copy: bool,
}

impl Default for CatConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_CAT_BATCH_SIZE,
            enable_batched_copy: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    /// Let the matmul service fuse post-ops into its epilogue.
    pub enable_fusion: bool,
    /// Also fuse post-ops that read a second tensor.
    pub fuse_binary: bool,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            enable_fusion: true,
            fuse_binary: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinalgConfig {
    pub backend: LinalgBackend,
}

/// Which factorization service backs LU and SVD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinalgBackend {
    /// Built-in host implementation.
    #[default]
    Host,
    /// No backend: factorizations report `Unsupported`.
    None,
}

impl FromStr for LinalgBackend {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(LinalgBackend::Host),
            "none" => Ok(LinalgBackend::None),
            other => Err(KilnError::Config(format!("unknown linalg backend '{other}'"))),
        }
    }
}

impl KernelConfig {
    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: KernelConfig = serde_json::from_str(text)
            .map_err(|e| KilnError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KILN_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("KILN_CAT_BATCH_SIZE") {
            self.cat.batch_size = parse_var("KILN_CAT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("KILN_CAT_BATCHED_COPY") {
            self.cat.enable_batched_copy = parse_flag("KILN_CAT_BATCHED_COPY", &v)?;
        }
        if let Some(v) = lookup("KILN_LINEAR_FUSION") {
            self.linear.enable_fusion = parse_flag("KILN_LINEAR_FUSION", &v)?;
        }
        if let Some(v) = lookup("KILN_LINALG_BACKEND") {
            self.linalg.backend = v.parse()?;
        }
        if let Some(v) = lookup("KILN_MAX_WORK_GROUP_SIZE") {
            self.runtime.max_work_group_size = parse_var("KILN_MAX_WORK_GROUP_SIZE", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_CAT_BATCH_SIZE).contains(&self.cat.batch_size) {
            return Err(KilnError::Config(format!(
                "cat.batch_size must be in 1..={MAX_CAT_BATCH_SIZE}, got {}",
                self.cat.batch_size
            )));
        }
        if self.runtime.max_work_group_size == 0 {
            return Err(KilnError::Config(
                "runtime.max_work_group_size must be positive".into(),
            ));
        }
        if self.runtime.max_compute_units == 0 {
            return Err(KilnError::Config(
                "runtime.max_compute_units must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KilnError::Config(format!("{key}: cannot parse '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(KilnError::Config(format!("{key}: expected a boolean, got '{value}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = KernelConfig::default();
        assert_eq!(c.cat.batch_size, 1024);
        assert!(c.cat.enable_batched_copy);
        assert!(c.linear.enable_fusion);
        assert_eq!(c.linalg.backend, LinalgBackend::Host);
        assert_eq!(c.runtime.max_work_group_size, 256);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let c = KernelConfig::from_json_str(
            r#"{ "cat": { "batch_size": 8 }, "linalg": { "backend": "none" } }"#,
        )
        .unwrap();
        assert_eq!(c.cat.batch_size, 8);
        assert!(c.cat.enable_batched_copy);
        assert_eq!(c.linalg.backend, LinalgBackend::None);
    }

    #[test]
    fn test_rejects_out_of_range_batch() {
        assert!(KernelConfig::from_json_str(r#"{ "cat": { "batch_size": 0 } }"#).is_err());
        assert!(KernelConfig::from_json_str(r#"{ "cat": { "batch_size": 2048 } }"#).is_err());
        assert!(KernelConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("KILN_CAT_BATCH_SIZE", "3"),
            ("KILN_CAT_BATCHED_COPY", "off"),
            ("KILN_LINEAR_FUSION", "0"),
            ("KILN_LINALG_BACKEND", "NONE"),
        ]
        .into_iter()
        .collect();
        let c = KernelConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(c.cat.batch_size, 3);
        assert!(!c.cat.enable_batched_copy);
        assert!(!c.linear.enable_fusion);
        assert_eq!(c.linalg.backend, LinalgBackend::None);
    }

    #[test]
    fn test_bad_override() {
        let err = KernelConfig::default()
            .with_overrides(|k| (k == "KILN_LINEAR_FUSION").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("KILN_LINEAR_FUSION"));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("kiln-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "linear": { "fuse_binary": false } }"#).unwrap();
        let c = KernelConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(!c.linear.fuse_binary);
        assert!(KernelConfig::from_file("/nonexistent/kiln.json").is_err());
    }
}
