use anyhow::{Context, Result};
use nio_contracts::{
    DEFAULT_IMAGE_LOCATION, ENV_FUEL, ENV_IMAGE, ENV_IMAGE_SHA256, ENV_MAX_MEMORY_BYTES,
    ENV_MAX_OUTPUT_BYTES,
};

/// Where the program image comes from, plus an optional integrity pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    /// `http(s)://…`, `file://…`, or a filesystem path.
    pub location: String,
    /// Lower-hex sha256 the fetched bytes must match.
    pub sha256: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            location: DEFAULT_IMAGE_LOCATION.to_string(),
            sha256: None,
        }
    }
}

impl ImageConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let location = lookup(ENV_IMAGE)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE_LOCATION.to_string());
        let sha256 = lookup(ENV_IMAGE_SHA256)
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        ImageConfig { location, sha256 }
    }
}

/// Per-execution resource limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerLimits {
    pub fuel: Option<u64>,
    pub max_memory_bytes: Option<usize>,
    pub max_output_bytes: Option<usize>,
}

impl RunnerLimits {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let fuel = optional_u64(ENV_FUEL, lookup(ENV_FUEL))?;
        let max_memory_bytes = optional_u64(ENV_MAX_MEMORY_BYTES, lookup(ENV_MAX_MEMORY_BYTES))?
            .map(usize::try_from)
            .transpose()
            .with_context(|| format!("{ENV_MAX_MEMORY_BYTES} does not fit in usize"))?;
        let max_output_bytes = optional_u64(ENV_MAX_OUTPUT_BYTES, lookup(ENV_MAX_OUTPUT_BYTES))?
            .map(usize::try_from)
            .transpose()
            .with_context(|| format!("{ENV_MAX_OUTPUT_BYTES} does not fit in usize"))?;
        Ok(RunnerLimits {
            fuel,
            max_memory_bytes,
            max_output_bytes,
        })
    }

    /// Fields set in `overrides` win.
    pub fn merged(self, overrides: RunnerLimits) -> Self {
        RunnerLimits {
            fuel: overrides.fuel.or(self.fuel),
            max_memory_bytes: overrides.max_memory_bytes.or(self.max_memory_bytes),
            max_output_bytes: overrides.max_output_bytes.or(self.max_output_bytes),
        }
    }
}

fn optional_u64(name: &str, raw: Option<String>) -> Result<Option<u64>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let digits: String = raw.chars().filter(|c| *c != '_').collect();
    digits.parse::<u64>().map(Some).with_context(|| {
        format!("invalid environment variable {name}={raw:?} (expected a non-negative integer)")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn image_config_defaults_to_build_artifact() {
        let cfg = ImageConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, ImageConfig::default());
        assert_eq!(cfg.location, DEFAULT_IMAGE_LOCATION);
    }

    #[test]
    fn image_config_normalizes_pin() {
        let cfg = ImageConfig::from_lookup(lookup(&[
            (ENV_IMAGE, " https://example.invalid/nio.wasm "),
            (ENV_IMAGE_SHA256, "ABCDEF"),
        ]));
        assert_eq!(cfg.location, "https://example.invalid/nio.wasm");
        assert_eq!(cfg.sha256.as_deref(), Some("abcdef"));
    }

    #[test]
    fn limits_default_to_unlimited() {
        let limits = RunnerLimits::from_lookup(lookup(&[])).expect("limits");
        assert_eq!(limits, RunnerLimits::default());
    }

    #[test]
    fn limits_parse_underscored_integers() {
        let limits = RunnerLimits::from_lookup(lookup(&[
            (ENV_FUEL, "50_000_000"),
            (ENV_MAX_MEMORY_BYTES, "67108864"),
            (ENV_MAX_OUTPUT_BYTES, ""),
        ]))
        .expect("limits");
        assert_eq!(limits.fuel, Some(50_000_000));
        assert_eq!(limits.max_memory_bytes, Some(64 * 1024 * 1024));
        assert_eq!(limits.max_output_bytes, None);
    }

    #[test]
    fn malformed_limit_is_an_error() {
        let err = RunnerLimits::from_lookup(lookup(&[(ENV_FUEL, "lots")])).unwrap_err();
        assert!(err.to_string().contains(ENV_FUEL), "err={err:#}");
    }

    #[test]
    fn overrides_win_when_set() {
        let base = RunnerLimits {
            fuel: Some(1),
            max_memory_bytes: Some(2),
            max_output_bytes: None,
        };
        let merged = base.merged(RunnerLimits {
            fuel: Some(10),
            max_memory_bytes: None,
            max_output_bytes: Some(30),
        });
        assert_eq!(
            merged,
            RunnerLimits {
                fuel: Some(10),
                max_memory_bytes: Some(2),
                max_output_bytes: Some(30),
            }
        );
    }
}
