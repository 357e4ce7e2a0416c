//! Tenant configuration.

use anyhow::{Context, Result};
use serde::de::{self, Deserializer, Visitor};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-call instruction budget used when none is configured.
pub const DEFAULT_MAX_INSTRUCTIONS: u64 = 2_000_000;
/// Address-space ceiling used when none is configured.
pub const DEFAULT_MAX_MEMORY: u64 = 64_000_000;
/// Native heap size used when none is configured.
pub const DEFAULT_MAX_HEAP: u64 = 8_000_000;

/// Settings for one tenant. Immutable once the tenant is built.
///
/// In TOML, sizes and budgets may be written either as plain integers or as
/// strings with a unit suffix: `max-memory = "64Mi"`,
/// `max-instructions = "2M"`.
#[derive(serde_derive::Deserialize, serde_derive::Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TenantConfig {
    /// Tenant name, also passed to the guest as `argv[0]`.
    pub name: String,
    pub group: String,
    /// Path of the program to load.
    pub filename: PathBuf,
    /// Instruction budget for initialization and for each call.
    #[serde(deserialize_with = "deserialize_si_prefix")]
    pub max_instructions: u64,
    /// Upper bound of the template's guest address space.
    #[serde(deserialize_with = "deserialize_memory_size")]
    pub max_memory: u64,
    /// Size of the native heap arena.
    #[serde(deserialize_with = "deserialize_memory_size")]
    pub max_heap: u64,
}

// wrapped, so a file can hold several tenants as `[[tenant]]` tables
#[derive(serde_derive::Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct TenantsFile {
    #[serde(default)]
    tenant: Vec<TenantConfig>,
}

impl TenantConfig {
    /// Creates a configuration with the default limits.
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        filename: impl Into<PathBuf>,
    ) -> TenantConfig {
        TenantConfig {
            name: name.into(),
            group: group.into(),
            filename: filename.into(),
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            max_memory: DEFAULT_MAX_MEMORY,
            max_heap: DEFAULT_MAX_HEAP,
        }
    }

    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }

    pub fn with_max_memory(mut self, max: u64) -> Self {
        self.max_memory = max;
        self
    }

    pub fn with_max_heap(mut self, max: u64) -> Self {
        self.max_heap = max;
        self
    }

    /// Parses the `[[tenant]]` tables of a TOML document.
    pub fn parse_all(contents: &str) -> Result<Vec<TenantConfig>> {
        let file = toml::from_str::<TenantsFile>(contents)?;
        Ok(file.tenant)
    }

    /// Loads every tenant described in the TOML file at `path`.
    ///
    /// Relative program paths are resolved against the directory holding the
    /// configuration file.
    pub fn from_file(path: &Path) -> Result<Vec<TenantConfig>> {
        log::trace!("loading tenant configuration from {}", path.display());
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut tenants = Self::parse_all(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        if let Some(dir) = path.parent() {
            for tenant in &mut tenants {
                if tenant.filename.is_relative() {
                    tenant.filename = dir.join(&tenant.filename);
                }
            }
        }
        Ok(tenants)
    }
}

// Deserializers of our custom formats. Unlike the string-only formats these
// also accept plain TOML integers.
macro_rules! generate_deserializer {
    ($name:ident($numname:ident: $numty:ty, $unitname:ident: &str) -> $retty:ty {$body:expr}) => {
        fn $name<'de, D>(deserializer: D) -> Result<$retty, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct Units;

            impl<'de> Visitor<'de> for Units {
                type Value = $retty;

                fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    f.write_str("an integer or a string such as \"64Mi\"")
                }

                fn visit_u64<E: de::Error>(self, v: u64) -> Result<$retty, E> {
                    Ok(v)
                }

                fn visit_i64<E: de::Error>(self, v: i64) -> Result<$retty, E> {
                    u64::try_from(v).map_err(|_| E::custom("value must not be negative"))
                }

                fn visit_str<E: de::Error>(self, text: &str) -> Result<$retty, E> {
                    let text = text.trim();
                    let split_point = text.find(|c: char| !c.is_numeric());
                    let (num, unit) = split_point.map_or_else(|| (text, ""), |p| text.split_at(p));
                    let deserialized = (|| {
                        let $numname = num.parse::<$numty>().ok()?;
                        let $unitname = unit.trim();
                        $body
                    })();
                    deserialized.ok_or_else(|| E::custom(format!("invalid value `{text}`")))
                }
            }

            deserializer.deserialize_any(Units)
        }
    };
}

generate_deserializer!(deserialize_si_prefix(num: u64, unit: &str) -> u64 {
    match unit {
        "" => Some(num),
        "K" => num.checked_mul(1_000),
        "M" => num.checked_mul(1_000_000),
        "G" => num.checked_mul(1_000_000_000),
        _ => None,
    }
});

generate_deserializer!(deserialize_memory_size(num: u64, unit: &str) -> u64 {
    match unit {
        "" => Some(num),
        "K" => num.checked_mul(1_000),
        "Ki" => num.checked_mul(1u64 << 10),
        "M" => num.checked_mul(1_000_000),
        "Mi" => num.checked_mul(1u64 << 20),
        "G" => num.checked_mul(1_000_000_000),
        "Gi" => num.checked_mul(1u64 << 30),
        _ => None,
    }
});
