//! Configuration types.
//!
//! Everything is read from `SLICEGATE_*` environment variables. Unset
//! variables fall back to [`Default`]; set-but-invalid values are an error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::engine::{DEFAULT_OUTPUT_CAP, DEFAULT_TIMEOUT};
use crate::error::ConfigError;
use crate::estimate::PricingModel;
use crate::pipeline::DEFAULT_MAX_CONCURRENT_SLICES;

/// Default maximum upload size (100 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Extensions accepted when `SLICEGATE_ALLOWED_EXTENSIONS` is unset.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[".stl", ".3mf", ".amf", ".obj", ".step", ".stp"];

/// External slicing engine invocation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executable name or path.
    pub program: PathBuf,
    /// Argument template tokens; `{input}` and `{output}` are substituted.
    pub args: Vec<String>,
    /// Wall-clock budget per invocation.
    pub timeout: Duration,
    /// Bytes retained per captured stream.
    pub output_cap: usize,
    /// Engine processes allowed at once.
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("prusa-slicer"),
            args: ["--export-gcode", "{input}", "--output", "{output}"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout: DEFAULT_TIMEOUT,
            output_cap: DEFAULT_OUTPUT_CAP,
            max_concurrent: DEFAULT_MAX_CONCURRENT_SLICES,
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen address.
    pub bind: SocketAddr,
    /// Root of every per-job file.
    pub scratch_dir: PathBuf,
    /// Largest accepted upload in bytes.
    pub max_upload_bytes: u64,
    /// Accepted model extensions, with leading dot.
    pub allowed_extensions: Vec<String>,
    pub engine: EngineConfig,
    pub pricing: PricingModel,
    /// Currency used when formatting prices for display.
    pub currency: String,
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            scratch_dir: PathBuf::from("./data/scratch"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            engine: EngineConfig::default(),
            pricing: PricingModel::default(),
            currency: "USD".to_string(),
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let allowed_extensions = match get("SLICEGATE_ALLOWED_EXTENSIONS") {
            Some(list) => {
                let list: Vec<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                if list.is_empty() {
                    return Err(invalid("SLICEGATE_ALLOWED_EXTENSIONS", "no extensions given"));
                }
                list
            }
            None => defaults.allowed_extensions,
        };

        let engine_args = match get("SLICEGATE_ENGINE_ARGS") {
            Some(template) => template.split_whitespace().map(String::from).collect(),
            None => defaults.engine.args,
        };

        let timeout_secs: u64 = parse(&get, "SLICEGATE_ENGINE_TIMEOUT_SECS")?
            .unwrap_or(defaults.engine.timeout.as_secs());
        if timeout_secs == 0 {
            return Err(invalid("SLICEGATE_ENGINE_TIMEOUT_SECS", "must be at least 1"));
        }

        let max_concurrent: usize = parse(&get, "SLICEGATE_MAX_CONCURRENT_SLICES")?
            .unwrap_or(defaults.engine.max_concurrent);
        if max_concurrent == 0 {
            return Err(invalid("SLICEGATE_MAX_CONCURRENT_SLICES", "must be at least 1"));
        }

        let max_upload_bytes: u64 =
            parse(&get, "SLICEGATE_MAX_UPLOAD_BYTES")?.unwrap_or(defaults.max_upload_bytes);
        if max_upload_bytes == 0 {
            return Err(invalid("SLICEGATE_MAX_UPLOAD_BYTES", "must be at least 1"));
        }

        let pricing = PricingModel {
            base_price: decimal(&get, "SLICEGATE_BASE_PRICE")?
                .unwrap_or(defaults.pricing.base_price),
            price_per_unit: decimal(&get, "SLICEGATE_PRICE_PER_UNIT")?
                .unwrap_or(defaults.pricing.price_per_unit),
            base_time: decimal(&get, "SLICEGATE_BASE_TIME")?.unwrap_or(defaults.pricing.base_time),
            time_per_layer: decimal(&get, "SLICEGATE_TIME_PER_LAYER")?
                .unwrap_or(defaults.pricing.time_per_layer),
        };

        Ok(Self {
            bind: parse(&get, "SLICEGATE_BIND")?.unwrap_or(defaults.bind),
            scratch_dir: get("SLICEGATE_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            max_upload_bytes,
            allowed_extensions,
            engine: EngineConfig {
                program: get("SLICEGATE_ENGINE_BIN")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.engine.program),
                args: engine_args,
                timeout: Duration::from_secs(timeout_secs),
                output_cap: parse(&get, "SLICEGATE_ENGINE_OUTPUT_CAP")?
                    .unwrap_or(defaults.engine.output_cap),
                max_concurrent,
            },
            pricing,
            currency: get("SLICEGATE_CURRENCY")
                .map(|c| c.to_uppercase())
                .unwrap_or(defaults.currency),
            log_dir: get("SLICEGATE_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| invalid(key, format!("'{raw}': {e}")))
        })
        .transpose()
}

/// Pricing constants must be non-negative decimals.
fn decimal<G>(get: &G, key: &str) -> Result<Option<Decimal>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse::<Decimal, G>(get, key)? {
        Some(value) if value.is_sign_negative() && !value.is_zero() => {
            Err(invalid(key, "must not be negative"))
        }
        other => Ok(other),
    }
}
