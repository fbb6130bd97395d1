//! Ray tracer configuration.
//!
//! Defaults can be overridden from `VOXTRACE_*` environment variables and are
//! validated against device limits before use.

use std::env;
use std::path::PathBuf;

use tracing::warn;

use crate::device::DeviceProperties;
use crate::error::{RtError, RtResult};

/// Number of frame slots. Fixed for the lifetime of the renderer.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Default cumulative structure size per bottom-level build batch.
pub const DEFAULT_BLAS_BATCH_LIMIT: u64 = 256_000_000;

/// Runtime settings for the ray tracer.
#[derive(Debug, Clone)]
pub struct RtConfig {
    /// Frame slots in flight. Only `FRAMES_IN_FLIGHT` is accepted.
    pub frames_in_flight: usize,
    /// Cumulative structure bytes per bottom-level build submission.
    pub blas_batch_limit: u64,
    /// Record compacted-size queries during bottom-level builds.
    pub query_compacted_sizes: bool,
    /// Requested recursion depth, clamped to the device maximum.
    pub max_ray_recursion_depth: u32,
    /// Enable the Khronos validation layer.
    pub validation: bool,
    /// FIFO presentation.
    pub vsync: bool,
    /// Directory holding compiled SPIR-V.
    pub shader_dir: PathBuf,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: FRAMES_IN_FLIGHT,
            blas_batch_limit: DEFAULT_BLAS_BATCH_LIMIT,
            query_compacted_sizes: true,
            max_ray_recursion_depth: 2,
            validation: cfg!(debug_assertions),
            vsync: true,
            shader_dir: default_shader_dir(),
        }
    }
}

impl RtConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Recognized variables: `VOXTRACE_SHADER_DIR`, `VOXTRACE_BLAS_BATCH_LIMIT`,
    /// `VOXTRACE_COMPACTION_QUERIES`, `VOXTRACE_RECURSION_DEPTH`,
    /// `VOXTRACE_VALIDATION`, `VOXTRACE_VSYNC`.
    pub fn from_env() -> RtResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RtResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("VOXTRACE_SHADER_DIR") {
            config.shader_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("VOXTRACE_BLAS_BATCH_LIMIT") {
            config.blas_batch_limit = parse(&value, "VOXTRACE_BLAS_BATCH_LIMIT")?;
        }
        if let Some(value) = lookup("VOXTRACE_COMPACTION_QUERIES") {
            config.query_compacted_sizes = parse_flag(&value, "VOXTRACE_COMPACTION_QUERIES")?;
        }
        if let Some(value) = lookup("VOXTRACE_RECURSION_DEPTH") {
            config.max_ray_recursion_depth = parse(&value, "VOXTRACE_RECURSION_DEPTH")?;
        }
        if let Some(value) = lookup("VOXTRACE_VALIDATION") {
            config.validation = parse_flag(&value, "VOXTRACE_VALIDATION")?;
        }
        if let Some(value) = lookup("VOXTRACE_VSYNC") {
            config.vsync = parse_flag(&value, "VOXTRACE_VSYNC")?;
        }

        Ok(config)
    }

    /// Check the settings against device limits.
    ///
    /// Rejects values the subsystem cannot run with and clamps the recursion
    /// depth to what the device supports.
    pub fn validate(mut self, props: &DeviceProperties) -> RtResult<Self> {
        if self.frames_in_flight != FRAMES_IN_FLIGHT {
            return Err(RtError::Config(format!(
                "frames_in_flight must be {}, got {}",
                FRAMES_IN_FLIGHT, self.frames_in_flight
            )));
        }
        if self.blas_batch_limit == 0 {
            return Err(RtError::Config("blas_batch_limit must be non-zero".into()));
        }
        if self.max_ray_recursion_depth == 0 {
            return Err(RtError::Config("max_ray_recursion_depth must be at least 1".into()));
        }
        if self.max_ray_recursion_depth > props.max_ray_recursion_depth {
            warn!(
                requested = self.max_ray_recursion_depth,
                device_max = props.max_ray_recursion_depth,
                "clamping ray recursion depth"
            );
            self.max_ray_recursion_depth = props.max_ray_recursion_depth;
        }
        Ok(self)
    }
}

/// `shaders/spirv` next to the executable if present, else the directory
/// the build script compiled into, else `shaders/spirv` relative to the
/// working directory.
fn default_shader_dir() -> PathBuf {
    let beside_exe = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("shaders").join("spirv")))
        .filter(|dir| dir.is_dir());
    beside_exe
        .or_else(|| option_env!("VOXTRACE_BUILD_SPIRV_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("shaders").join("spirv"))
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> RtResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RtError::Config(format!("{key}: cannot parse {value:?}")))
}

fn parse_flag(value: &str, key: &str) -> RtResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(RtError::Config(format!("{key}: expected a boolean, got {value:?}"))),
    }
}
