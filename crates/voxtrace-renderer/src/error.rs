//! Error types for the ray-tracing subsystem.
//!
//! `RtError` is what every component returns. The renderer facade wraps it
//! into `RendererError` so the frame driver can tell a failed startup from a
//! failed frame.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

/// Component-level error taxonomy.
#[derive(Error, Debug)]
pub enum RtError {
    /// Buffer, image, sampler, structure or pipeline allocation failed.
    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: String, reason: String },

    /// Size or property query failed.
    #[error("query for {what} failed: {reason}")]
    Query { what: String, reason: String },

    /// Acceleration-structure build command failed.
    #[error("acceleration structure build failed: {0}")]
    Build(String),

    /// A queue submission (frame or one-shot) was rejected or failed to complete.
    #[error("{what} submission failed: {reason}")]
    Submit { what: String, reason: String },

    /// The output surface no longer matches the presentation target.
    #[error("presentation target is stale")]
    PresentationStale,

    /// The device was lost. Never recovered.
    #[error("device lost")]
    DeviceLost,

    /// A handle whose slot has since been released.
    #[error("stale {kind} handle (index {index}, generation {generation})")]
    StaleHandle {
        kind: &'static str,
        index: u32,
        generation: u32,
    },

    /// Geometry appended after the bottom-level build phase started.
    #[error("geometry registry is frozen")]
    RegistryFrozen,

    /// Binding layout requested before the registry was frozen.
    #[error("geometry registry must be frozen before creating the binding layout")]
    RegistryNotFrozen,

    /// Instances added after the top-level structure was built.
    #[error("top-level structure is already built; instance topology is locked")]
    TopologyLocked,

    /// A refit was requested with a different number of instances.
    #[error("instance count changed from {built} to {requested}; a full rebuild is required")]
    InstanceCountChanged { built: u32, requested: u32 },

    #[error("instance {index} out of range ({count} instances)")]
    InstanceIndex { index: u32, count: u32 },

    /// Operation needs a structure that has not been built yet.
    #[error("{0} has not been built")]
    NotBuilt(&'static str),

    /// Shader group table does not describe a valid shader binding table.
    #[error("invalid shader group table: {0}")]
    InvalidShaderTable(String),

    /// A frame slot was reused while its previous submission is pending.
    #[error("frame slot {0} is still in flight")]
    SlotInFlight(usize),

    /// SPIR-V could not be read from disk.
    #[error("failed to load shader {name} from {path}: {source}")]
    Shader {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RtError {
    pub fn resource(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RtError::ResourceCreation {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn query(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RtError::Query {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn submit(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RtError::Submit {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Report a failed submission of build commands as a build failure.
    /// Other errors pass through unchanged.
    pub fn into_build_failure(self) -> Self {
        match self {
            RtError::Submit { what, reason } => RtError::Build(format!("{what} submission failed: {reason}")),
            other => other,
        }
    }

    /// True only for `PresentationStale`, the one error the frame loop recovers from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RtError::PresentationStale)
    }
}

/// Classify a failing Vulkan call.
///
/// Device loss and out-of-date surfaces map to their own variants whatever the
/// call was; every other code is reported through `fallback`.
pub fn vk_error(result: vk::Result, fallback: impl FnOnce(vk::Result) -> RtError) -> RtError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => RtError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DATE_KHR => RtError::PresentationStale,
        other => fallback(other),
    }
}

/// Errors surfaced to the frame driver.
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("renderer failed to start: {0}")]
    Boot(#[source] RtError),

    #[error("frame failed: {0}")]
    Render(#[source] RtError),
}

impl RendererError {
    /// The component error underneath.
    pub fn inner(&self) -> &RtError {
        match self {
            RendererError::Boot(e) | RendererError::Render(e) => e,
        }
    }
}

pub type RtResult<T> = Result<T, RtError>;
pub type RendererResult<T> = Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_error_classifies_device_loss() {
        let err = vk_error(vk::Result::ERROR_DEVICE_LOST, |e| RtError::Build(format!("{:?}", e)));
        assert!(matches!(err, RtError::DeviceLost));
    }

    #[test]
    fn test_vk_error_classifies_out_of_date() {
        let err = vk_error(vk::Result::ERROR_OUT_OF_DATE_KHR, |e| RtError::resource("x", e));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_vk_error_uses_fallback() {
        let err = vk_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, |e| RtError::resource("blas", format!("{:?}", e)));
        match err {
            RtError::ResourceCreation { what, reason } => {
                assert_eq!(what, "blas");
                assert_eq!(reason, "ERROR_OUT_OF_DEVICE_MEMORY");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_submit_failure_becomes_build_failure() {
        let err = RtError::submit("one-shot", "ERROR_OUT_OF_DEVICE_MEMORY").into_build_failure();
        match err {
            RtError::Build(reason) => assert_eq!(reason, "one-shot submission failed: ERROR_OUT_OF_DEVICE_MEMORY"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(RtError::DeviceLost.into_build_failure(), RtError::DeviceLost));
    }

    #[test]
    fn test_renderer_error_inner() {
        let err = RendererError::Render(RtError::DeviceLost);
        assert!(matches!(err.inner(), RtError::DeviceLost));
        assert_eq!(err.to_string(), "frame failed: device lost");
    }
}
