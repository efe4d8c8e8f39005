use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{BlendMode, ReferenceSpaceKind, ViewConfiguration};
use crate::{XrError, XrResult};

/// Clear color of the reference renderer.
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.5, 1.0, 0.5, 1.0];

/// How long to wait for an acquired swapchain image.
///
/// The compositor guarantees the wait never blocks forever, so the default is
/// unbounded. A finite `timeout_ms` turns each expiry into a logged retry, or
/// into an error when `fatal_on_timeout` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageWaitPolicy {
    pub timeout_ms: Option<u64>,
    pub fatal_on_timeout: bool,
}

impl ImageWaitPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub view_configuration: ViewConfiguration,
    pub reference_space: ReferenceSpaceKind,
    pub blend_mode: BlendMode,
    pub clear_color: [f32; 4],
    pub mirror_clear_color: [f32; 4],
    pub image_wait: ImageWaitPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            view_configuration: ViewConfiguration::PrimaryStereo,
            reference_space: ReferenceSpaceKind::Local,
            blend_mode: BlendMode::Opaque,
            clear_color: DEFAULT_CLEAR_COLOR,
            mirror_clear_color: DEFAULT_CLEAR_COLOR,
            image_wait: ImageWaitPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> XrResult<()> {
        let mut colors = self.clear_color.iter().chain(self.mirror_clear_color.iter());
        if colors.any(|c| !c.is_finite()) {
            return Err(XrError::config("clear color components must be finite"));
        }
        if self.image_wait.timeout_ms == Some(0) {
            return Err(XrError::config(
                "image wait timeout must be positive; omit it to wait without bound",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_waits_without_bound() {
        let config = SessionConfig::default();
        assert_eq!(config.image_wait.timeout(), None);
        assert!(!config.image_wait.fatal_on_timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut config = SessionConfig::default();
        config.image_wait.timeout_ms = Some(0);
        assert!(matches!(config.validate(), Err(XrError::Config(_))));
    }

    #[test]
    fn rejects_nan_color() {
        let mut config = SessionConfig::default();
        config.mirror_clear_color[1] = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SessionConfig = serde_json::from_str(
            r#"{ "reference_space": "stage", "image_wait": { "timeout_ms": 250 } }"#,
        )
        .unwrap();
        assert_eq!(config.reference_space, ReferenceSpaceKind::Stage);
        assert_eq!(config.image_wait.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.clear_color, DEFAULT_CLEAR_COLOR);
        assert_eq!(config.view_configuration, ViewConfiguration::PrimaryStereo);
    }
}
