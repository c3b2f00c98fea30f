//! Package-level constants.

/// Current version of cowork (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "cowork";

/// Tool the agent calls to leave plan mode; its `plan` input is the plan artifact.
pub const EXIT_PLAN_MODE_TOOL: &str = "ExitPlanMode";

/// Error recorded when the idle watchdog fires.
pub const IDLE_TIMEOUT_ERROR: &str = "idle timeout";

/// Error recorded when the agent stream closes without a result event.
pub const NO_RESULT_ERROR: &str = "ended without result";

/// Denial message for permission requests abandoned by cancellation.
pub const ABORTED_MESSAGE: &str = "aborted";

/// Media types accepted for image content blocks.
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];
