use thiserror::Error;

/// Result alias for the image-to-answer pipeline.
pub type Result<T> = std::result::Result<T, VisionError>;

/// Every failure the pipeline can surface. All of them end the current request.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("invalid max width {max_width}: must be a positive number of pixels")]
    InvalidDimension { max_width: u32 },

    #[error(
        "selected region is empty after clamping to the image: left={left} top={top} right={right} bottom={bottom}"
    )]
    EmptyRegion {
        left: i64,
        top: i64,
        right: i64,
        bottom: i64,
    },

    #[error("annotations contain no rectangle (found: {})", .kinds.join(", "))]
    NoRectangle { kinds: Vec<String> },

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("vision model unreachable: {0}")]
    RemoteUnavailable(String),

    #[error("vision model rejected the request{}: {message}", status_suffix(.status))]
    RemoteRejected { status: Option<u16>, message: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}
