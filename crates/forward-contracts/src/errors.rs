use thiserror::Error;

/// Failures while accepting or encoding the uploaded photo. These abort the
/// run before any per-year call is made.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no image uploaded: {0}")]
    MissingImage(String),

    #[error("image format not supported ({0}); upload a PNG, JPG, or WEBP file")]
    UnsupportedFormat(String),

    #[error("failed reading image file: {0}")]
    UnreadableFile(String),

    #[error("image file produced an empty base64 payload")]
    EmptyPayload,
}

/// Failures of a single per-year generation call. The orchestrator converts
/// these into that entry's `error` status; they never fail the run.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("GEMINI_API_KEY or GOOGLE_API_KEY not set")]
    MissingApiKey,

    #[error("no image data in the service response; it may have been blocked by safety policies")]
    NoImagePayload,

    #[error("Gemini request failed: {0}")]
    Transport(String),

    #[error("Gemini returned an unusable response: {0}")]
    Protocol(String),
}

/// Failures while composing the polaroid collage.
#[derive(Debug, Error)]
pub enum CollageError {
    #[error("no settled images available for a collage")]
    NoContent,

    #[error("collage source failed to load ({label}): {cause}")]
    ImageLoad { label: String, cause: String },

    #[error("collage surface could not be created: {0}")]
    CanvasUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_piece() {
        let err = UploadError::UnsupportedFormat("image/gif".to_string());
        assert!(err.to_string().contains("image/gif"));

        let err = CollageError::ImageLoad {
            label: "2045".to_string(),
            cause: "bad png header".to_string(),
        };
        assert!(err.to_string().contains("2045"));
        assert!(err.to_string().contains("bad png header"));
    }

    #[test]
    fn generation_errors_are_human_readable() {
        assert!(!GenerationError::MissingApiKey.to_string().is_empty());
        assert!(GenerationError::NoImagePayload
            .to_string()
            .contains("safety"));
    }
}
