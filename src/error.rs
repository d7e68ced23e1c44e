pub type PostframeResult<T> = Result<T, PostframeError>;

/// Failure taxonomy for the compositing/export pipeline.
///
/// Everything raised below the export boundary collapses into one of these;
/// the session surfaces them as a single user-visible failure and never
/// crashes the editor loop.
#[derive(thiserror::Error, Debug)]
pub enum PostframeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("media load error: {0}")]
    MediaLoad(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("pixel readback error: {0}")]
    PixelReadback(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PostframeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn surface(msg: impl Into<String>) -> Self {
        Self::Surface(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn media_load(msg: impl Into<String>) -> Self {
        Self::MediaLoad(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn pixel_readback(msg: impl Into<String>) -> Self {
        Self::PixelReadback(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            PostframeError::validation("x")
                .to_string()
                .contains("validation error:")
        );
        assert!(
            PostframeError::codec("x")
                .to_string()
                .contains("codec error:")
        );
        assert!(
            PostframeError::media_load("x")
                .to_string()
                .contains("media load error:")
        );
        assert!(
            PostframeError::encode("x")
                .to_string()
                .contains("encode error:")
        );
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = PostframeError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
