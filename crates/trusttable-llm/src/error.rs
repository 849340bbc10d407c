use thiserror::Error;

/// Failures at the language-model boundary.
///
/// Every variant is an expected condition; callers retry with bounded
/// attempts and then surface the sample as unavailable.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model transport error: {0}")]
    Transport(String),

    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model response carried no content")]
    EmptyResponse,

    #[error("failed to decode model response: {0}")]
    Decode(String),

    #[error("model configuration error: {0}")]
    Config(String),

    #[error("no scripted response left for purpose `{0}`")]
    ScriptExhausted(String),
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ModelError::Decode(e.to_string())
        } else {
            ModelError::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
