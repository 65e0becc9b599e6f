//! Model identifier grammar.
//!
//! Clients address models as `"<provider>,<model>"`. The first comma
//! splits; both halves are trimmed and must be non-empty, and the
//! provider half is restricted to `[A-Za-z0-9_.-]+`.

use crate::error::{RelayError, RelayResult};

/// A parsed model identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

fn is_valid_provider_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub fn parse_model_id(raw: &str) -> RelayResult<ModelRef> {
    let Some((provider, model)) = raw.split_once(',') else {
        return Err(RelayError::InvalidRequest(format!(
            "model '{raw}' must be of the form '<provider>,<model>'"
        )));
    };

    let provider = provider.trim();
    let model = model.trim();

    if provider.is_empty() || model.is_empty() {
        return Err(RelayError::InvalidRequest(format!(
            "model '{raw}' has an empty provider or model half"
        )));
    }
    if !is_valid_provider_name(provider) {
        return Err(RelayError::InvalidRequest(format!(
            "provider name '{provider}' contains invalid characters"
        )));
    }

    Ok(ModelRef {
        provider: provider.to_string(),
        model: model.to_string(),
    })
}
