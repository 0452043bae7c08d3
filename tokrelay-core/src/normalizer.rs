use crate::error::{CoreResult, RelayError};
use crate::model::GenerationRequest;
use unicode_normalization::UnicodeNormalization;

/// Prompts longer than this are rejected before any upstream call.
pub const MAX_PROMPT_CHARS: usize = 32_000;

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Clean the prompt, default the model, and reject requests that must never reach an upstream.
pub fn normalize_request(mut req: GenerationRequest, default_model: &str) -> CoreResult<GenerationRequest> {
    req.prompt = clean_text(&req.prompt);
    if req.prompt.is_empty() {
        return Err(RelayError::Validation("prompt must not be empty".into()));
    }
    if req.prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(RelayError::Validation(format!(
            "prompt exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }
    req.model = req.model.trim().to_string();
    if req.model.is_empty() {
        req.model = default_model.to_string();
    }
    Ok(req)
}
