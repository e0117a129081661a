use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tracing::debug;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                debug!("Token encoder unavailable, falling back to estimate: {}", e);
                None
            }
        })
        .as_ref()
}

/// Approximate prompt size in tokens.
///
/// Uses the cl100k encoding when available and a four-characters-per-token
/// heuristic otherwise; only used for warnings, never for truncation.
pub fn estimate_tokens(text: &str) -> usize {
    match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}
