//! Safety renderer: the immutable crisis-resource block.
//!
//! The block is a fixed, never-generated string. It is never composed by
//! the LLM — only prepended verbatim by this module — and its hash is
//! retained in the audit event for tamper detection.

use sha2::{Digest, Sha256};

/// Exact crisis-resource block, including order of resources, required by
/// the structural invariant: separator, header, 988, 741741,
/// 1-800-662-4357, separator, all within the first 1500 bytes.
pub const CRISIS_RESOURCE_BLOCK: &str = "\
----------------------------------------
If you are in crisis, immediate help is available:
- Call or text 988 (Suicide & Crisis Lifeline) — available 24/7
- Text HOME to 741741 (Crisis Text Line) — available 24/7
- Call 1-800-662-4357 (SAMHSA National Helpline) — available 24/7
- International Association for Suicide Prevention: https://www.iasp.info/resources/Crisis_Centres/
----------------------------------------
";

/// Renders the safety block and prepends it to a message, deterministically.
pub struct SafetyRenderer;

impl SafetyRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Deterministically prepend the immutable crisis block to `message`.
    pub fn render_crisis_response(&self, message: &str) -> String {
        format!("{CRISIS_RESOURCE_BLOCK}\n{message}")
    }

    /// SHA-256 hash of the crisis block, retained in audit events for
    /// tamper detection.
    pub fn block_hash() -> String {
        let mut hasher = Sha256::new();
        hasher.update(CRISIS_RESOURCE_BLOCK.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Structurally verify that `text` opens with the crisis block within
    /// the first 1500 characters, in the exact required order.
    pub fn verify_structure(text: &str) -> bool {
        let window: String = text.chars().take(1500).collect();

        let separator = "----------------------------------------";
        let required_in_order = ["988", "741741", "1-800-662-4357"];

        let Some(first_sep) = window.find(separator) else {
            return false;
        };
        let after_first_sep = &window[first_sep + separator.len()..];

        let Some(last_sep_rel) = after_first_sep.rfind(separator) else {
            return false;
        };
        let body = &after_first_sep[..last_sep_rel];

        let mut cursor = 0usize;
        for marker in required_in_order {
            match body[cursor..].find(marker) {
                Some(pos) => cursor += pos + marker.len(),
                None => return false,
            }
        }

        // The block itself must begin at (or very near) the start of text,
        // i.e. the response must *open with* it, not merely contain it.
        window.trim_start().starts_with(separator)
    }
}

impl Default for SafetyRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prepends_block_verbatim() {
        let renderer = SafetyRenderer::new();
        let rendered = renderer.render_crisis_response("I'm here with you.");
        assert!(rendered.starts_with(CRISIS_RESOURCE_BLOCK));
        assert!(rendered.ends_with("I'm here with you."));
    }

    #[test]
    fn verify_structure_accepts_rendered_block() {
        let renderer = SafetyRenderer::new();
        let rendered = renderer.render_crisis_response("Let's talk.");
        assert!(SafetyRenderer::verify_structure(&rendered));
    }

    #[test]
    fn verify_structure_rejects_missing_resource() {
        let tampered = "----------------------------------------\nonly 988 here\n----------------------------------------\n";
        assert!(!SafetyRenderer::verify_structure(tampered));
    }

    #[test]
    fn verify_structure_rejects_text_not_opening_with_block() {
        let text = format!("Some preamble.\n{CRISIS_RESOURCE_BLOCK}");
        assert!(!SafetyRenderer::verify_structure(&text));
    }

    #[test]
    fn block_hash_is_stable() {
        assert_eq!(SafetyRenderer::block_hash(), SafetyRenderer::block_hash());
    }
}
