use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// Splits a sentence into lowercase word tokens.
///
/// Text is NFKC-normalised first so full-width and half-width forms of the
/// same character produce the same token. Segmentation follows UAX #29, which
/// yields one token per ideograph for CJK text.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized: String = text.nfkc().collect();
    normalized
        .unicode_words()
        .map(str::to_lowercase)
        .filter(|token| !token.trim().is_empty())
        .collect()
}
