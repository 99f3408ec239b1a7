//! Partial-substring tokenizer for prefix/substring search
//!
//! Every contiguous substring of every word is emitted, so a query word matches a
//! document when it appears anywhere inside one of the document's words. The same
//! output is joined with commas into the `tokens` field of each indexed film.

/// Separator used when the substrings are stored as a single text field.
pub const TOKEN_SEPARATOR: char = ',';

/// Split `phrase` into lower-cased words and emit all partial substrings of each.
///
/// For each word the substrings are ordered by increasing length, then by start
/// offset. A word of `L` characters yields `L * (L + 1) / 2` entries.
pub fn tokenize(phrase: &str) -> Vec<String> {
    let lowered = phrase.to_lowercase();
    let mut tokens = Vec::new();

    for word in lowered.split_whitespace() {
        // Index by char so multi-byte letters are never split
        let chars: Vec<char> = word.chars().collect();
        let len = chars.len();
        tokens.reserve(len * (len + 1) / 2);

        for width in 1..=len {
            for start in 0..=(len - width) {
                tokens.push(chars[start..start + width].iter().collect());
            }
        }
    }

    tokens
}

/// Comma-joined form stored in the index `tokens` field
pub fn joined_tokens(phrase: &str) -> String {
    let mut joined = String::new();
    for (i, token) in tokenize(phrase).iter().enumerate() {
        if i > 0 {
            joined.push(TOKEN_SEPARATOR);
        }
        joined.push_str(token);
    }
    joined
}
