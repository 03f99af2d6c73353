use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Normalizes raw multilingual listing text before classification and
/// extraction. Idempotent: re-applying yields the same string.
pub fn normalize_text(text: &str) -> String {
    let mut cleaned = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect::<String>();

    cleaned = cleaned.nfkc().collect::<String>();
    cleaned = cleaned.replace("\r\n", "\n").replace('\r', "\n");
    cleaned = fold_arabic_digits(&cleaned);
    cleaned = normalize_currency_tokens(&cleaned);
    cleaned = collapse_punctuation_runs(&cleaned);
    cleaned = collapse_line_whitespace(&cleaned);

    cleaned.trim().to_string()
}

/// Maps Arabic-Indic (U+0660..U+0669) and Extended Arabic-Indic
/// (U+06F0..U+06F9) digits onto ASCII digits. Other characters pass through.
pub fn fold_arabic_digits(input: &str) -> String {
    input
        .chars()
        .map(|ch| match ch {
            '\u{0660}'..='\u{0669}' => {
                char::from(b'0' + (ch as u32 - 0x0660) as u8)
            }
            '\u{06F0}'..='\u{06F9}' => {
                char::from(b'0' + (ch as u32 - 0x06F0) as u8)
            }
            _ => ch,
        })
        .collect()
}

fn normalize_currency_tokens(input: &str) -> String {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(?:جنيه|l\.e\.?|le|egp|ج)\b").unwrap());
    RE.replace_all(input, "egp").into_owned()
}

/// Normalizes a single already-tokenized currency word (used by the field
/// validator, where the value is a lone token rather than running text).
pub fn normalize_currency_word(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    match lowered.as_str() {
        "جنيه" | "ج" | "le" | "l.e" | "l.e." | "egp" => "egp".to_string(),
        _ => lowered,
    }
}

fn collapse_punctuation_runs(input: &str) -> String {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([!?\.,،؛])[!?\.,،؛]+").unwrap());
    RE.replace_all(input, "$1").into_owned()
}

/// Collapses horizontal whitespace within each line and squeezes runs of
/// blank lines down to a single blank line. Newlines are preserved because
/// the listing segmenter operates on line structure.
fn collapse_line_whitespace(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blank_pending = false;
    for line in input.lines() {
        let squeezed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if squeezed.is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if blank_pending {
            out.push(String::new());
            blank_pending = false;
        }
        out.push(squeezed);
    }
    out.join("\n")
}

/// Reduces a value to its ASCII digits. A blank result means "unknown",
/// never zero.
pub fn digits_only(value: &str) -> String {
    fold_arabic_digits(value)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_idempotent() {
        let samples = [
            "شقة للبيع ٣ غرف بسعر ٣٥٠٠٠٠٠ جنيه!!! في التجمع",
            "Apartment for sale,, 3 bedrooms.. price 5500000 LE",
            "  spaced   out \n\n\n\n text ",
        ];
        for sample in samples {
            let once = normalize_text(sample);
            assert_eq!(normalize_text(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn folds_arabic_indic_digits() {
        assert_eq!(fold_arabic_digits("٠١٢٣٤٥٦٧٨٩"), "0123456789");
        assert_eq!(fold_arabic_digits("۰۱۲۳۴۵۶۷۸۹"), "0123456789");
        let normalized = normalize_text("السعر ٣٥٠٠٠٠٠");
        assert!(
            normalized.chars().filter(|c| c.is_ascii_digit()).count() == 7,
            "digits must become western: {normalized}"
        );
        assert!(!normalized.contains('٣'));
    }

    #[test]
    fn currency_tokens_become_egp() {
        for token in ["egp", "EGP", "le", "LE", "l.e", "جنيه"] {
            let normalized = normalize_text(&format!("price 5000000 {token} net"));
            assert!(
                normalized.contains("5000000 egp"),
                "{token} should normalize to egp, got {normalized}"
            );
        }
    }

    #[test]
    fn punctuation_runs_collapse_to_first() {
        assert_eq!(normalize_text("really??!"), "really?");
        assert_eq!(normalize_text("wait،،، what"), "wait، what");
        assert_eq!(normalize_text("done..."), "done.");
    }

    #[test]
    fn whitespace_collapses_but_lines_survive() {
        let normalized = normalize_text("line   one\n\n\n\nline\ttwo");
        assert_eq!(normalized, "line one\n\nline two");
    }

    #[test]
    fn digits_only_never_invents_zero() {
        assert_eq!(digits_only("+20 101-555-2222"), "201015552222");
        assert_eq!(digits_only("٣ غرف"), "3");
        assert_eq!(digits_only("unknown"), "");
    }
}
