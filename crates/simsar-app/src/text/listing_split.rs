use once_cell::sync::Lazy;
use regex::Regex;

/// Hard cap on segments produced by either the heuristic or the model
/// fallback.
pub const MAX_LISTING_SEGMENTS: usize = 10;

const MIN_BLOCK_CHARS: usize = 20;

/// Line-start keywords that open a new listing even without a bullet or
/// number marker.
static SEGMENT_KEYWORDS: &[&str] = &[
    "للبيع",
    "للايجار",
    "للإيجار",
    "for sale",
    "for rent",
    "شقة",
    "فيلا",
    "محل",
    "apartment",
    "villa",
    "studio",
    "duplex",
    "penthouse",
];

/// Area names counted by the multi-listing heuristic; bilingual, lowercase.
static AREA_KEYWORDS: &[&str] = &[
    "new cairo",
    "التجمع",
    "maadi",
    "المعادي",
    "sheikh zayed",
    "zayed",
    "الشيخ زايد",
    "october",
    "اكتوبر",
    "أكتوبر",
    "zamalek",
    "الزمالك",
    "heliopolis",
    "مصر الجديدة",
    "nasr city",
    "مدينة نصر",
    "sahel",
    "الساحل",
    "gouna",
    "الجونة",
    "sokhna",
    "السخنة",
    "compound",
    "كمبوند",
    "resort",
    "marina",
    "مارينا",
];

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*•●]|\d{1,2}\s*[\).:\-])\s*").unwrap());

static PRICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(?:,\d{3})+\b|\b\d{5,}\b").unwrap());

/// Verdict of the cheap deterministic multi-listing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    pub multi_listing: bool,
    pub segments: Vec<String>,
}

impl SplitOutcome {
    pub fn single() -> Self {
        Self {
            multi_listing: false,
            segments: Vec::new(),
        }
    }

    fn multi(segments: Vec<String>) -> Self {
        debug_assert!(segments.len() >= 2);
        Self {
            multi_listing: true,
            segments,
        }
    }
}

/// Deterministic first pass over normalized text: marker lines, price-like
/// numbers and area keywords decide whether one blob holds several listings.
pub fn heuristic_split_listings(text: &str) -> SplitOutcome {
    let non_blank: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if non_blank.len() < 2 && marker_count(text) < 2 {
        return SplitOutcome::single();
    }

    let price_hits = price_hits(text);
    let markers = marker_count(text);
    let segments = split_on_markers(text);

    if segments.len() >= 2 && (price_hits >= 2 || markers >= 2 || non_blank.len() >= 4) {
        return SplitOutcome::multi(cap_segments(segments));
    }

    if non_blank.len() >= 4 && price_hits >= 2 && area_hits(text) >= 2 {
        let blocks: Vec<String> = text
            .split("\n\n")
            .map(str::trim)
            .filter(|block| block.chars().count() >= MIN_BLOCK_CHARS)
            .map(|block| block.to_string())
            .collect();
        if blocks.len() >= 2 {
            return SplitOutcome::multi(cap_segments(blocks));
        }
    }

    SplitOutcome::single()
}

/// True when the heuristic came back single but the text still carries
/// multi-listing signals; callers may fall back to a model segmentation.
pub fn looks_ambiguous(text: &str) -> bool {
    let non_blank = text.lines().filter(|line| !line.trim().is_empty()).count();
    price_hits(text) >= 2 || (non_blank >= 4 && area_hits(text) >= 2)
}

/// Price-like numbers: comma-grouped amounts or bare runs of 5+ digits.
/// Long runs with phone prefixes are skipped so contact numbers do not
/// count as prices.
fn price_hits(text: &str) -> usize {
    PRICE_RE
        .find_iter(text)
        .filter(|hit| {
            let digits = hit.as_str().replace(',', "");
            let phone_like = digits.len() >= 10
                && (digits.starts_with("01") || digits.starts_with("20") || digits.starts_with("00"));
            !phone_like
        })
        .count()
}

fn marker_count(text: &str) -> usize {
    text.lines()
        .filter(|line| MARKER_RE.is_match(line))
        .count()
}

fn area_hits(text: &str) -> usize {
    let lowered = text.to_lowercase();
    AREA_KEYWORDS
        .iter()
        .map(|keyword| lowered.matches(keyword).count())
        .sum()
}

fn line_opens_segment(line: &str) -> bool {
    if MARKER_RE.is_match(line) {
        return true;
    }
    let lowered = line.trim().to_lowercase();
    SEGMENT_KEYWORDS
        .iter()
        .any(|keyword| lowered.starts_with(keyword))
}

fn split_on_markers(text: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if line_opens_segment(trimmed) && !current.is_empty() {
            segments.push(current.join("\n"));
            current.clear();
        }
        current.push(trimmed);
    }
    if !current.is_empty() {
        segments.push(current.join("\n"));
    }

    segments.retain(|segment| !segment.trim().is_empty());
    segments
}

fn cap_segments(mut segments: Vec<String>) -> Vec<String> {
    segments.truncate(MAX_LISTING_SEGMENTS);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_arabic_listings_split_in_two() {
        let text = "1) شقة للبيع 3500000 جنيه في التجمع\n2) شقة للبيع 4200000 جنيه في المعادي";
        let outcome = heuristic_split_listings(text);
        assert!(outcome.multi_listing);
        assert!(outcome.segments.len() >= 2, "{:?}", outcome.segments);
        assert!(outcome.segments[0].contains("3500000"));
        assert!(outcome.segments[1].contains("4200000"));
    }

    #[test]
    fn single_listing_stays_whole() {
        let text = "Apartment for sale in New Cairo price 5500000 EGP, 3 bedrooms";
        let outcome = heuristic_split_listings(text);
        assert!(!outcome.multi_listing);
        assert!(outcome.segments.is_empty());
    }

    #[test]
    fn blank_line_blocks_confirm_keyword_heavy_text() {
        let text = "villa in sheikh zayed going for 12000000 direct from owner\nfinished and ready\n\napartment in new cairo asking 6500000 with garden\nground floor with private entrance";
        let outcome = heuristic_split_listings(text);
        assert!(outcome.multi_listing, "{outcome:?}");
        assert_eq!(outcome.segments.len(), 2);
    }

    #[test]
    fn segment_output_is_capped() {
        let text = (1..=14)
            .map(|idx| format!("{idx}) flat number {idx} price {}000000 in maadi", idx))
            .collect::<Vec<_>>()
            .join("\n");
        let outcome = heuristic_split_listings(&text);
        assert!(outcome.multi_listing);
        assert_eq!(outcome.segments.len(), MAX_LISTING_SEGMENTS);
    }

    #[test]
    fn ambiguity_flags_price_pairs() {
        assert!(looks_ambiguous("first flat 3500000\nsecond flat 4200000"));
        assert!(!looks_ambiguous("nice flat with a view"));
    }
}
