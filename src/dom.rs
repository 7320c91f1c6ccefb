//! Pure matching logic behind the tuning algorithm. Kept free of any
//! browser I/O so the priority/tie-break rules can be unit tested against
//! static DOM fixtures without a live browser.
//!
//! `BrowserControl::evaluate` is the only place real DOM access happens; it
//! returns the typed rows below from a single script round-trip, and
//! `Tuner::tune` feeds them through these pure functions.

use regex::Regex;

const STOP_WORDS: &[&str] = &[
    "the", "fox", "nbc", "cbs", "abc", "cnn", "hbo", "tbs", "tnt", "usa", "amc", "bet",
];

/// One row the browser's guide page marks as a channel entry.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct GuideEntry {
    pub accessible_name: String,
    pub is_guide_row: bool,
}

/// A row inside a generic program-listing dialog, used by the play-control
/// search's fourth strategy.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ProgramRow {
    pub text: String,
}

/// What the play-control search can observe about one clickable candidate,
/// in priority order of detection strategy.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct PlayControlCandidate {
    pub accessible_name: String,
    pub has_svg_play_glyph: bool,
    pub is_on_now_row: bool,
    pub legacy_inline_style_marker: bool,
}

fn word_boundary_match(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let pattern = format!(r"(?i)\b{}\b", regex::escape(needle));
    Regex::new(&pattern)
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    !needle.is_empty() && haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Channel number forms to search for, in priority order: zero-padded first,
/// then the raw form, but only when the raw form is long/large enough not
/// to collide with digits embedded in unrelated display names (3+ digits,
/// or numerically >= 100).
fn number_search_forms(number: &str) -> Vec<String> {
    let mut forms = Vec::new();
    let padded = if number.len() < 2 {
        format!("{:0>2}", number)
    } else {
        number.to_string()
    };
    forms.push(padded.clone());

    let raw_allowed = number.len() >= 3 || number.parse::<u32>().map(|n| n >= 100).unwrap_or(false);
    if raw_allowed && number != padded {
        forms.push(number.to_string());
    }
    forms
}

/// Searches guide entries for a match to `channel`, in priority order:
/// (a) each match_term as a case-insensitive substring of a guide row's
///     accessible name; (b) the channel number with word boundaries
///     (zero-padded, then raw if long/large enough); (c) the display name as
///     a suffix or whole word; (d) the display name's first word, if its
///     length is >= 3 and it isn't a common network name, only when
///     `include_first_word` is set (retries after scrolling are restricted
///     to priorities a-c).
///
/// Within a priority, the first matching entry in document order wins.
pub fn find_guide_match(
    entries: &[GuideEntry],
    match_terms: &[String],
    number: &str,
    display_name: &str,
    include_first_word: bool,
) -> Option<usize> {
    let rows: Vec<(usize, &GuideEntry)> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_guide_row)
        .collect();

    // (a) match terms, each checked in order, first entry in document order
    // wins within a given term.
    for term in match_terms {
        if let Some((idx, _)) = rows
            .iter()
            .find(|(_, e)| contains_ci(&e.accessible_name, term))
        {
            return Some(*idx);
        }
    }

    // (b) channel number, zero-padded then raw, word-boundary match.
    for form in number_search_forms(number) {
        if let Some((idx, _)) = rows
            .iter()
            .find(|(_, e)| word_boundary_match(&e.accessible_name, &form))
        {
            return Some(*idx);
        }
    }

    // (c) display name as suffix or whole word.
    if let Some((idx, _)) = rows.iter().find(|(_, e)| {
        e.accessible_name
            .to_lowercase()
            .ends_with(&display_name.to_lowercase())
            || word_boundary_match(&e.accessible_name, display_name)
    }) {
        return Some(*idx);
    }

    // (d) first word of display name, gated by length and stop-list.
    if include_first_word {
        if let Some(first_word) = display_name.split_whitespace().next() {
            if first_word.len() >= 3 && !STOP_WORDS.contains(&first_word.to_lowercase().as_str()) {
                if let Some((idx, _)) = rows
                    .iter()
                    .find(|(_, e)| word_boundary_match(&e.accessible_name, first_word))
                {
                    return Some(*idx);
                }
            }
        }
    }

    None
}

/// Scans visible page text for a "no upcoming airings" notice.
pub fn has_no_airings_notice(visible_text: &[String]) -> bool {
    visible_text
        .iter()
        .any(|t| contains_ci(t, "no upcoming airings"))
}

const PLAY_NAME_TERMS: &[&str] = &["play", "watch", "tune"];
const TIME_PATTERN: &str = r"\b\d{1,2}:\d{2}\b";

/// Locates a play control among `candidates` (document order), trying each
/// strategy in turn: accessible name containing a play/watch/tune term; an
/// SVG play glyph inside a clickable ancestor; an "On Now" row; a generic
/// dialog's first program row whose text matches `HH:MM`; a legacy
/// inline-style marker.
pub fn find_play_control(
    candidates: &[PlayControlCandidate],
    program_rows: &[ProgramRow],
) -> Option<PlayControlLocation> {
    if let Some(idx) = candidates.iter().position(|c| {
        PLAY_NAME_TERMS
            .iter()
            .any(|term| contains_ci(&c.accessible_name, term))
    }) {
        return Some(PlayControlLocation::Candidate(idx));
    }

    if let Some(idx) = candidates.iter().position(|c| c.has_svg_play_glyph) {
        return Some(PlayControlLocation::Candidate(idx));
    }

    if let Some(idx) = candidates.iter().position(|c| c.is_on_now_row) {
        return Some(PlayControlLocation::Candidate(idx));
    }

    let time_re = Regex::new(TIME_PATTERN).unwrap();
    if let Some(idx) = program_rows.iter().position(|r| time_re.is_match(&r.text)) {
        return Some(PlayControlLocation::ProgramRow(idx));
    }

    if let Some(idx) = candidates
        .iter()
        .position(|c| c.legacy_inline_style_marker)
    {
        return Some(PlayControlLocation::Candidate(idx));
    }

    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayControlLocation {
    Candidate(usize),
    ProgramRow(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str) -> GuideEntry {
        GuideEntry {
            accessible_name: name.to_string(),
            is_guide_row: true,
        }
    }

    #[test]
    fn match_term_wins_over_later_priorities() {
        let entries = vec![row("Some Other Channel"), row("NBC East HD")];
        let idx = find_guide_match(&entries, &["NBC".to_string()], "04", "NBC East", true);
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn tie_break_is_document_order_within_a_priority() {
        let entries = vec![row("ESPN Channel"), row("ESPN 2")];
        let idx = find_guide_match(&entries, &["ESPN".to_string()], "070", "ESPN", true);
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn zero_padded_number_matches_but_raw_short_number_does_not_collide() {
        // channel number "05": only the zero-padded " 05 " is accepted,
        // raw " 5 " must not match "SHOWTIME 2" or similar.
        let entries = vec![row("SHOWTIME 2"), row("Local Channel 05")];
        let idx = find_guide_match(&entries, &[], "05", "Local Channel", true);
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn short_raw_number_is_not_searched_standalone() {
        let entries = vec![row("SHOWTIME 5")];
        // number "5" has < 3 digits and is < 100, so the raw form is never
        // tried, only its zero-padded form "05" is, which doesn't appear.
        let idx = find_guide_match(&entries, &[], "5", "Five", true);
        assert_eq!(idx, None);
    }

    #[test]
    fn long_raw_number_is_searched() {
        let entries = vec![row("Channel 702 HD")];
        let idx = find_guide_match(&entries, &[], "702", "Random Name", true);
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn display_name_suffix_matches() {
        let entries = vec![row("WNBC NBC East")];
        let idx = find_guide_match(&entries, &[], "999", "NBC East", true);
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn first_word_respects_stop_list_and_min_length() {
        let entries = vec![row("Fox Sports 1")];
        // "Fox" is first word of "Fox Network" but is stop-listed, and the
        // full display name never appears in the entry, so priority (c)
        // doesn't fire either.
        let idx = find_guide_match(&entries, &[], "999", "Fox Network", true);
        assert_eq!(idx, None);
    }

    #[test]
    fn first_word_only_tried_when_included() {
        let entries = vec![row("Bravo HD")];
        let without = find_guide_match(&entries, &[], "999", "Bravo East", false);
        let with = find_guide_match(&entries, &[], "999", "Bravo East", true);
        assert_eq!(without, None);
        assert_eq!(with, Some(0));
    }

    #[test]
    fn no_airings_notice_detected_case_insensitively() {
        let text = vec!["Schedule".to_string(), "No Upcoming Airings".to_string()];
        assert!(has_no_airings_notice(&text));
        assert!(!has_no_airings_notice(&["Schedule".to_string()]));
    }

    #[test]
    fn play_control_prefers_accessible_name_then_glyph_then_on_now() {
        let candidates = vec![
            PlayControlCandidate {
                has_svg_play_glyph: true,
                ..Default::default()
            },
            PlayControlCandidate {
                accessible_name: "Watch now".to_string(),
                ..Default::default()
            },
        ];
        let found = find_play_control(&candidates, &[]);
        assert_eq!(found, Some(PlayControlLocation::Candidate(1)));
    }

    #[test]
    fn play_control_falls_back_to_program_row_time_pattern() {
        let rows = vec![
            ProgramRow {
                text: "Upcoming show".to_string(),
            },
            ProgramRow {
                text: "8:00 Evening News".to_string(),
            },
        ];
        let found = find_play_control(&[], &rows);
        assert_eq!(found, Some(PlayControlLocation::ProgramRow(1)));
    }
}
