//! Structural metadata extraction from plain text.
//!
//! Extraction never blocks content creation: [`MetadataExtractor::extract`]
//! logs any internal failure and returns [`NuggetMetadata::fallback`].

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use lorepath_shared::{
    LorepathError, MAX_DIFFICULTY, MIN_DIFFICULTY, NuggetMetadata, ProcessorConfig, Result,
};

/// Words that start sentences or titles without naming a concept.
const STOPWORDS: &[&str] = &[
    "A", "An", "And", "As", "At", "But", "By", "For", "From", "How", "If", "In", "Into", "Is",
    "It", "Its", "Of", "On", "Or", "So", "That", "The", "Then", "These", "This", "Those", "To",
    "We", "What", "When", "Where", "Which", "While", "Why", "With", "You", "Your",
];

/// Words at least this long count as uncommon vocabulary.
const RARE_WORD_LEN: usize = 9;

/// Pulls topics, difficulty, prerequisites and study time out of text.
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    config: ProcessorConfig,
}

impl MetadataExtractor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    /// Extract metadata, degrading to the fallback record on any failure.
    ///
    /// `known_topics` are topics already extracted from the organization's
    /// earlier content, in the order they were first seen.
    pub fn extract(&self, text: &str, known_topics: &[String]) -> NuggetMetadata {
        match self.try_extract(text, known_topics) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "metadata extraction failed, using fallback");
                NuggetMetadata::fallback()
            }
        }
    }

    /// Extract metadata, surfacing internal failures.
    pub fn try_extract(&self, text: &str, known_topics: &[String]) -> Result<NuggetMetadata> {
        if self.config.reading_rate_wpm == 0 {
            return Err(LorepathError::config("reading rate must be positive"));
        }

        let word_count = text.split_whitespace().count();
        if word_count == 0 {
            return Ok(NuggetMetadata::fallback());
        }

        let ranked = ranked_phrases(text);
        let topics: Vec<String> = ranked.iter().take(self.config.max_topics).cloned().collect();
        let related_concepts: Vec<String> = ranked
            .iter()
            .skip(self.config.max_topics)
            .take(self.config.max_topics)
            .cloned()
            .collect();

        let prerequisites = infer_prerequisites(text, &topics, known_topics)
            .into_iter()
            .take(self.config.max_prerequisites)
            .collect();

        let meta = NuggetMetadata {
            topics,
            difficulty: score_difficulty(text),
            prerequisites,
            estimated_minutes: estimate_minutes(word_count, self.config.reading_rate_wpm),
            related_concepts,
        };
        meta.validate()?;

        debug!(
            topics = meta.topics.len(),
            difficulty = meta.difficulty,
            minutes = meta.estimated_minutes,
            "metadata extracted"
        );
        Ok(meta)
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Capitalized phrases ranked by frequency times phrase length.
///
/// Multi-word phrases are preferred; single capitalized words are used only
/// when no phrase appears, and then only if they occur at least twice.
fn ranked_phrases(text: &str) -> Vec<String> {
    static PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b[A-Z][A-Za-z0-9]*(?:[ \t]+[A-Z][A-Za-z0-9]*)+\b").expect("valid regex")
    });
    static WORD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b[A-Z][a-z][A-Za-z0-9]+\b").expect("valid regex"));

    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (order, m) in PHRASE_RE.find_iter(text).enumerate() {
        let Some(phrase) = strip_leading_stopwords(m.as_str()) else {
            continue;
        };
        counts.entry(phrase).or_insert((0, order)).0 += 1;
    }

    let multi_word: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(phrase, (count, first))| {
            let weight = count * phrase.split_whitespace().count();
            (phrase, weight, first)
        })
        .collect();

    let mut ranked = if multi_word.is_empty() {
        let mut singles: HashMap<String, (usize, usize)> = HashMap::new();
        for (order, m) in WORD_RE.find_iter(text).enumerate() {
            if STOPWORDS.contains(&m.as_str()) {
                continue;
            }
            singles.entry(m.as_str().to_string()).or_insert((0, order)).0 += 1;
        }
        singles
            .into_iter()
            .filter(|(_, (count, _))| *count >= 2)
            .map(|(word, (count, first))| (word, count, first))
            .collect()
    } else {
        multi_word
    };

    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().map(|(phrase, _, _)| phrase).collect()
}

/// Drop sentence-initial filler ("The Fourier Transform" -> "Fourier Transform").
/// Returns `None` when fewer than two words remain.
fn strip_leading_stopwords(phrase: &str) -> Option<String> {
    let words: Vec<&str> = phrase
        .split_whitespace()
        .skip_while(|w| STOPWORDS.contains(w))
        .collect();
    (words.len() >= 2).then(|| words.join(" "))
}

// ---------------------------------------------------------------------------
// Prerequisites
// ---------------------------------------------------------------------------

/// Known topics mentioned in `text` that are not among its own topics.
fn infer_prerequisites(text: &str, own_topics: &[String], known_topics: &[String]) -> Vec<String> {
    let lower = text.to_lowercase();
    let own: Vec<String> = own_topics.iter().map(|t| t.to_lowercase()).collect();

    let mut found: Vec<(usize, String)> = Vec::new();
    for topic in known_topics {
        let needle = topic.to_lowercase();
        if needle.is_empty() || own.contains(&needle) {
            continue;
        }
        if found.iter().any(|(_, t)| t.eq_ignore_ascii_case(topic)) {
            continue;
        }
        if let Some(pos) = find_word(&lower, &needle) {
            found.push((pos, topic.clone()));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, topic)| topic).collect()
}

/// Byte offset of `needle` in `haystack` on word boundaries.
fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    let pattern = format!(r"\b{}\b", regex::escape(needle));
    Regex::new(&pattern).ok()?.find(haystack).map(|m| m.start())
}

// ---------------------------------------------------------------------------
// Difficulty and time
// ---------------------------------------------------------------------------

/// Score difficulty in `1..=10`.
///
/// Components: average sentence length (up to 3), share of long words (up
/// to 3), headings and formulas (up to 2) and overall length (up to 2).
/// Every component is non-decreasing in its input.
fn score_difficulty(text: &str) -> u8 {
    static SENTENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[.!?]+(\s|$)").expect("valid regex"));
    static HEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+\S").expect("valid regex"));
    static FORMULA_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$[^$\n]+\$|\b\w+\s*[=<>]\s*[\w(]|[∑∫√≤≥±^]").expect("valid regex")
    });

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return MIN_DIFFICULTY;
    }
    let word_count = words.len() as f64;

    let sentences = SENTENCE_RE.find_iter(text).count().max(1) as f64;
    let avg_sentence = word_count / sentences;
    let sentence_score = ((avg_sentence - 8.0) / 6.0).clamp(0.0, 3.0);

    let rare = words
        .iter()
        .filter(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).chars().count() >= RARE_WORD_LEN)
        .count() as f64;
    let rarity_score = (rare / word_count * 15.0).clamp(0.0, 3.0);

    let markers = HEADING_RE.find_iter(text).count() + FORMULA_RE.find_iter(text).count();
    let structure_score = (markers as f64 * 0.25).clamp(0.0, 2.0);

    let length_score = (word_count / 100.0).log2().clamp(0.0, 2.0);

    let raw = 1.0 + sentence_score + rarity_score + structure_score + length_score;
    (raw.round() as u8).clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

/// Whole minutes at `wpm`, rounded up, at least one.
fn estimate_minutes(word_count: usize, wpm: u32) -> u32 {
    let wpm = wpm.max(1) as usize;
    word_count.div_ceil(wpm).max(1) as u32
}
