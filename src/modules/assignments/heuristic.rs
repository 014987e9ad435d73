use std::sync::LazyLock;

use regex::Regex;

use super::models::{EvaluationResult, GradingMode, GradingParameters};

const MIN_KEYWORD_CHARS: usize = 4;
const STRUCTURE_MARKERS: [&str; 5] = [
    "introduction",
    "intro",
    "conclusion",
    "concluding",
    "in conclusion",
];

static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.?!]\s").expect("sentence break pattern is valid"));

/// Scores a submission when no model evaluation is available.
pub trait FallbackScorer: Send + Sync {
    fn score(&self, text: &str, params: &GradingParameters) -> EvaluationResult;
}

/// Keyword, length and structure heuristic. Pure function of its inputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicScorer;

impl FallbackScorer for HeuristicScorer {
    fn score(&self, text: &str, params: &GradingParameters) -> EvaluationResult {
        heuristic_evaluate(text, &params.title, params.min_words, params.mode)
    }
}

/// Component scores behind a heuristic evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeuristicBreakdown {
    pub word_count: usize,
    pub topic_score: f64,
    pub length_score: f64,
    pub structure_score: f64,
}

impl HeuristicBreakdown {
    pub fn measure(text: &str, title: &str, min_words: u32) -> Self {
        let word_count = text.split_whitespace().count();
        Self {
            word_count,
            topic_score: topic_score(text, title),
            length_score: length_score(word_count, min_words),
            structure_score: structure_score(text),
        }
    }
}

pub fn heuristic_evaluate(
    text: &str,
    title: &str,
    min_words: u32,
    mode: GradingMode,
) -> EvaluationResult {
    let breakdown = HeuristicBreakdown::measure(text, title, min_words);
    let words = breakdown.word_count as f64;
    let min = f64::from(min_words);

    let mut base = (0.5 * breakdown.topic_score
        + 0.3 * breakdown.length_score
        + 0.2 * breakdown.structure_score)
        * 100.0;

    match mode {
        GradingMode::Strict => {
            if breakdown.topic_score < 0.3 {
                base *= 0.5;
            }
            if words < min * 0.75 {
                base *= 0.7;
            }
        }
        GradingMode::Loose => {
            if words >= min * 0.5 {
                base += 5.0;
            }
            base = base.min(100.0);
        }
    }

    let score = base.clamp(0.0, 100.0).round() as i32;
    EvaluationResult::new(score, remarks_for(&breakdown, min_words))
}

fn topic_score(text: &str, title: &str) -> f64 {
    let title = title.to_lowercase().replace([',', '.'], "");
    let keywords: Vec<&str> = title.split(' ').filter(|k| !k.is_empty()).collect();
    let text = text.to_lowercase();

    let hits = keywords
        .iter()
        .filter(|k| k.chars().count() >= MIN_KEYWORD_CHARS && text.contains(**k))
        .count();

    (hits as f64 / keywords.len().max(1) as f64).min(1.0)
}

fn length_score(word_count: usize, min_words: u32) -> f64 {
    if word_count >= min_words as usize {
        1.0
    } else {
        word_count as f64 / f64::from(min_words.max(1))
    }
}

fn structure_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    if STRUCTURE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return 1.0;
    }

    let sentences = SENTENCE_BREAK
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .count();
    if sentences >= 3 { 0.7 } else { 0.0 }
}

fn remarks_for(breakdown: &HeuristicBreakdown, min_words: u32) -> String {
    let topic = if breakdown.topic_score > 0.6 {
        "On-topic".to_string()
    } else if breakdown.topic_score > 0.3 {
        "Some relevance".to_string()
    } else {
        "Off-topic".to_string()
    };

    let words = breakdown.word_count;
    let length = if words >= min_words as usize {
        format!("Met length ({words} words)")
    } else {
        format!("Too short ({words} words, expected {min_words})")
    };

    let structure = if breakdown.structure_score >= 0.9 {
        "Good structure".to_string()
    } else if breakdown.structure_score >= 0.6 {
        "Basic structure".to_string()
    } else {
        "Missing clear intro/conclusion".to_string()
    };

    [topic, length, structure].join("; ")
}
