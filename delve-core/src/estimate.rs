//! Up-front complexity, duration, and cost estimates for a research query.
//!
//! The estimate is a keyword heuristic and is advisory only. It never affects how a
//! task is executed.

use serde::{Deserialize, Serialize};

const COMPLEX_KEYWORDS: &[&str] = &[
    "comprehensive",
    "detailed",
    "in-depth",
    "thorough",
    "extensive",
    "analysis",
    "compare",
    "contrast",
    "evaluate",
    "synthesize",
    "implications",
    "geopolitical",
    "historical",
    "trends",
    "forecast",
];

const MULTI_DOMAIN_INDICATORS: &[&str] = &[
    "and",
    "vs",
    "versus",
    "between",
    "across",
    "multiple",
    "different",
    "various",
    "compare",
    "relation",
];

const TEMPORAL_INDICATORS: &[&str] = &[
    "history",
    "evolution",
    "timeline",
    "past",
    "future",
    "trends",
    "forecast",
    "prediction",
    "development",
    "changes",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// A `(min, likely, max)` range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub likely: f64,
    pub max: f64,
}

impl Range {
    const fn new(min: f64, likely: f64, max: f64) -> Self {
        Self { min, likely, max }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub complexity: Complexity,
    pub score: u32,
    pub minutes: Range,
    pub usd: Range,
    /// Whether the task will probably outlast the synchronous wait.
    pub will_likely_go_async: bool,
    pub recommendation: String,
}

#[derive(Debug, Clone, Default)]
pub struct CostEstimator;

impl CostEstimator {
    pub fn new() -> Self {
        Self
    }

    pub fn estimate(&self, query: &str) -> CostEstimate {
        let score = complexity_score(query);
        let complexity = match score {
            s if s >= 8 => Complexity::Complex,
            s if s >= 4 => Complexity::Medium,
            _ => Complexity::Simple,
        };
        let (minutes, usd) = match complexity {
            Complexity::Simple => (Range::new(0.5, 1.0, 3.0), Range::new(0.10, 0.25, 0.50)),
            Complexity::Medium => (Range::new(3.0, 8.0, 20.0), Range::new(0.50, 1.00, 2.00)),
            Complexity::Complex => (Range::new(15.0, 35.0, 60.0), Range::new(1.50, 3.00, 6.00)),
        };
        CostEstimate {
            complexity,
            score,
            minutes,
            usd,
            will_likely_go_async: minutes.likely > 1.0,
            recommendation: recommendation(complexity, query),
        }
    }
}

fn words(query: &str) -> Vec<String> {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn count_hits(words: &[String], list: &[&str], cap: u32) -> u32 {
    let hits = list
        .iter()
        .filter(|kw| words.iter().any(|w| w == *kw))
        .count();
    (hits as u32).min(cap)
}

fn complexity_score(query: &str) -> u32 {
    let tokens = words(query);
    let mut score = match query.split_whitespace().count() {
        n if n > 50 => 3,
        n if n > 25 => 2,
        n if n > 10 => 1,
        _ => 0,
    };

    score += count_hits(&tokens, COMPLEX_KEYWORDS, 4);
    score += count_hits(&tokens, MULTI_DOMAIN_INDICATORS, 3);
    score += count_hits(&tokens, TEMPORAL_INDICATORS, 2);

    score += match query.matches('?').count() {
        n if n > 2 => 2,
        2 => 1,
        _ => 0,
    };

    // Capitalized words mid-sentence hint at named entities.
    let raw: Vec<&str> = query.split_whitespace().collect();
    let proper_nouns = raw
        .windows(2)
        .filter(|pair| {
            let prev_ends_sentence = pair[0].ends_with(['.', '?', '!']);
            let starts_upper = pair[1].chars().next().is_some_and(char::is_uppercase);
            starts_upper && !prev_ends_sentence
        })
        .count() as u32;
    score += (proper_nouns / 2).min(2);

    score
}

fn recommendation(complexity: Complexity, query: &str) -> String {
    let mut text = match complexity {
        Complexity::Simple => "Simple query. Should finish within a couple of minutes \
             without leaving synchronous mode."
            .to_string(),
        Complexity::Medium => "Medium complexity query. May take 5-15 minutes and move to \
             the background if it outlasts the synchronous wait. \
             Consider enabling notifications."
            .to_string(),
        Complexity::Complex => "Complex multi-domain query. Will likely run 30+ minutes in \
             the background. Consider splitting it into narrower questions, \
             or enable notifications for the completion alert."
            .to_string(),
    };

    let tokens = words(query);
    let has = |w: &str| tokens.iter().any(|t| t == w);
    if has("compare") || has("vs") {
        text.push_str(" Comparative analysis usually needs extensive source gathering.");
    }
    if has("geopolitical") || has("international") || has("global") {
        text.push_str(" Geopolitical topics span many perspectives and may take longer.");
    }
    if query.split_whitespace().count() > 100 {
        text.push_str(" Very long query; consider focusing on the key aspects.");
    }
    text
}
