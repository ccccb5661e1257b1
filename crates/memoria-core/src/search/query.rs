//! Query expansion and intent classification.

use std::collections::HashMap;

const MAX_FUZZY_DISTANCE: usize = 2;

/// Dynamic-programming edit distance, early-exiting when the length gap
/// alone exceeds the max distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());
    if m.abs_diff(n) > MAX_FUZZY_DISTANCE {
        return MAX_FUZZY_DISTANCE + 1;
    }

    let mut dp = vec![vec![0usize; n + 1]; m + 1];
    for (i, row) in dp.iter_mut().enumerate().take(m + 1) {
        row[0] = i;
    }
    for (j, val) in dp[0].iter_mut().enumerate().take(n + 1) {
        *val = j;
    }
    for i in 1..=m {
        for j in 1..=n {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            dp[i][j] = (dp[i - 1][j] + 1).min(dp[i][j - 1] + 1).min(dp[i - 1][j - 1] + cost);
        }
    }
    dp[m][n]
}

pub fn is_fuzzy_match(a: &str, b: &str, max_distance: usize) -> bool {
    if a.len().abs_diff(b.len()) > MAX_FUZZY_DISTANCE {
        return false;
    }
    levenshtein(a, b) <= max_distance
}

/// Stop-words that must never be treated as acronym candidates (e.g. "not"
/// must not fuzzy-match "HOT").
const ACRONYM_STOPWORDS: &[&str] = &["not", "and", "for", "the", "but", "you", "are", "was"];

/// Fixed acronym map (30+ entries), terms uppercase-normalized for lookup.
fn acronym_map() -> HashMap<&'static str, &'static [&'static str]> {
    HashMap::from([
        ("RRF", ["Reciprocal Rank Fusion", "rank fusion"].as_slice()),
        ("BM25", ["Best Matching 25", "lexical ranking"].as_slice()),
        ("FTS", ["Full Text Search"].as_slice()),
        ("MMR", ["Maximal Marginal Relevance"].as_slice()),
        ("CE", ["Cross Encoder"].as_slice()),
        ("API", ["Application Programming Interface"].as_slice()),
        ("CLI", ["Command Line Interface"].as_slice()),
        ("DB", ["Database"].as_slice()),
        ("SQL", ["Structured Query Language"].as_slice()),
        ("JSON", ["JavaScript Object Notation"].as_slice()),
        ("JWT", ["JSON Web Token"].as_slice()),
        ("TTL", ["Time To Live"].as_slice()),
        ("LRU", ["Least Recently Used"].as_slice()),
        ("WAL", ["Write Ahead Log"].as_slice()),
        ("ORM", ["Object Relational Mapping"].as_slice()),
        ("HTTP", ["Hypertext Transfer Protocol"].as_slice()),
        ("URL", ["Uniform Resource Locator"].as_slice()),
        ("UUID", ["Universally Unique Identifier"].as_slice()),
        ("MCP", ["Model Context Protocol"].as_slice()),
        ("AST", ["Abstract Syntax Tree"].as_slice()),
        ("CI", ["Continuous Integration"].as_slice()),
        ("CD", ["Continuous Deployment"].as_slice()),
        ("CRUD", ["Create Read Update Delete"].as_slice()),
        ("IDF", ["Inverse Document Frequency"].as_slice()),
        ("TF", ["Term Frequency"].as_slice()),
        ("ANN", ["Approximate Nearest Neighbor"].as_slice()),
        ("KNN", ["K Nearest Neighbor"].as_slice()),
        ("PR", ["Pull Request"].as_slice()),
        ("PK", ["Primary Key"].as_slice()),
        ("FK", ["Foreign Key"].as_slice()),
        ("OOM", ["Out Of Memory"].as_slice()),
        ("RPC", ["Remote Procedure Call"].as_slice()),
    ])
}

/// Small fixed typo-correction dictionary applied before expansion.
fn typo_map() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("serch", "search"),
        ("teh", "the"),
        ("recieve", "receive"),
        ("occured", "occurred"),
        ("seperate", "separate"),
        ("definately", "definitely"),
        ("langauge", "language"),
        ("functino", "function"),
        ("implmentation", "implementation"),
        ("databse", "database"),
    ])
}

#[derive(Debug, Clone)]
pub struct AcronymHit {
    pub term: String,
    pub expansions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExpandedQuery {
    pub expanded: String,
    pub corrections: Vec<(String, String)>,
    pub acronyms_found: Vec<AcronymHit>,
}

/// Typo correction + acronym expansion. Opt-out is the caller's
/// responsibility (skip calling this and use the raw query instead).
pub fn expand_query_with_fuzzy(query: &str) -> ExpandedQuery {
    let acronyms = acronym_map();
    let typos = typo_map();
    let stopwords: std::collections::HashSet<&str> = ACRONYM_STOPWORDS.iter().copied().collect();

    let mut corrections = Vec::new();
    let mut acronyms_found = Vec::new();
    let mut appended = Vec::new();

    let words: Vec<&str> = query.split_whitespace().collect();
    let mut corrected_words = Vec::with_capacity(words.len());

    for word in &words {
        let lower = word.to_lowercase();
        if let Some(fixed) = typos.get(lower.as_str()) {
            corrections.push((word.to_string(), fixed.to_string()));
            corrected_words.push(fixed.to_string());
        } else {
            corrected_words.push(word.to_string());
        }
    }

    for word in &corrected_words {
        let bare: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if bare.is_empty() || stopwords.contains(bare.to_lowercase().as_str()) {
            continue;
        }
        let upper = bare.to_uppercase();

        if bare.len() >= 3 {
            if let Some(expansions) = acronyms.get(upper.as_str()) {
                let list: Vec<String> = expansions.iter().map(|s| s.to_string()).collect();
                appended.extend(list.clone());
                acronyms_found.push(AcronymHit { term: upper.clone(), expansions: list });
                continue;
            }
        }

        if bare.len() >= 3 {
            for (&key, expansions) in acronyms.iter() {
                let length_ok = if key.len() <= 4 { key.len() == upper.len() } else { true };
                if length_ok && is_fuzzy_match(key, &upper, 1) {
                    let list: Vec<String> = expansions.iter().map(|s| s.to_string()).collect();
                    appended.extend(list.clone());
                    acronyms_found.push(AcronymHit { term: key.to_string(), expansions: list });
                    break;
                }
            }
        }

        if bare.len() >= 4 {
            let lower = bare.to_lowercase();
            for expansions in acronyms.values() {
                for token in expansions.iter().flat_map(|e| e.split_whitespace()) {
                    if token.len() >= 4 && is_fuzzy_match(&lower, &token.to_lowercase(), 1) {
                        appended.push(token.to_string());
                    }
                }
            }
        }
    }

    let mut expanded = corrected_words.join(" ");
    if !appended.is_empty() {
        appended.sort();
        appended.dedup();
        expanded = format!("{expanded} {}", appended.join(" "));
    }

    ExpandedQuery { expanded, corrections, acronyms_found }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    AddFeature,
    FixBug,
    Refactor,
    SecurityAudit,
    Understand,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::AddFeature => "add_feature",
            Intent::FixBug => "fix_bug",
            Intent::Refactor => "refactor",
            Intent::SecurityAudit => "security_audit",
            Intent::Understand => "understand",
        }
    }
}

struct IntentRule {
    intent: Intent,
    primary: &'static [&'static str],
    secondary: &'static [&'static str],
    patterns: &'static [&'static str],
}

const INTENT_RULES: &[IntentRule] = &[
    IntentRule {
        intent: Intent::FixBug,
        primary: &["fix", "bug", "crash", "broken", "error"],
        secondary: &["issue", "fail", "wrong", "unexpected"],
        patterns: &["fix .* bug", "crash after", "fails? (to|with)"],
    },
    IntentRule {
        intent: Intent::AddFeature,
        primary: &["add", "implement", "create", "new feature"],
        secondary: &["support", "introduce", "build"],
        patterns: &["add (a |an )?.* (feature|support)", "implement .*"],
    },
    IntentRule {
        intent: Intent::Refactor,
        primary: &["refactor", "cleanup", "simplify", "restructure"],
        secondary: &["rename", "extract", "reorganize"],
        patterns: &["refactor .*", "clean ?up .*"],
    },
    IntentRule {
        intent: Intent::SecurityAudit,
        primary: &["security", "vulnerability", "exploit", "audit"],
        secondary: &["injection", "auth", "permission", "cve"],
        patterns: &["security (audit|review)", "(sql|command) injection"],
    },
];

const INTENT_THRESHOLD: f32 = 0.25;

#[derive(Debug, Clone)]
pub struct IntentClassification {
    pub intent: Intent,
    pub confidence: f32,
    pub scores: HashMap<&'static str, f32>,
    pub fallback: bool,
}

fn keyword_score(text: &str, rule: &IntentRule) -> f32 {
    let lower = text.to_lowercase();
    let primary_hits = rule.primary.iter().filter(|kw| lower.contains(*kw)).count() as f32;
    let secondary_hits = rule.secondary.iter().filter(|kw| lower.contains(*kw)).count() as f32;
    let raw = primary_hits * 1.0 + secondary_hits * 0.5;
    let max_possible = rule.primary.len() as f32 * 1.0 + rule.secondary.len() as f32 * 0.5;
    if max_possible == 0.0 {
        0.0
    } else {
        (raw / max_possible).min(1.0)
    }
}

fn pattern_score(text: &str, rule: &IntentRule) -> f32 {
    let lower = text.to_lowercase();
    let matches = rule
        .patterns
        .iter()
        .filter(|p| regex_lite_contains(&lower, p))
        .count() as f32;
    (matches / rule.patterns.len() as f32).min(1.0)
}

/// Minimal `.`/`?` regex-ish matcher avoiding a dependency the rest of the
/// corpus doesn't otherwise need for this one call site: supports literal
/// substrings with `.*` wildcards and optional `?` groups, which is all the
/// fixed pattern table above uses.
fn regex_lite_contains(text: &str, pattern: &str) -> bool {
    let pattern = pattern.replace("(a |an )?", "").replace("?", "");
    let parts: Vec<&str> = pattern.split(".*").collect();
    let mut cursor = 0;
    for (i, part) in parts.iter().enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match text[cursor..].find(part) {
            Some(pos) => cursor += pos + part.len(),
            None => {
                if i == 0 {
                    return text.contains(part);
                }
                return false;
            }
        }
    }
    true
}

/// Classify query intent: `0.6*keyword + 0.4*pattern`, falling back
/// to `understand` below threshold 0.25.
pub fn classify_intent(text: &str) -> IntentClassification {
    let mut scores: HashMap<&'static str, f32> = HashMap::new();
    let mut best: Option<(Intent, f32)> = None;

    for rule in INTENT_RULES {
        let k = keyword_score(text, rule);
        let p = pattern_score(text, rule);
        let blended = 0.6 * k + 0.4 * p;
        scores.insert(rule.intent.as_str(), blended);
        if best.map(|(_, s)| blended > s).unwrap_or(true) {
            best = Some((rule.intent, blended));
        }
    }

    match best {
        Some((intent, confidence)) if confidence >= INTENT_THRESHOLD => {
            IntentClassification { intent, confidence, scores, fallback: false }
        }
        Some((_, confidence)) => IntentClassification {
            intent: Intent::Understand,
            confidence,
            scores,
            fallback: true,
        },
        None => IntentClassification {
            intent: Intent::Understand,
            confidence: 0.0,
            scores,
            fallback: true,
        },
    }
}

/// Fixed per-intent weight overrides, applied on top of the default
/// smart-ranking weights. Overrides replace the matching weight
/// rather than blend with it.
pub fn intent_weight_overrides(intent: Intent) -> crate::search::fusion::SmartRankingWeights {
    use crate::search::fusion::SmartRankingWeights;
    match intent {
        Intent::FixBug => SmartRankingWeights { similarity: 0.6, recency: 0.3, popularity: 0.1 },
        Intent::AddFeature => SmartRankingWeights { similarity: 0.5, recency: 0.2, popularity: 0.3 },
        Intent::Refactor => SmartRankingWeights { similarity: 0.55, recency: 0.15, popularity: 0.3 },
        Intent::SecurityAudit => SmartRankingWeights { similarity: 0.7, recency: 0.1, popularity: 0.2 },
        Intent::Understand => SmartRankingWeights::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_properties() {
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("kitten", "sitting"), levenshtein("sitting", "kitten"));
        assert!(levenshtein("a", "abcdefgh") > MAX_FUZZY_DISTANCE);
    }

    #[test]
    fn length_gap_disqualifies_fuzzy_match() {
        assert!(!is_fuzzy_match("cat", "category", 2));
    }

    #[test]
    fn typo_and_acronym_expansion_scenario() {
        let result = expand_query_with_fuzzy("RRF serch implementation");
        assert!(result.expanded.contains("Reciprocal Rank Fusion"));
        assert!(result.expanded.contains("rank fusion"));
        assert!(result.acronyms_found.iter().any(|a| a.term == "RRF"));
        assert!(result.expanded.contains("search"));
    }

    #[test]
    fn stopword_blocks_false_acronym_hit() {
        let result = expand_query_with_fuzzy("not a real issue");
        assert!(!result.acronyms_found.iter().any(|a| a.term == "HOT"));
    }

    #[test]
    fn classify_intent_fix_bug_scenario() {
        let result = classify_intent("fix login crash after update");
        assert_eq!(result.intent, Intent::FixBug);
        assert!(result.confidence >= 0.25);
        assert!(!result.fallback);
    }

    #[test]
    fn classify_intent_falls_back_below_threshold() {
        let result = classify_intent("the weather today");
        assert!(result.fallback);
        assert_eq!(result.intent, Intent::Understand);
    }
}
