//! Query analysis for retrieval weighting.
//!
//! Queries carrying specific terms (numerals, proper-noun-like capitalized
//! runs, interrogatives) lean on lexical matching; open-ended ones lean on
//! semantic similarity. The analyzer also classifies the question type by a
//! fixed priority so callers can shape the answer prompt.

use crate::retrieve::Weights;

const INTERROGATIVES: [&str; 6] = ["what", "when", "where", "who", "how", "why"];
const FACTUAL: [&str; 4] = ["what", "when", "where", "who"];
const EXPLANATORY: [&str; 3] = ["how", "why", "explain"];
const COMPARATIVE: [&str; 3] = ["compare", "difference", "similar"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Factual,
    Explanatory,
    Comparative,
    General,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Factual => "factual",
            QueryType::Explanatory => "explanatory",
            QueryType::Comparative => "comparative",
            QueryType::General => "general",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryAnalysis {
    pub query_length: usize,
    pub word_count: usize,
    pub has_specific_terms: bool,
    pub recommended_weights: Weights,
    pub query_type: QueryType,
}

/// Analyze one query. Pure and deterministic.
pub fn analyze(query: &str) -> QueryAnalysis {
    let tokens: Vec<&str> = query
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .collect();

    let has_specific_terms = contains_numeral(query)
        || contains_interrogative(&tokens)
        || contains_capitalized_run(&tokens);

    let recommended_weights = if has_specific_terms {
        Weights::new(0.4, 0.6)
    } else {
        Weights::new(0.8, 0.2)
    };

    QueryAnalysis {
        query_length: query.chars().count(),
        word_count: query.split_whitespace().count(),
        has_specific_terms,
        recommended_weights,
        query_type: classify(&tokens),
    }
}

fn contains_numeral(query: &str) -> bool {
    query.chars().any(|c| c.is_ascii_digit())
}

fn contains_interrogative(tokens: &[&str]) -> bool {
    tokens
        .iter()
        .any(|t| INTERROGATIVES.contains(&t.to_lowercase().as_str()))
}

/// Two or more consecutive capitalized words, proper-noun style.
fn contains_capitalized_run(tokens: &[&str]) -> bool {
    let mut run = 0usize;
    for token in tokens {
        if is_capitalized(token) {
            run += 1;
            if run >= 2 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

fn is_capitalized(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(first), Some(second)) => first.is_uppercase() && second.is_lowercase(),
        _ => false,
    }
}

/// Fixed priority: factual > explanatory > comparative > general.
fn classify(tokens: &[&str]) -> QueryType {
    let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
    let has_any = |set: &[&str]| lowered.iter().any(|t| set.contains(&t.as_str()));

    if has_any(&FACTUAL) {
        QueryType::Factual
    } else if has_any(&EXPLANATORY) {
        QueryType::Explanatory
    } else if has_any(&COMPARATIVE) {
        QueryType::Comparative
    } else {
        QueryType::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeral_and_interrogative_lean_lexical() {
        let analysis = analyze("What is the capacity in 2023?");
        assert!(analysis.has_specific_terms);
        assert_eq!(analysis.recommended_weights, Weights::new(0.4, 0.6));
        assert_eq!(analysis.query_type, QueryType::Factual);
    }

    #[test]
    fn vague_query_leans_semantic() {
        let analysis = analyze("tell me about the project");
        assert!(!analysis.has_specific_terms);
        assert_eq!(analysis.recommended_weights, Weights::new(0.8, 0.2));
        assert_eq!(analysis.query_type, QueryType::General);
    }

    #[test]
    fn proper_noun_run_counts_as_specific() {
        let analysis = analyze("tell me about Nguyen Trai street");
        assert!(analysis.has_specific_terms);
    }

    #[test]
    fn single_capitalized_word_is_not_a_run() {
        let analysis = analyze("tell me about Hanoi today");
        assert!(!analysis.has_specific_terms);
    }

    #[test]
    fn factual_outranks_explanatory() {
        // Both "what" and "explain" present; factual wins by priority.
        assert_eq!(analyze("explain what happened").query_type, QueryType::Factual);
    }

    #[test]
    fn explanatory_outranks_comparative() {
        assert_eq!(
            analyze("explain the difference between them").query_type,
            QueryType::Explanatory
        );
    }

    #[test]
    fn comparative_without_higher_keywords() {
        assert_eq!(analyze("compare the two engines").query_type, QueryType::Comparative);
    }

    #[test]
    fn counts_are_reported() {
        let analysis = analyze("two words");
        assert_eq!(analysis.word_count, 2);
        assert_eq!(analysis.query_length, 9);
    }
}
