//! Tokenization shared by the keyword index, the reranker and snippet windowing.

use std::collections::HashSet;

const UNICODE_NGRAM_SIZE: usize = 2;

const STOP_WORDS: [&str; 32] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "does", "for", "from", "how", "in", "is",
    "it", "of", "on", "or", "the", "that", "this", "to", "was", "what", "when", "where", "which",
    "who", "why", "with", "do", "can",
];

/// Lower-cased alphanumeric words in reading order. Non-ASCII words are
/// followed by their character bigrams so unsegmented scripts still match.
pub fn terms(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buffer = String::new();

    for ch in text.chars().flat_map(|ch| ch.to_lowercase()) {
        if ch.is_alphanumeric() || ch == '_' {
            buffer.push(ch);
        } else if !buffer.is_empty() {
            push_word(&mut out, std::mem::take(&mut buffer));
        }
    }

    if !buffer.is_empty() {
        push_word(&mut out, buffer);
    }

    out
}

fn push_word(out: &mut Vec<String>, word: String) {
    let ngrams = if word.is_ascii() {
        Vec::new()
    } else {
        char_ngrams(&word, UNICODE_NGRAM_SIZE)
    };
    out.push(word);
    for ngram in ngrams {
        if !out.last().is_some_and(|last| *last == ngram) {
            out.push(ngram);
        }
    }
}

pub fn tokenize(text: &str) -> HashSet<String> {
    terms(text).into_iter().collect()
}

/// Terms of a question with stop words removed, deduplicated in first-seen order.
/// Falls back to every term when the question consists only of stop words.
pub fn query_terms(question: &str) -> Vec<String> {
    let all = terms(question);
    let mut seen = HashSet::new();
    let content: Vec<String> = all
        .iter()
        .filter(|term| !STOP_WORDS.contains(&term.as_str()))
        .filter(|term| seen.insert((*term).clone()))
        .cloned()
        .collect();

    if !content.is_empty() {
        return content;
    }

    let mut seen = HashSet::new();
    all.into_iter().filter(|term| seen.insert(term.clone())).collect()
}

pub fn char_ngrams(token: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();
    if chars.is_empty() || n == 0 {
        return Vec::new();
    }
    if chars.len() <= n {
        return vec![token.to_string()];
    }

    chars
        .windows(n)
        .map(|window| window.iter().collect::<String>())
        .collect()
}

/// Collapse runs of whitespace into single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
