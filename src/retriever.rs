//! Query → knowledge-base row, through an ordered chain of strategies.
//!
//! | Step | Strategy | Matches when |
//! |------|----------|--------------|
//! | 1 | [`MatchStrategy::Semantic`] | a vector index is available; the nearest of the top-k wins |
//! | 2 | [`MatchStrategy::Keyword`] | the cleaned query mentions a known symptom keyword or one of its synonyms |
//! | 3 | [`MatchStrategy::RawText`] | the cleaned query is a substring of a row's subject terms |
//! | 4 | [`MatchStrategy::TopicDefault`] | the query mentions the priority topic (malaria) |
//!
//! Each step runs only when the previous ones found nothing. When all four
//! fail the result is `None`, which the orchestrator turns into the
//! clarification / consultation responses.

use tracing::debug;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::index::VectorIndex;
use crate::models::{MatchStrategy, RecordColumn, RemedyRecord};
use crate::records::RecordStore;

/// A matched row.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub record: RemedyRecord,
    pub row_index: usize,
    pub strategy: MatchStrategy,
}

/// Phrases removed before lexical matching. Longer phrases come first so a
/// shorter one never splits them.
const FILLER_PHRASES: &[&str] = &[
    "je pense que j'ai",
    "je crois que j'ai",
    "je souffre de",
    "je crois que",
    "traitement pour",
    "remède pour",
    "soigner",
    "guérir",
    "j'ai",
    "i think i have",
    "i think i've got",
    "i believe i have",
    "i'm suffering from",
    "i am suffering from",
    "i suffer from",
    "treatment for",
    "remedy for",
    "cure for",
    "how to treat",
    "i have",
];

struct SymptomKeyword {
    /// Stem tested against the query.
    keyword: &'static str,
    /// Terms searched in `subject_terms`, in order.
    search_terms: &'static [&'static str],
    /// Any of these in the query selects the keyword.
    synonyms: &'static [&'static str],
}

/// Ordered: the first keyword whose search yields rows wins.
const SYMPTOM_KEYWORDS: &[SymptomKeyword] = &[
    SymptomKeyword {
        keyword: "palud",
        search_terms: &["palud"],
        synonyms: &["malaria", "palu", "fièvre", "frissons", "fever", "chills"],
    },
    SymptomKeyword {
        keyword: "malaria",
        search_terms: &["malaria"],
        synonyms: &["paludisme", "paludism", "palu", "fièvre", "frissons", "fever", "chills"],
    },
    SymptomKeyword {
        keyword: "diarrhée",
        search_terms: &["diarrhée", "diarrhea", "diarrhoea"],
        synonyms: &["diarrhea", "diarrhoea", "ventre", "intestin", "selles", "liquide", "stomach"],
    },
    SymptomKeyword {
        keyword: "constipation",
        search_terms: &["constipation"],
        synonyms: &["intestin", "selles", "difficile", "bowel", "stool"],
    },
    SymptomKeyword {
        keyword: "fièvre",
        search_terms: &["fièvre", "fever"],
        synonyms: &["température", "temperature", "chaud", "corps", "fever", "hot"],
    },
    SymptomKeyword {
        keyword: "toux",
        search_terms: &["toux", "cough"],
        synonyms: &["respiration", "poumon", "gorge", "cough", "breathing", "lung", "throat"],
    },
    SymptomKeyword {
        keyword: "mal de tête",
        search_terms: &["mal de tête", "céphalée", "headache", "migraine"],
        synonyms: &["tête", "migraine", "céphalée", "headache", "head"],
    },
    SymptomKeyword {
        keyword: "douleur",
        search_terms: &["douleur", "pain"],
        synonyms: &["mal", "souffrance", "pain", "ache"],
    },
];

/// Query stems that select the priority topic.
pub const PRIORITY_TOPIC_TRIGGERS: &[&str] = &["palud", "malaria"];

/// Canonical terms searched for the priority topic.
pub const PRIORITY_TOPIC_TERMS: &[&str] = &["malaria", "paludisme", "paludism"];

/// Lowercase, drop filler phrases and surrounding punctuation.
pub fn clean_query(query: &str) -> String {
    let mut cleaned = query.to_lowercase().replace('’', "'");
    for phrase in FILLER_PHRASES {
        cleaned = remove_phrase(&cleaned, phrase);
    }
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

/// True if `term` occurs in `text` at the start of a word.
pub fn mentions(text: &str, term: &str) -> bool {
    text.match_indices(term).any(|(pos, _)| {
        text[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

/// Remove whole-word occurrences of `phrase`.
fn remove_phrase(text: &str, phrase: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(phrase) {
        let end = pos + phrase.len();
        let before_ok = rest[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = rest[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            out.push_str(&rest[..pos]);
            out.push(' ');
        } else {
            out.push_str(&rest[..end]);
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

/// True if the query mentions the priority topic anywhere, including inside
/// compounds such as "antipaludique".
pub fn mentions_priority_topic(cleaned: &str) -> bool {
    PRIORITY_TOPIC_TRIGGERS.iter().any(|t| cleaned.contains(t))
}

pub struct Retriever<'a> {
    records: &'a RecordStore,
    index: Option<&'a VectorIndex>,
    embedder: &'a dyn EmbeddingProvider,
    top_k: usize,
    min_score: f32,
}

impl<'a> Retriever<'a> {
    pub fn new(
        records: &'a RecordStore,
        index: Option<&'a VectorIndex>,
        embedder: &'a dyn EmbeddingProvider,
        top_k: usize,
    ) -> Self {
        Self {
            records,
            index,
            embedder,
            top_k: top_k.max(1),
            min_score: 0.0,
        }
    }

    /// Semantic neighbors scoring at or below `min_score` are not matches.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub async fn retrieve(&self, query: &str) -> Option<Retrieval> {
        if let Some(hit) = self.semantic(query).await {
            return Some(hit);
        }

        let cleaned = clean_query(query);
        self.keyword(&cleaned)
            .or_else(|| self.raw_text(&cleaned))
            .or_else(|| self.topic_default(&cleaned))
    }

    async fn semantic(&self, query: &str) -> Option<Retrieval> {
        let index = self.index?;
        if query.trim().is_empty() || index.is_empty() {
            return None;
        }
        let vector = match embed_query(self.embedder, query).await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "query embedding failed, falling back to lexical retrieval");
                return None;
            }
        };

        let nearest = index
            .search(&vector, self.top_k)
            .into_iter()
            .next()
            .filter(|n| n.score > self.min_score)?;
        let record = self.records.row_at(nearest.row_index)?;
        debug!(row = nearest.row_index, score = nearest.score, "semantic match");
        Some(Retrieval {
            record: record.clone(),
            row_index: nearest.row_index,
            strategy: MatchStrategy::Semantic,
        })
    }

    fn keyword(&self, cleaned: &str) -> Option<Retrieval> {
        for entry in SYMPTOM_KEYWORDS {
            let selected = mentions(cleaned, entry.keyword)
                || entry.synonyms.iter().any(|s| mentions(cleaned, s));
            if !selected {
                continue;
            }
            if let Some(hit) = self.first_matching(entry.search_terms, MatchStrategy::Keyword) {
                debug!(keyword = entry.keyword, row = hit.row_index, "keyword match");
                return Some(hit);
            }
        }
        None
    }

    fn raw_text(&self, cleaned: &str) -> Option<Retrieval> {
        if cleaned.is_empty() {
            return None;
        }
        self.first_matching(&[cleaned], MatchStrategy::RawText)
    }

    fn topic_default(&self, cleaned: &str) -> Option<Retrieval> {
        if !mentions_priority_topic(cleaned) {
            return None;
        }
        self.first_matching(PRIORITY_TOPIC_TERMS, MatchStrategy::TopicDefault)
    }

    fn first_matching(&self, terms: &[&str], strategy: MatchStrategy) -> Option<Retrieval> {
        terms.iter().find_map(|term| {
            self.records
                .rows_where(RecordColumn::SubjectTerms, term, true)
                .into_iter()
                .next()
                .map(|(row_index, record)| Retrieval {
                    record: record.clone(),
                    row_index,
                    strategy,
                })
        })
    }
}
