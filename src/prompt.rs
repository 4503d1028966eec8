//! Prompt rendering and section extraction.
//!
//! A recommendation makes exactly one generation call. The prompt lists the
//! eight section titles in order; the reply is then split back into sections
//! by a single-pass line scanner:
//!
//! ```text
//!             title line                      title line
//!   ┌──────────────┐  flush → open(s)  ┌──────────────────┐ ──┐ flush → open(s')
//!   │ NoSectionOpen│ ────────────────▶ │ SectionOpen(s)   │ ◀─┘
//!   └──────────────┘                   └──────────────────┘
//!      other lines → preamble            other lines → buffer(s)
//! ```
//!
//! A line is a title when, after stripping markdown decoration and list
//! numbering, it starts with a known title variant (the longest variant wins)
//! and the rest of the line is empty or begins with `:` or a dash. Variants
//! such as "Presentation of" take a subject, so anything may follow them;
//! only text after a `:` becomes content. Text after the separator on a
//! title line is the first content line of that section.
//!
//! Titles are recognised in English and French because open models often
//! answer in the language of the knowledge base.

use crate::models::{ExplanationSections, ExplanationSource, RemedyRecord, Section};

/// Record-derived values substituted into the recommendation prompt.
#[derive(Debug, Clone)]
pub struct PromptFields<'a> {
    pub symptoms: &'a str,
    pub remedy_name: &'a str,
    pub pathology: &'a str,
    pub preparation: &'a str,
    pub dosage: &'a str,
    pub parts_used: &'a str,
    pub recipe_contraindications: &'a str,
    pub plant_contraindications: &'a str,
    pub components: &'a str,
}

fn or_unspecified(value: &str) -> &str {
    if value.trim().is_empty() {
        "Not specified"
    } else {
        value
    }
}

impl<'a> PromptFields<'a> {
    /// `pathology` and `components` are the display strings derived in
    /// [`crate::fields`]; everything else comes straight from the row.
    pub fn from_record(
        query: &'a str,
        record: &'a RemedyRecord,
        pathology: &'a str,
        components: &'a str,
    ) -> Self {
        Self {
            symptoms: query,
            remedy_name: record.primary_name(),
            pathology,
            preparation: &record.preparation,
            dosage: &record.dosage,
            parts_used: &record.parts_used,
            recipe_contraindications: &record.recipe_contraindications,
            plant_contraindications: &record.plant_contraindications,
            components,
        }
    }

    pub fn render(&self) -> String {
        format!(
            r#"You are an expert in African herbal medicine with a warm, educational tone. For the symptoms described: {symptoms},
write a structured explanation with the following sections, in EXACTLY this order, each introduced by its title on its own line.

{t_diag}
Start with: "Based on the symptoms you describe, you may be suffering from {pathology}." Never state this with certainty; it is a possibility, not a medical diagnosis. Always recommend a professional consultation to confirm. (3-4 sentences)

{t_symp}
Describe the typical symptoms of this condition and how they show, to help the reader recognise it. (3-5 sentences)

{t_pres} {remedy}
Present this plant like a traditional storyteller: its history and traditional uses in Africa. Use its scientific and local names when provided. (4-5 sentences)

{t_mech}
Using the active components listed below, explain simply how the plant acts on the condition. Avoid jargon while staying scientifically correct. (3-4 sentences)

{t_treat}
Turn these raw data into practical advice:
- Preparation: {preparation}
- Dosage: {dosage}
- Parts used: {parts}
Explain clearly how to prepare, dose and use the right parts of the plant. (5-7 sentences at most)

{t_prec}
Structure this section in two parts:
1. Recipe contraindications: {recipe_ci}
2. Plant contraindications: {plant_ci}
Make these data understandable. (4-6 sentences)

{t_comp}
Explain the main therapeutic effects of these components: "{components}". Mention ONLY compounds that appear in this list. (3-4 sentences)

{t_sum}
Summarise in 4-5 sentences: the condition (as a possibility), the main plant and its preparation, the exact dosage and number of doses per day, the treatment duration (7 days by default), and when to see a health professional (if symptoms persist after 3 days).

STRICT REQUIREMENTS:
1. Every section MUST be present, with its exact title, in the order given
2. Use ONLY the information provided above
3. If a value is "Not specified", give general advice without inventing details
4. Be warm and accessible but precise about dosage and precautions
5. Leave a blank line between sections"#,
            symptoms = self.symptoms.trim(),
            pathology = or_unspecified(self.pathology),
            remedy = or_unspecified(self.remedy_name),
            preparation = or_unspecified(self.preparation),
            dosage = or_unspecified(self.dosage),
            parts = or_unspecified(self.parts_used),
            recipe_ci = or_unspecified(self.recipe_contraindications),
            plant_ci = or_unspecified(self.plant_contraindications),
            components = or_unspecified(self.components),
            t_diag = Section::Diagnosis.title(),
            t_symp = Section::AssociatedSymptoms.title(),
            t_pres = Section::RemedyPresentation.title(),
            t_mech = Section::Mechanism.title(),
            t_treat = Section::TreatmentInfo.title(),
            t_prec = Section::Precautions.title(),
            t_comp = Section::ActiveComponentsSummary.title(),
            t_sum = Section::TreatmentSummary.title(),
        )
    }
}

// ============ Title table ============

struct TitleVariant {
    text: &'static str,
    section: Section,
    /// The title is followed by a subject ("Presentation of Neem").
    takes_subject: bool,
}

const fn title(text: &'static str, section: Section) -> TitleVariant {
    TitleVariant {
        text,
        section,
        takes_subject: false,
    }
}

const fn subject_title(text: &'static str, section: Section) -> TitleVariant {
    TitleVariant {
        text,
        section,
        takes_subject: true,
    }
}

const TITLES: &[TitleVariant] = &[
    title("possible diagnosis", Section::Diagnosis),
    title("diagnosis", Section::Diagnosis),
    title("diagnostic possible", Section::Diagnosis),
    title("diagnostic", Section::Diagnosis),
    title("associated symptoms", Section::AssociatedSymptoms),
    title("symptoms", Section::AssociatedSymptoms),
    title("symptômes associés", Section::AssociatedSymptoms),
    title("symptômes", Section::AssociatedSymptoms),
    subject_title("presentation of", Section::RemedyPresentation),
    title("presentation", Section::RemedyPresentation),
    subject_title("présentation de", Section::RemedyPresentation),
    title("présentation", Section::RemedyPresentation),
    title("mechanism of action", Section::Mechanism),
    title("mode of action", Section::Mechanism),
    title("mechanism", Section::Mechanism),
    title("mode d'action", Section::Mechanism),
    title("treatment information", Section::TreatmentInfo),
    title("informations de traitement", Section::TreatmentInfo),
    title("treatment", Section::TreatmentInfo),
    title("traitement", Section::TreatmentInfo),
    title("informations", Section::TreatmentInfo),
    title("precautions and contraindications", Section::Precautions),
    title("precautions", Section::Precautions),
    title("contraindications", Section::Precautions),
    title("précautions et contre-indications", Section::Precautions),
    title("précautions", Section::Precautions),
    title("contre-indications", Section::Precautions),
    title("active components", Section::ActiveComponentsSummary),
    title("components", Section::ActiveComponentsSummary),
    title("composants actifs", Section::ActiveComponentsSummary),
    title("composants", Section::ActiveComponentsSummary),
    title("treatment summary", Section::TreatmentSummary),
    title("summary", Section::TreatmentSummary),
    title("résumé de traitement", Section::TreatmentSummary),
    title("résumé", Section::TreatmentSummary),
];

/// Case-insensitive `strip_prefix` that works on chars, not bytes.
fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let mut chars = text.char_indices();
    for p in prefix.chars() {
        let (_, c) = chars.next()?;
        if !c.to_lowercase().eq(p.to_lowercase()) {
            return None;
        }
    }
    let rest = chars.next().map_or(text.len(), |(i, _)| i);
    Some(&text[rest..])
}

/// Drop heading marks, emphasis, bullets and list numbering.
fn strip_decoration(line: &str) -> &str {
    let line = line.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, '#' | '*' | '_' | '>' | '-' | '•' | '|')
    });
    // "1." / "2)" / "IV." list markers
    let marker_end = line
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, 'I' | 'V' | 'X')))
        .map(|(i, _)| i)
        .unwrap_or(line.len());
    if marker_end > 0 {
        let rest = &line[marker_end..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return rest.trim_start_matches(|c: char| {
                c.is_whitespace() || matches!(c, '*' | '_')
            });
        }
    }
    line
}

fn is_separator(c: char) -> bool {
    matches!(c, ':' | '-' | '–' | '—')
}

fn trim_emphasis(text: &str) -> &str {
    text.trim_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '_' | '#'))
}

/// If `line` is a section title, return the section and any inline content.
fn match_title(line: &str) -> Option<(Section, Option<String>)> {
    let normalized = line.replace('’', "'");
    let body = strip_decoration(&normalized);

    let (variant, rest) = TITLES
        .iter()
        .filter_map(|v| strip_prefix_ci(body, v.text).map(|rest| (v, rest)))
        .max_by_key(|(v, _)| v.text.chars().count())?;

    let rest = rest.trim_start_matches(|c: char| matches!(c, '*' | '_'));

    let content = if variant.takes_subject {
        // Subject up to the first colon; content after it.
        rest.split_once(':').map(|(_, after)| after)
    } else {
        let rest_trimmed = rest.trim_start();
        let spaced = rest_trimmed.len() < rest.len();
        match rest_trimmed.chars().next() {
            None => None,
            Some(':') => Some(&rest_trimmed[1..]),
            // A dash glued to the word is a hyphenated word, not a separator.
            Some(sep) if is_separator(sep) && spaced => Some(&rest_trimmed[sep.len_utf8()..]),
            Some(_) => return None,
        }
    };

    let content = content
        .map(trim_emphasis)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Some((variant.section, content))
}

/// Scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractState {
    NoSectionOpen,
    SectionOpen(Section),
}

/// Split free text into the eight sections. Sections not found stay empty.
pub fn extract_sections(text: &str) -> ExplanationSections {
    let mut sections = ExplanationSections::default();
    let mut state = ExtractState::NoSectionOpen;
    let mut buffer: Vec<String> = Vec::new();
    let mut preamble: Vec<String> = Vec::new();
    let mut titles_seen = 0usize;

    let flush = |state: ExtractState, buffer: &mut Vec<String>, sections: &mut ExplanationSections| {
        if let ExtractState::SectionOpen(section) = state {
            let chunk = buffer.join("\n").trim().to_string();
            if !chunk.is_empty() {
                let existing = sections.get(section);
                let merged = if existing.is_empty() {
                    chunk
                } else {
                    format!("{}\n{}", existing, chunk)
                };
                sections.set(section, merged);
            }
        }
        buffer.clear();
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some((section, inline)) = match_title(trimmed) {
            flush(state, &mut buffer, &mut sections);
            titles_seen += 1;
            state = ExtractState::SectionOpen(section);
            if let Some(content) = inline {
                buffer.push(content);
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        match state {
            ExtractState::NoSectionOpen => preamble.push(trimmed.to_string()),
            ExtractState::SectionOpen(_) => buffer.push(trimmed.to_string()),
        }
    }
    flush(state, &mut buffer, &mut sections);

    if sections.diagnosis.is_empty() {
        if titles_seen == 0 {
            if let Some(first) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
                sections.diagnosis = first.to_string();
            }
        } else if !preamble.is_empty() {
            sections.diagnosis = preamble.join("\n");
        }
    }

    sections
}

/// Fill empty extracted sections from `fallback`.
pub fn merge_with_fallback(
    extracted: ExplanationSections,
    fallback: &ExplanationSections,
) -> (ExplanationSections, ExplanationSource) {
    let mut merged = extracted;
    let mut backfilled = 0usize;
    for section in Section::ALL {
        if merged.get(section).trim().is_empty() {
            merged.set(section, fallback.get(section).to_string());
            backfilled += 1;
        }
    }
    let source = match backfilled {
        0 => ExplanationSource::Provider,
        n if n == Section::ALL.len() => ExplanationSource::Fallback,
        _ => ExplanationSource::Partial,
    };
    (merged, source)
}
