//! Templated explanations used when no generation backend answers.
//!
//! Everything here is pure and infallible: the same record always yields the
//! same eight sections. The orchestrator uses these sections whole when the
//! provider is unset or fails, and per-section to backfill incomplete
//! provider output.

use crate::models::{ExplanationSections, Section};

/// Values interpolated into the templated sections.
#[derive(Debug, Clone, Copy)]
pub struct FallbackInput<'a> {
    pub symptoms: &'a str,
    pub remedy_name: &'a str,
    pub pathology: &'a str,
    pub preparation: &'a str,
    pub dosage: &'a str,
    pub parts_used: &'a str,
    pub contraindications: &'a str,
    pub components: &'a str,
}

/// Typical symptoms keyed by a fragment of the pathology label.
const SYMPTOM_TABLE: &[(&[&str], &str)] = &[
    (
        &["palud", "malaria"],
        "intermittent fever, chills, headache, fatigue, muscle and joint pain",
    ),
    (
        &["dysenter"],
        "bloody or mucous liquid stools, severe abdominal cramps, fever",
    ),
    (
        &["diarrh"],
        "frequent liquid stools, abdominal cramps, possible dehydration, weakness",
    ),
    (
        &["fièvre", "fievre", "fever"],
        "high body temperature, chills, headache, fatigue, dehydration",
    ),
    (
        &["toux", "cough"],
        "throat irritation, expectoration, breathing discomfort, chest pain",
    ),
];

const GENERIC_SYMPTOMS: &str = "symptoms that vary from person to person";

/// Mechanism sentence keyed by a fragment of the parts-used column.
const MECHANISM_TABLE: &[(&[&str], &str)] = &[
    (
        &["racin", "root"],
        "The roots hold potent active principles that act directly on the pathogen.",
    ),
    (
        &["feuill", "leaf", "leaves"],
        "The leaves contain compounds that act as antipyretics and anti-inflammatories.",
    ),
    (
        &["écorce", "ecorce", "bark"],
        "The bark contains alkaloids and tannins with antiparasitic properties.",
    ),
];

const GENERIC_MECHANISM: &str =
    "The plant contains compounds that act directly on the pathogen while strengthening the immune system.";

/// Characters of the component list quoted in the components section.
const COMPONENT_EXCERPT: usize = 100;

fn lookup<'t>(table: &[(&[&str], &'t str)], haystack: &str) -> Option<&'t str> {
    let haystack = haystack.to_lowercase();
    table
        .iter()
        .find(|(keys, _)| keys.iter().any(|k| haystack.contains(k)))
        .map(|(_, text)| *text)
}

/// Build all eight sections from record data alone.
pub fn fallback_sections(input: FallbackInput<'_>) -> ExplanationSections {
    let symptoms_detail = lookup(SYMPTOM_TABLE, input.pathology).unwrap_or(GENERIC_SYMPTOMS);
    let mechanism = lookup(MECHANISM_TABLE, input.parts_used).unwrap_or(GENERIC_MECHANISM);

    let excerpt: String = input.components.chars().take(COMPONENT_EXCERPT).collect();
    let excerpt = if excerpt.trim().is_empty() {
        "traditional compounds".to_string()
    } else {
        excerpt
    };

    ExplanationSections {
        diagnosis: format!(
            "NOTICE: the main AI model is not available right now. Based on the symptoms you describe (\"{}\"), \
             you may be suffering from {}. This suggestion relies only on general matches in our database, \
             not on a medical analysis. A consultation with a health professional is strongly recommended.",
            input.symptoms.trim(),
            input.pathology.to_uppercase()
        ),
        associated_symptoms: format!(
            "Symptoms typically associated with {} include: {}. They come from the body's reaction to the \
             infection or imbalance it is going through.",
            input.pathology, symptoms_detail
        ),
        remedy_presentation: format!(
            "{} is a medicinal species highly valued in traditional African pharmacopoeia. Healers have used it \
             for generations against various conditions, {} in particular. Its use belongs to a long tradition \
             of natural medicine developed by local communities.",
            input.remedy_name, input.pathology
        ),
        mechanism: format!(
            "{} The plant works gradually and naturally to restore the body's balance and strengthen its defences.",
            mechanism
        ),
        treatment_info: format!(
            "Preparation: {}\n\n\
             Dosage: {}\nFollow this dosage precisely. These quantities are the daily dose for an adult, \
             to be split into 2-3 doses per day.\n\n\
             Parts used: {}\nThese parts hold the highest concentration of the active principles needed for \
             the treatment.",
            input.preparation, input.dosage, input.parts_used
        ),
        precautions: format!(
            "For your safety, note the following contraindications: {}\n\n\
             Some compounds of the plant may interact with other medicines or worsen existing conditions. \
             When in doubt, always consult a health professional.",
            input.contraindications
        ),
        active_components_summary: format!(
            "{} contains natural active components such as {}... which work together for a synergistic \
             therapeutic effect. These substances explain the plant's traditionally recognised efficacy.",
            input.remedy_name, excerpt
        ),
        treatment_summary: format!(
            "To treat {}, prepare {} following the instructions above. Take the recommended dose 2-3 times a \
             day for 7 days. If symptoms persist after 3 days or get worse, see a health professional \
             immediately. Respect the precautions listed for a safe and effective treatment.",
            input.pathology, input.remedy_name
        ),
    }
}

/// The eight sections joined with blank lines, in presentation order.
pub fn render_explanation(sections: &ExplanationSections) -> String {
    Section::ALL
        .iter()
        .map(|s| sections.get(*s).trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ============ Degraded chat ============

/// Canned replies keyed by whole words of the message, checked in order.
const CHAT_REPLIES: &[(&[&str], &str)] = &[
    (
        &["bonjour", "hello"],
        "Hello! I am here to help with your questions about African herbal medicine. How can I help you today?",
    ),
    (
        &["salut", "hi", "hey"],
        "Hi! How are you? I can answer your questions about African medicinal plants.",
    ),
    (
        &["merci", "thanks", "thank"],
        "You are welcome! It is a pleasure to help you discover traditional African remedies.",
    ),
    (
        &["aide", "help"],
        "I can tell you about African medicinal plants, their traditional uses and their properties. \
         For advice specific to your symptoms, use the consultation mode.",
    ),
    (
        &["comment", "how"],
        "For personalised advice based on your symptoms, I recommend the consultation mode. \
         For general questions, I am happy to help!",
    ),
];

const DEFAULT_CHAT_REPLY: &str = "That is a great question about African herbal medicine! For advice \
     tailored to your needs, please use the consultation mode. Otherwise, feel free to ask me other general questions.";

/// Reply used when the chat backend is unset or fails.
pub fn canned_chat_reply(message: &str) -> &'static str {
    let lowered = message.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    CHAT_REPLIES
        .iter()
        .find(|(keys, _)| keys.iter().any(|k| words.contains(k)))
        .map(|(_, reply)| *reply)
        .unwrap_or(DEFAULT_CHAT_REPLY)
}
