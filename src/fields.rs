//! Display strings derived from a [`RemedyRecord`].
//!
//! The raw columns pack several values into `;`-joined lists of
//! `name:value` pairs with `NULL` for missing data. These helpers turn them
//! into the short human-readable strings shown alongside a recommendation.

use std::collections::HashMap;

use crate::models::{RemedyRecord, LIST_SEPARATOR, NO_DATA};
use crate::retriever::{mentions_priority_topic, PRIORITY_TOPIC_TERMS};

pub const COMPONENTS_UNAVAILABLE: &str = "Specific active components are not currently available";
pub const LOCAL_NAMES_UNAVAILABLE: &str = "Local names are not available in the current data";
pub const NO_CONTRAINDICATIONS: &str = "No contraindication specified";
pub const UNKNOWN_REMEDY: &str = "Unknown plant";

/// Maximum plants listed in the local-name summary.
const LOCAL_NAME_PLANTS: usize = 3;
/// Maximum names listed per plant.
const LOCAL_NAMES_PER_PLANT: usize = 5;

fn is_no_data(value: &str) -> bool {
    value.to_uppercase().contains(NO_DATA)
}

/// Split `name:value` at the first colon, trimming both halves.
fn split_pair(entry: &str) -> Option<(&str, &str)> {
    entry
        .split_once(':')
        .map(|(name, value)| (name.trim(), value.trim()))
}

/// Group `plant:component` pairs per plant, dropping `NULL` entries.
///
/// ```text
/// "Neem:azadirachtine;Neem:nimbine;Moringa:NULL"  →  "Neem: azadirachtine, nimbine"
/// ```
pub fn format_components(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return COMPONENTS_UNAVAILABLE.to_string();
    }
    if !raw.contains(LIST_SEPARATOR) {
        return if is_no_data(raw) {
            COMPONENTS_UNAVAILABLE.to_string()
        } else {
            raw.to_string()
        };
    }

    // Preserves first-seen plant order.
    let mut order: Vec<&str> = Vec::new();
    let mut by_plant: HashMap<&str, Vec<&str>> = HashMap::new();
    for (plant, component) in raw.split(LIST_SEPARATOR).filter_map(split_pair) {
        if component.is_empty() || is_no_data(component) {
            continue;
        }
        by_plant
            .entry(plant)
            .or_insert_with(|| {
                order.push(plant);
                Vec::new()
            })
            .push(component);
    }

    let lines: Vec<String> = order
        .iter()
        .map(|plant| format!("{}: {}", plant, by_plant[plant].join(", ")))
        .collect();

    if lines.is_empty() {
        COMPONENTS_UNAVAILABLE.to_string()
    } else {
        lines.join("\n")
    }
}

/// Summarise the three parallel local-name lists.
///
/// Keeps the three plants with the most entries and at most five names per
/// plant, each rendered as `name (language, country)`.
pub fn local_name_summary(record: &RemedyRecord) -> String {
    let names = record.local_names.trim();
    let languages = record.language.trim();
    let countries = record.country.trim();
    if names.is_empty() || languages.is_empty() || countries.is_empty() {
        return LOCAL_NAMES_UNAVAILABLE.to_string();
    }

    if !names.contains(LIST_SEPARATOR) {
        if is_no_data(names) {
            return LOCAL_NAMES_UNAVAILABLE.to_string();
        }
        return format!("Local name: {} in {} ({}).", names, languages, countries);
    }

    let entries: Vec<&str> = names.split(LIST_SEPARATOR).collect();
    let broadcast = |column: &str| -> Vec<String> {
        if column.contains(LIST_SEPARATOR) {
            column.split(LIST_SEPARATOR).map(|s| s.trim().to_string()).collect()
        } else {
            vec![column.to_string(); entries.len()]
        }
    };
    let languages = broadcast(languages);
    let countries = broadcast(countries);

    // Rank plants by entry count; ties keep first-seen order.
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for (plant, _) in entries.iter().filter_map(|e| split_pair(e)) {
        match counts.iter_mut().find(|(p, _)| *p == plant) {
            Some((_, n)) => *n += 1,
            None => counts.push((plant, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(LOCAL_NAME_PLANTS);

    let mut listed: Vec<(&str, Vec<String>)> =
        counts.iter().map(|(p, _)| (*p, Vec::new())).collect();

    for (i, entry) in entries.iter().enumerate() {
        let (Some(language), Some(country)) = (languages.get(i), countries.get(i)) else {
            break;
        };
        let Some((plant, local)) = split_pair(entry) else {
            continue;
        };
        if local.is_empty()
            || is_no_data(local)
            || language.is_empty()
            || country.is_empty()
            || is_no_data(language)
            || is_no_data(country)
        {
            continue;
        }
        if let Some((_, bucket)) = listed.iter_mut().find(|(p, _)| *p == plant) {
            if bucket.len() < LOCAL_NAMES_PER_PLANT {
                bucket.push(format!("{} ({}, {})", local, language, country));
            }
        }
    }

    let infos: Vec<String> = listed
        .into_iter()
        .filter(|(_, names)| !names.is_empty())
        .map(|(plant, names)| format!("{} is known as: {}", plant, names.join(", ")))
        .collect();

    if infos.is_empty() {
        LOCAL_NAMES_UNAVAILABLE.to_string()
    } else {
        format!("Local names: {}", infos.join(". "))
    }
}

/// Recipe-level contraindications, else plant-level, else a placeholder.
pub fn contraindications(record: &RemedyRecord) -> String {
    [&record.recipe_contraindications, &record.plant_contraindications]
        .into_iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or(NO_CONTRAINDICATIONS)
        .to_string()
}

/// Pathology label used by the prompt and the templated sections.
///
/// When the query names the priority topic but the matched row's subject
/// terms do not, the label becomes the topic itself.
pub fn pathology_label(query: &str, record: &RemedyRecord) -> String {
    let subject = record.subject_terms.trim();
    if mentions_priority_topic(&query.to_lowercase())
        && !mentions_priority_topic(&subject.to_lowercase())
    {
        return PRIORITY_TOPIC_TERMS[1].to_string();
    }
    if subject.is_empty() {
        "unspecified condition".to_string()
    } else {
        subject.to_string()
    }
}

/// Canonical remedy name with a placeholder for blank rows.
pub fn remedy_name(record: &RemedyRecord) -> String {
    let name = record.primary_name();
    if name.is_empty() {
        UNKNOWN_REMEDY.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_grouped_per_plant() {
        let out = format_components("Neem:azadirachtine; Neem:nimbine;Moringa:NULL;Moringa:quercétine");
        assert_eq!(out, "Neem: azadirachtine, nimbine\nMoringa: quercétine");
    }

    #[test]
    fn test_components_all_null() {
        assert_eq!(format_components("Neem:NULL;Moringa:null"), COMPONENTS_UNAVAILABLE);
        assert_eq!(format_components("NULL"), COMPONENTS_UNAVAILABLE);
        assert_eq!(format_components(""), COMPONENTS_UNAVAILABLE);
    }

    #[test]
    fn test_components_single_value_kept() {
        assert_eq!(format_components("tanins"), "tanins");
    }

    #[test]
    fn test_local_names_top_plants_and_limits() {
        let record = RemedyRecord {
            local_names: "Neem:Kininutin;Neem:Dongoyaro;Moringa:Yovo kpati;Neem:NULL".into(),
            language: "Fon;Yoruba;Fon;Fon".into(),
            country: "Benin".into(),
            ..Default::default()
        };
        assert_eq!(
            local_name_summary(&record),
            "Local names: Neem is known as: Kininutin (Fon, Benin), Dongoyaro (Yoruba, Benin). Moringa is known as: Yovo kpati (Fon, Benin)"
        );
    }

    #[test]
    fn test_local_names_single_entry() {
        let record = RemedyRecord {
            local_names: "Kinkeliba".into(),
            language: "Wolof".into(),
            country: "Senegal".into(),
            ..Default::default()
        };
        assert_eq!(local_name_summary(&record), "Local name: Kinkeliba in Wolof (Senegal).");
    }

    #[test]
    fn test_local_names_missing_columns() {
        let record = RemedyRecord {
            local_names: "Neem:Kininutin".into(),
            ..Default::default()
        };
        assert_eq!(local_name_summary(&record), LOCAL_NAMES_UNAVAILABLE);
    }

    #[test]
    fn test_contraindications_precedence() {
        let mut record = RemedyRecord {
            plant_contraindications: "Pregnancy".into(),
            ..Default::default()
        };
        assert_eq!(contraindications(&record), "Pregnancy");
        record.recipe_contraindications = "Children under 5".into();
        assert_eq!(contraindications(&record), "Children under 5");
        assert_eq!(contraindications(&RemedyRecord::default()), NO_CONTRAINDICATIONS);
    }

    #[test]
    fn test_pathology_override_for_priority_topic() {
        let record = RemedyRecord {
            subject_terms: "fièvre".into(),
            ..Default::default()
        };
        assert_eq!(pathology_label("J'ai le paludisme", &record), "paludisme");
        assert_eq!(pathology_label("j'ai de la fièvre", &record), "fièvre");

        let malaria_row = RemedyRecord {
            subject_terms: "Malaria".into(),
            ..Default::default()
        };
        assert_eq!(pathology_label("paludisme", &malaria_row), "Malaria");
    }
}
