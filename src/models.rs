//! Core data models used throughout the remedy pipeline.
//!
//! These types represent the knowledge-base rows, index metadata and the
//! request/response shapes that flow between retrieval, generation and the
//! outer surfaces (CLI and HTTP).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator used by every multi-valued column of the knowledge base.
pub const LIST_SEPARATOR: char = ';';

/// Sentinel written by the knowledge base for "no data".
pub const NO_DATA: &str = "NULL";

/// One row of the knowledge base.
///
/// Columns are accepted under their English names or the headers used by the
/// upstream herbal dataset (`maladiesoigneeparrecette`, `plante_recette`, ...).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RemedyRecord {
    #[serde(alias = "maladiesoigneeparrecette")]
    pub subject_terms: String,
    /// `;`-joined; the first entry is the canonical name.
    #[serde(alias = "plante_recette")]
    pub remedy_names: String,
    #[serde(alias = "plante_quantite_recette")]
    pub dosage: String,
    #[serde(alias = "recette")]
    pub preparation: String,
    #[serde(alias = "plante_partie_recette")]
    pub parts_used: String,
    /// `;`-joined `name:component` pairs, may contain [`NO_DATA`].
    #[serde(alias = "plante_composantechimique")]
    pub active_components: String,
    #[serde(alias = "recette_contreindication")]
    pub recipe_contraindications: String,
    #[serde(alias = "plante_contreindication")]
    pub plant_contraindications: String,
    #[serde(alias = "plante_nomlocal")]
    pub local_names: String,
    #[serde(alias = "nomlocal_danslalangue")]
    pub language: String,
    #[serde(alias = "danslalangue_dupays")]
    pub country: String,
    pub image_url: Option<String>,
}

impl RemedyRecord {
    /// First entry of `remedy_names`, trimmed.
    pub fn primary_name(&self) -> &str {
        self.remedy_names
            .split(LIST_SEPARATOR)
            .next()
            .unwrap_or("")
            .trim()
    }

    /// Compact retrieval-oriented text embedded for this row.
    pub fn index_document(&self) -> String {
        format!(
            "Symptoms: {}\nRemedy: {}\nDosage: {}\nPreparation: {}",
            self.subject_terms,
            self.primary_name(),
            self.dosage,
            self.preparation
        )
    }
}

/// Columns addressable by [`crate::records::RecordStore::rows_where`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordColumn {
    SubjectTerms,
    RemedyNames,
    Preparation,
    PartsUsed,
}

impl RecordColumn {
    pub fn value<'a>(&self, record: &'a RemedyRecord) -> &'a str {
        match self {
            RecordColumn::SubjectTerms => &record.subject_terms,
            RecordColumn::RemedyNames => &record.remedy_names,
            RecordColumn::Preparation => &record.preparation,
            RecordColumn::PartsUsed => &record.parts_used,
        }
    }
}

/// Metadata persisted next to the vector index.
///
/// Valid only while the source file's fresh modification time equals
/// `source_last_modified`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Source mtime at build time, nanoseconds since the Unix epoch.
    pub source_last_modified: i64,
    pub document_count: usize,
    pub built_at: DateTime<Utc>,
    pub build_id: Uuid,
    pub model: String,
    pub dims: usize,
}

/// The eight named explanation sections, in presentation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Diagnosis,
    AssociatedSymptoms,
    RemedyPresentation,
    Mechanism,
    TreatmentInfo,
    Precautions,
    ActiveComponentsSummary,
    TreatmentSummary,
}

impl Section {
    pub const ALL: [Section; 8] = [
        Section::Diagnosis,
        Section::AssociatedSymptoms,
        Section::RemedyPresentation,
        Section::Mechanism,
        Section::TreatmentInfo,
        Section::Precautions,
        Section::ActiveComponentsSummary,
        Section::TreatmentSummary,
    ];

    /// Field name used in responses.
    pub fn key(&self) -> &'static str {
        match self {
            Section::Diagnosis => "diagnosis",
            Section::AssociatedSymptoms => "associated_symptoms",
            Section::RemedyPresentation => "remedy_presentation",
            Section::Mechanism => "mechanism",
            Section::TreatmentInfo => "treatment_info",
            Section::Precautions => "precautions",
            Section::ActiveComponentsSummary => "active_components_summary",
            Section::TreatmentSummary => "treatment_summary",
        }
    }

    /// Heading used when rendering the template and the raw explanation.
    pub fn title(&self) -> &'static str {
        match self {
            Section::Diagnosis => "Possible diagnosis",
            Section::AssociatedSymptoms => "Associated symptoms",
            Section::RemedyPresentation => "Presentation of",
            Section::Mechanism => "Mechanism of action",
            Section::TreatmentInfo => "Treatment information",
            Section::Precautions => "Precautions and contraindications",
            Section::ActiveComponentsSummary => "Active components",
            Section::TreatmentSummary => "Treatment summary",
        }
    }
}

/// All eight sections of one explanation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplanationSections {
    pub diagnosis: String,
    pub associated_symptoms: String,
    pub remedy_presentation: String,
    pub mechanism: String,
    pub treatment_info: String,
    pub precautions: String,
    pub active_components_summary: String,
    pub treatment_summary: String,
}

impl ExplanationSections {
    pub fn get(&self, section: Section) -> &str {
        match section {
            Section::Diagnosis => &self.diagnosis,
            Section::AssociatedSymptoms => &self.associated_symptoms,
            Section::RemedyPresentation => &self.remedy_presentation,
            Section::Mechanism => &self.mechanism,
            Section::TreatmentInfo => &self.treatment_info,
            Section::Precautions => &self.precautions,
            Section::ActiveComponentsSummary => &self.active_components_summary,
            Section::TreatmentSummary => &self.treatment_summary,
        }
    }

    pub fn set(&mut self, section: Section, value: String) {
        let slot = match section {
            Section::Diagnosis => &mut self.diagnosis,
            Section::AssociatedSymptoms => &mut self.associated_symptoms,
            Section::RemedyPresentation => &mut self.remedy_presentation,
            Section::Mechanism => &mut self.mechanism,
            Section::TreatmentInfo => &mut self.treatment_info,
            Section::Precautions => &mut self.precautions,
            Section::ActiveComponentsSummary => &mut self.active_components_summary,
            Section::TreatmentSummary => &mut self.treatment_summary,
        };
        *slot = value;
    }

    /// True when every section holds non-whitespace text.
    pub fn is_complete(&self) -> bool {
        Section::ALL
            .iter()
            .all(|s| !self.get(*s).trim().is_empty())
    }
}

/// Where the explanation sections came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationSource {
    /// Every section was extracted from the provider output.
    Provider,
    /// Some sections were backfilled from the templated text.
    Partial,
    /// The provider was unavailable or failed; all sections are templated.
    Fallback,
}

/// Which retrieval strategy produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Semantic,
    Keyword,
    RawText,
    TopicDefault,
}

/// Recommendation request body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecommendationRequest {
    pub query: String,
    #[serde(default = "default_attempt")]
    pub attempt_count: u32,
}

fn default_attempt() -> u32 {
    1
}

/// Recommendation response.
///
/// Both the matched and the no-match shapes use this struct; the two marker
/// flags tell them apart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub remedy_name: String,
    pub dosage: String,
    pub preparation: String,
    pub image_url: Option<String>,
    pub raw_explanation: String,
    pub contraindications: String,
    pub parts_used: String,
    pub active_components: String,
    pub local_name_summary: String,
    #[serde(flatten)]
    pub sections: ExplanationSections,
    pub needs_more_details: bool,
    pub requires_consultation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation_source: Option<ExplanationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<MatchStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_row: Option<usize>,
}
