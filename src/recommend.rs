//! Recommendation orchestrator.
//!
//! [`Engine`] is the context object every surface (CLI, HTTP) shares. It owns
//! the knowledge base, the index manager and the provider gate; nothing in
//! the pipeline is global.
//!
//! # Request flow
//!
//! ```text
//! query ──▶ Retriever ──┬── no record, attempt 1  ──▶ clarification request
//!                       ├── no record, attempt ≥2 ──▶ consultation referral
//!                       └── record ──▶ one generate call ──┬── ok ──▶ extract + backfill
//!                                                         └── err / unset ──▶ templated sections
//! ```
//!
//! Every matched response carries all eight sections. The only hard error is
//! a blank query against an empty knowledge base.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::PipelineError;
use crate::fallback::{fallback_sections, render_explanation, FallbackInput};
use crate::fields;
use crate::index::{source_mtime, IndexManager, IndexStatus};
use crate::models::{
    ExplanationSections, ExplanationSource, RecommendationRequest, RecommendationResponse,
};
use crate::prompt::{extract_sections, merge_with_fallback, PromptFields};
use crate::provider::{
    resolve_credential, GenerationOptions, GeneratorFactory, HttpGeneratorFactory, ProviderGate,
    ProviderHandle, ProviderId,
};
use crate::records::RecordStore;
use crate::retriever::Retriever;

/// Remedy name returned with the first no-match response.
pub const CLARIFICATION_REQUESTED: &str = "clarification-requested";
/// Remedy name returned once the caller has already added details.
pub const CONSULTATION_RECOMMENDED: &str = "consultation-recommended";

const DETAILS_REQUIRED: &str = "Additional information required";
const CONSULTATION_REQUIRED: &str = "Professional consultation required";

const CLARIFICATION_MESSAGE: &str = "\
I could not identify a specific condition matching your symptoms in our current database.

Could you help me by giving more details about what you feel? For example:
• Since when have you had these symptoms?
• At what time of day are they strongest?
• Are there other signs that come with them?
• Do you have any particular pain or specific areas affected?

This additional information will help me point you to a suitable treatment.";

const REFERRAL_MESSAGE: &str = "\
Despite the extra details you provided, our current database does not let us recommend a specific treatment for your symptoms.

In this case, I strongly recommend that you:

**Consult a herbal medicine therapist:**
You can find qualified contacts on our home page with the \"Contact a therapist\" feature.

**Consult a doctor:**
To get an accurate medical diagnosis and an appropriate treatment.

Your health is precious, and it is important to get the opinion of a qualified health professional when our current resources are not enough to guide you.";

/// Knowledge base snapshot plus the source mtime it was read at.
struct LoadedRecords {
    store: Arc<RecordStore>,
    mtime: Option<i64>,
}

/// Result of an explicit index rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub status: &'static str,
    pub document_count: usize,
    pub built_at: DateTime<Utc>,
    pub build_id: Uuid,
}

/// Active backend and which credentials the environment provides.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub llm_backend: Option<ProviderId>,
    pub validated: bool,
    pub available_backends: Vec<ProviderId>,
    pub has_openai_key: bool,
    pub has_hf_key: bool,
}

pub struct Engine {
    config: Config,
    records: RwLock<LoadedRecords>,
    index: IndexManager,
    gate: ProviderGate,
}

impl Engine {
    /// Build an engine from configuration with the HTTP-backed providers.
    pub fn open(config: Config) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let factory = Arc::new(HttpGeneratorFactory::new(&config.generation));
        Ok(Self::with_parts(config, embedder, factory))
    }

    /// Build an engine with explicit embedding and generation backends.
    pub fn with_parts(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        factory: Arc<dyn GeneratorFactory>,
    ) -> Self {
        let store = RecordStore::load(&config.data.csv_path, config.data.delimiter_byte());
        let mtime = source_mtime(&config.data.csv_path).ok();
        let index = IndexManager::new(&config.index.path, embedder, config.embedding.batch_size);
        let gate = ProviderGate::new(factory, &config.generation.state_path);
        Self {
            records: RwLock::new(LoadedRecords {
                store: Arc::new(store),
                mtime,
            }),
            index,
            gate,
            config,
        }
    }

    /// Restore the persisted backend and warm the index.
    pub async fn start(&self) {
        self.restore_provider().await;

        let records = self.records().await;
        if let Some(index) = self.index.load_or_build(&records).await {
            info!(documents = index.len(), "vector index ready");
        }
    }

    /// Re-activate the persisted or configured backend without touching the index.
    pub async fn restore_provider(&self) -> Option<ProviderHandle> {
        let default = self
            .config
            .generation
            .default_backend
            .as_deref()
            .and_then(|s| s.parse::<ProviderId>().ok());
        self.gate.restore(default).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gate(&self) -> &ProviderGate {
        &self.gate
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    /// Current knowledge base, reloaded first if the source file changed.
    pub async fn records(&self) -> Arc<RecordStore> {
        let fresh = source_mtime(&self.config.data.csv_path).ok();
        {
            let loaded = self.records.read().await;
            if loaded.mtime == fresh {
                return loaded.store.clone();
            }
        }

        let mut loaded = self.records.write().await;
        if loaded.mtime != fresh {
            info!(path = %self.config.data.csv_path.display(), "knowledge base changed on disk, reloading");
            loaded.store = Arc::new(RecordStore::load(
                &self.config.data.csv_path,
                self.config.data.delimiter_byte(),
            ));
            loaded.mtime = fresh;
        }
        loaded.store.clone()
    }

    // ============ Recommendation ============

    pub async fn recommend(
        &self,
        request: &RecommendationRequest,
    ) -> crate::error::Result<RecommendationResponse> {
        let records = self.records().await;
        let query = request.query.trim();
        if query.is_empty() && records.is_empty() {
            return Err(PipelineError::Unprocessable(
                "empty query and the knowledge base has no rows".to_string(),
            ));
        }
        let attempt = request.attempt_count.max(1);

        let index = self.index.load_or_build(&records).await;
        let retriever = Retriever::new(
            &records,
            index.as_deref(),
            self.index.embedder(),
            self.config.retrieval.top_k,
        )
        .with_min_score(self.config.retrieval.min_score);

        let Some(hit) = retriever.retrieve(query).await else {
            info!(attempt, "no matching remedy");
            return Ok(no_match_response(attempt));
        };
        debug!(row = hit.row_index, strategy = ?hit.strategy, "remedy matched");

        let record = &hit.record;
        let remedy_name = fields::remedy_name(record);
        let pathology = fields::pathology_label(query, record);
        let components = fields::format_components(&record.active_components);
        let contraindications = fields::contraindications(record);
        let parts_used = or_placeholder(&record.parts_used, "Part not specified");

        let fallback = fallback_sections(FallbackInput {
            symptoms: query,
            remedy_name: &remedy_name,
            pathology: &pathology,
            preparation: &or_placeholder(&record.preparation, "Preparation not specified"),
            dosage: &or_placeholder(&record.dosage, "Dosage not specified"),
            parts_used: &parts_used,
            contraindications: &contraindications,
            components: if components == fields::COMPONENTS_UNAVAILABLE {
                ""
            } else {
                components.as_str()
            },
        });

        let provider = self.gate.active().await;
        let generated = match provider {
            Some(handle) => {
                let prompt =
                    PromptFields::from_record(query, record, &pathology, &components).render();
                self.explain(&handle, &prompt, &fallback).await
            }
            None => {
                debug!("no generation backend active, using templated explanation");
                None
            }
        };
        let (sections, source, raw_explanation) = match generated {
            Some((sections, source, text)) => (sections, source, text),
            None => {
                let text = render_explanation(&fallback);
                (fallback, ExplanationSource::Fallback, text)
            }
        };

        Ok(RecommendationResponse {
            remedy_name,
            dosage: record.dosage.clone(),
            preparation: record.preparation.clone(),
            image_url: record.image_url.clone().filter(|u| !u.trim().is_empty()),
            raw_explanation,
            contraindications,
            parts_used,
            active_components: components,
            local_name_summary: fields::local_name_summary(record),
            sections,
            needs_more_details: false,
            requires_consultation: false,
            explanation_source: Some(source),
            matched_by: Some(hit.strategy),
            matched_row: Some(hit.row_index),
        })
    }

    /// The single generation call of a recommendation.
    ///
    /// Returns the merged sections together with the provider's own text, or
    /// `None` when generation failed.
    async fn explain(
        &self,
        handle: &ProviderHandle,
        prompt: &str,
        fallback: &ExplanationSections,
    ) -> Option<(ExplanationSections, ExplanationSource, String)> {
        let options = GenerationOptions {
            max_tokens: self.config.generation.max_tokens,
            temperature: self.config.generation.temperature,
        };
        match handle.instance.generate(prompt, &options).await {
            Ok(text) if text.trim().is_empty() => {
                warn!(provider = %handle.id, "empty generation, using templated explanation");
                None
            }
            Ok(text) => {
                let (sections, source) = merge_with_fallback(extract_sections(&text), fallback);
                if source != ExplanationSource::Provider {
                    debug!(?source, "provider output incomplete, backfilled from template");
                }
                Some((sections, source, text))
            }
            Err(e) => {
                let err = PipelineError::ProviderGeneration(format!("{:#}", e));
                warn!(provider = %handle.id, error = %err, "using templated explanation");
                None
            }
        }
    }

    // ============ Admin ============

    /// Rebuild the vector index from the current knowledge base.
    pub async fn rebuild_index(&self) -> crate::error::Result<RebuildReport> {
        let records = self.records().await;
        let index = self.index.build(&records).await?;
        let meta = index.metadata();
        Ok(RebuildReport {
            status: "success",
            document_count: meta.document_count,
            built_at: meta.built_at,
            build_id: meta.build_id,
        })
    }

    pub async fn index_status(&self) -> IndexStatus {
        self.index.status(&self.config.data.csv_path).await
    }

    pub async fn set_provider(
        &self,
        id: ProviderId,
        credential: Option<&str>,
    ) -> crate::error::Result<ProviderHandle> {
        self.gate.set_active(id, credential).await
    }

    pub async fn provider_status(&self) -> ProviderStatus {
        let active = self.gate.active().await;
        ProviderStatus {
            llm_backend: active.as_ref().map(|h| h.id),
            validated: active.as_ref().is_some_and(|h| h.validated),
            available_backends: ProviderId::ALL.to_vec(),
            has_openai_key: resolve_credential(ProviderId::OpenAi, None).is_some(),
            has_hf_key: resolve_credential(ProviderId::HuggingFace, None).is_some(),
        }
    }
}

fn or_placeholder(value: &str, placeholder: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        placeholder.to_string()
    } else {
        value.to_string()
    }
}

/// Two-attempt no-match policy. The attempt counter is owned by the caller.
pub fn no_match_response(attempt: u32) -> RecommendationResponse {
    if attempt <= 1 {
        RecommendationResponse {
            remedy_name: CLARIFICATION_REQUESTED.to_string(),
            dosage: DETAILS_REQUIRED.to_string(),
            preparation: DETAILS_REQUIRED.to_string(),
            raw_explanation: CLARIFICATION_MESSAGE.to_string(),
            contraindications: "Please provide more details about your symptoms".to_string(),
            parts_used: DETAILS_REQUIRED.to_string(),
            active_components: DETAILS_REQUIRED.to_string(),
            needs_more_details: true,
            ..Default::default()
        }
    } else {
        RecommendationResponse {
            remedy_name: CONSULTATION_RECOMMENDED.to_string(),
            dosage: CONSULTATION_REQUIRED.to_string(),
            preparation: CONSULTATION_REQUIRED.to_string(),
            raw_explanation: REFERRAL_MESSAGE.to_string(),
            contraindications: "Consult a health professional".to_string(),
            parts_used: CONSULTATION_REQUIRED.to_string(),
            active_components: CONSULTATION_REQUIRED.to_string(),
            requires_consultation: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_asks_for_details() {
        let resp = no_match_response(1);
        assert!(resp.needs_more_details);
        assert!(!resp.requires_consultation);
        assert_eq!(resp.remedy_name, CLARIFICATION_REQUESTED);
        assert!(resp.raw_explanation.contains("Since when"));
        assert!(resp.explanation_source.is_none());
    }

    #[test]
    fn test_later_attempts_refer_to_professional() {
        for attempt in [2, 3, 10] {
            let resp = no_match_response(attempt);
            assert!(resp.requires_consultation);
            assert!(!resp.needs_more_details);
            assert_eq!(resp.remedy_name, CONSULTATION_RECOMMENDED);
            assert!(resp.raw_explanation.contains("Contact a therapist"));
        }
    }

    #[test]
    fn test_placeholder_for_blank_values() {
        assert_eq!(or_placeholder("  ", "none"), "none");
        assert_eq!(or_placeholder(" 10g ", "none"), "10g");
    }
}
