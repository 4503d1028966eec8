//! End-to-end tests of the recommendation pipeline with in-process fakes.
//!
//! The embedding fake maps a small vocabulary onto one dimension per word,
//! so similarity is exact and predictable. The generation fake counts calls
//! and returns a scripted reply.

use anyhow::Result;
use async_trait::async_trait;
use remedy_harness::config::{parse_config, Config};
use remedy_harness::embedding::{DisabledProvider, EmbeddingProvider};
use remedy_harness::error::PipelineError;
use remedy_harness::fields::COMPONENTS_UNAVAILABLE;
use remedy_harness::index::IndexManager;
use remedy_harness::models::{
    ExplanationSource, MatchStrategy, RecommendationRequest, RecommendationResponse,
};
use remedy_harness::provider::{
    GenerationOptions, GeneratorFactory, ProviderId, TextGenerator,
};
use remedy_harness::recommend::{Engine, CLARIFICATION_REQUESTED, CONSULTATION_RECOMMENDED};
use remedy_harness::records::RecordStore;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

// ─── Fakes ──────────────────────────────────────────────────────────

const VOCAB: &[&str] = &[
    "hypertension",
    "malaria",
    "paludisme",
    "toux",
    "bronchite",
    "hibiscus",
    "artemisia",
    "eucalyptus",
];

/// One dimension per vocabulary word; unknown words are ignored.
struct VocabEmbedder;

#[async_trait]
impl EmbeddingProvider for VocabEmbedder {
    fn model_name(&self) -> &str {
        "vocab-test"
    }

    fn dims(&self) -> usize {
        VOCAB.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let lowered = text.to_lowercase();
                let mut v = vec![0.0f32; VOCAB.len()];
                for word in lowered.split(|c: char| !c.is_alphanumeric()) {
                    if let Some(i) = VOCAB.iter().position(|w| *w == word) {
                        v[i] += 1.0;
                    }
                }
                v
            })
            .collect())
    }
}

/// Counts embedding calls and holds each one long enough for callers to overlap.
struct CountingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn model_name(&self) -> &str {
        "vocab-test"
    }

    fn dims(&self) -> usize {
        VOCAB.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let inner = VocabEmbedder;
        inner.embed(texts).await
    }
}

enum Reply {
    Text(String),
    Fail,
}

struct ScriptedGenerator {
    id: ProviderId,
    reply: Arc<Reply>,
    calls: Arc<AtomicUsize>,
    accept: bool,
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn validate_credential(&self, _secret: &str) -> bool {
        self.accept
    }

    async fn generate(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.reply.as_ref() {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail => anyhow::bail!("quota exceeded"),
        }
    }
}

struct ScriptedFactory {
    reply: Arc<Reply>,
    calls: Arc<AtomicUsize>,
    created: AtomicUsize,
    reject: Option<ProviderId>,
}

impl ScriptedFactory {
    fn new(reply: Reply) -> Self {
        Self {
            reply: Arc::new(reply),
            calls: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
            reject: None,
        }
    }

    fn rejecting(mut self, id: ProviderId) -> Self {
        self.reject = Some(id);
        self
    }
}

impl GeneratorFactory for ScriptedFactory {
    fn create(&self, id: ProviderId, _credential: &str) -> Result<Arc<dyn TextGenerator>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedGenerator {
            id,
            reply: self.reply.clone(),
            calls: self.calls.clone(),
            accept: self.reject != Some(id),
        }))
    }
}

const OPENAI_KEY: &str = "sk-test-0123456789abcdefghij";
const HF_TOKEN: &str = "hf_test0123456789abcdefghij";

const FULL_REPLY: &str = "\
Possible diagnosis
Based on the symptoms you describe, you may be suffering from malaria.

Associated symptoms
Fever and chills.

Presentation of Artemisia annua
An ancient plant.

Mechanism of action
Artemisinin acts on the parasite.

Treatment information
Boil the leaves.

Precautions and contraindications
Not during pregnancy.

Active components
Artemisinin.

Treatment summary
Seven days.";

// ─── Setup ──────────────────────────────────────────────────────────

const CSV: &str = "\
maladiesoigneeparrecette,plante_recette,plante_quantite_recette,recette,plante_partie_recette,plante_composantechimique,recette_contreindication,plante_contreindication,plante_nomlocal,nomlocal_danslalangue,danslalangue_dupays,image_url
hypertension,Hibiscus sabdariffa,Hibiscus sabdariffa:20g,Infuse the calyces for 10 minutes,Calices,Hibiscus sabdariffa:anthocyanes,,Hypotension,Hibiscus sabdariffa:Bissap,Wolof,Senegal,
malaria;paludisme,Artemisia annua;Cassia occidentalis, Artemisia annua:10g;Cassia occidentalis:5g ,  Boil the leaves in 1L of water for 15 minutes,Feuilles,Artemisia annua:artemisinine;Cassia occidentalis:NULL,Pregnancy,,Artemisia annua:Armoise;Cassia occidentalis:Kassia,Fon;Yoruba,Benin,https://img.example/artemisia.png
toux;bronchite,Eucalyptus globulus,Eucalyptus globulus:5 leaves,Inhale the steam,Feuilles,Eucalyptus globulus:eucalyptol,,Asthma,,,,
";

fn test_config(root: &Path) -> Config {
    let content = format!(
        r#"
[data]
csv_path = "{root}/remedies.csv"

[index]
path = "{root}/index.sqlite"

[generation]
state_path = "{root}/llm_backend.json"

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );
    parse_config(&content).unwrap()
}

fn setup() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("remedies.csv"), CSV).unwrap();
    let cfg = test_config(tmp.path());
    (tmp, cfg)
}

fn engine(cfg: &Config, embedder: Arc<dyn EmbeddingProvider>, factory: Arc<ScriptedFactory>) -> Engine {
    Engine::with_parts(cfg.clone(), embedder, factory)
}

fn request(query: &str, attempt: u32) -> RecommendationRequest {
    RecommendationRequest {
        query: query.to_string(),
        attempt_count: attempt,
    }
}

fn touch_forward(path: &Path) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(120))
        .unwrap();
}

fn assert_complete(resp: &RecommendationResponse) {
    assert!(
        resp.sections.is_complete(),
        "incomplete sections: {:?}",
        resp.sections
    );
    assert!(!resp.raw_explanation.is_empty());
}

// ─── Lexical retrieval ──────────────────────────────────────────────

#[tokio::test]
async fn test_paludisme_resolves_lexically_without_index() {
    let (_tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Fail));
    let engine = engine(&cfg, Arc::new(DisabledProvider), factory);

    let resp = engine.recommend(&request("paludisme", 1)).await.unwrap();

    assert_eq!(resp.remedy_name, "Artemisia annua");
    // Raw cells, surrounding whitespace included.
    assert_eq!(resp.dosage, " Artemisia annua:10g;Cassia occidentalis:5g ");
    assert_eq!(resp.preparation, "  Boil the leaves in 1L of water for 15 minutes");
    assert_eq!(resp.matched_by, Some(MatchStrategy::Keyword));
    assert_eq!(resp.matched_row, Some(1));
    assert_eq!(resp.contraindications, "Pregnancy");
    assert_eq!(resp.active_components, "Artemisia annua: artemisinine");
    assert_eq!(
        resp.image_url.as_deref(),
        Some("https://img.example/artemisia.png")
    );
    assert!(resp.local_name_summary.contains("Armoise (Fon, Benin)"));
    assert!(!resp.needs_more_details);
    assert!(!resp.requires_consultation);
    assert_eq!(resp.explanation_source, Some(ExplanationSource::Fallback));
    assert_complete(&resp);
}

#[tokio::test]
async fn test_keyword_match_when_no_semantic_neighbor() {
    let (_tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Fail));
    let engine = engine(&cfg, Arc::new(VocabEmbedder), factory);

    // No vocabulary word: every neighbor scores zero.
    let resp = engine.recommend(&request("mal à la gorge", 1)).await.unwrap();
    assert_eq!(resp.matched_by, Some(MatchStrategy::Keyword));
    assert_eq!(resp.remedy_name, "Eucalyptus globulus");
}

#[tokio::test]
async fn test_semantic_match_preferred_when_index_available() {
    let (_tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Fail));
    let engine = engine(&cfg, Arc::new(VocabEmbedder), factory);

    let resp = engine.recommend(&request("bronchite", 1)).await.unwrap();
    assert_eq!(resp.matched_by, Some(MatchStrategy::Semantic));
    assert_eq!(resp.matched_row, Some(2));
}

// ─── Index staleness ────────────────────────────────────────────────

#[tokio::test]
async fn test_index_rebuilt_after_source_changes() {
    let (tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Fail));
    let engine = engine(&cfg, Arc::new(VocabEmbedder), factory);

    engine.recommend(&request("paludisme", 1)).await.unwrap();
    let first = engine.index_status().await;
    assert!(!first.stale);
    let first_meta = first.metadata.unwrap();
    assert_eq!(first_meta.document_count, 3);

    touch_forward(&tmp.path().join("remedies.csv"));
    assert!(engine.index_status().await.stale);

    engine.recommend(&request("paludisme", 1)).await.unwrap();
    let second = engine.index_status().await;
    assert!(!second.stale);
    let second_meta = second.metadata.unwrap();
    assert_ne!(first_meta.build_id, second_meta.build_id);
    assert!(second_meta.source_last_modified > first_meta.source_last_modified);
}

#[tokio::test]
async fn test_persisted_index_reused_by_new_engine() {
    let (_tmp, cfg) = setup();

    let first = engine(
        &cfg,
        Arc::new(VocabEmbedder),
        Arc::new(ScriptedFactory::new(Reply::Fail)),
    );
    let report = first.rebuild_index().await.unwrap();
    assert_eq!(report.document_count, 3);

    let second = engine(
        &cfg,
        Arc::new(VocabEmbedder),
        Arc::new(ScriptedFactory::new(Reply::Fail)),
    );
    second.recommend(&request("toux", 1)).await.unwrap();
    let meta = second.index_status().await.metadata.unwrap();
    assert_eq!(meta.build_id, report.build_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stale_callers_build_once() {
    let (tmp, _cfg) = setup();
    let records = Arc::new(RecordStore::load(&tmp.path().join("remedies.csv"), b','));
    let embedder = Arc::new(CountingEmbedder {
        calls: AtomicUsize::new(0),
    });
    let manager = Arc::new(IndexManager::new(
        &tmp.path().join("index.sqlite"),
        embedder.clone(),
        64,
    ));

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let manager = manager.clone();
        let records = records.clone();
        tasks.push(tokio::spawn(async move {
            manager.load_or_build(&records).await
        }));
    }

    let mut build_ids = Vec::new();
    for task in tasks {
        let index = task.await.unwrap().expect("index should be built");
        build_ids.push(index.metadata().build_id);
    }

    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert!(build_ids.iter().all(|id| *id == build_ids[0]));
}

#[tokio::test]
async fn test_rebuild_fails_with_embeddings_disabled() {
    let (_tmp, cfg) = setup();
    let engine = engine(
        &cfg,
        Arc::new(DisabledProvider),
        Arc::new(ScriptedFactory::new(Reply::Fail)),
    );
    let err = engine.rebuild_index().await.unwrap_err();
    assert!(matches!(err, PipelineError::IndexBuild(_)));
}

// ─── Generation ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_single_generation_call_per_recommendation() {
    let (_tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Text(FULL_REPLY.to_string())));
    let engine = engine(&cfg, Arc::new(DisabledProvider), factory.clone());
    engine
        .set_provider(ProviderId::OpenAi, Some(OPENAI_KEY))
        .await
        .unwrap();

    let resp = engine.recommend(&request("paludisme", 1)).await.unwrap();
    assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    assert_eq!(resp.explanation_source, Some(ExplanationSource::Provider));
    assert_eq!(resp.sections.associated_symptoms, "Fever and chills.");
    assert_eq!(resp.sections.treatment_summary, "Seven days.");
    assert_complete(&resp);

    engine.recommend(&request("toux", 1)).await.unwrap();
    assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_partial_output_is_backfilled() {
    let (_tmp, cfg) = setup();
    let reply = "Possible diagnosis\nMaybe malaria.\n\nTreatment summary\nRest and fluids.";
    let factory = Arc::new(ScriptedFactory::new(Reply::Text(reply.to_string())));
    let engine = engine(&cfg, Arc::new(DisabledProvider), factory.clone());
    engine
        .set_provider(ProviderId::OpenAi, Some(OPENAI_KEY))
        .await
        .unwrap();

    let resp = engine.recommend(&request("paludisme", 1)).await.unwrap();
    assert_eq!(resp.explanation_source, Some(ExplanationSource::Partial));
    assert_eq!(resp.sections.diagnosis, "Maybe malaria.");
    assert_eq!(resp.sections.treatment_summary, "Rest and fluids.");
    assert!(resp.sections.treatment_info.contains("Preparation: Boil the leaves"));
    assert_complete(&resp);
}

#[tokio::test]
async fn test_generation_failure_uses_template_without_retry() {
    let (_tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Fail));
    let engine = engine(&cfg, Arc::new(DisabledProvider), factory.clone());
    engine
        .set_provider(ProviderId::HuggingFace, Some(HF_TOKEN))
        .await
        .unwrap();

    let resp = engine.recommend(&request("paludisme", 1)).await.unwrap();
    assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    assert_eq!(resp.explanation_source, Some(ExplanationSource::Fallback));
    assert!(resp.sections.diagnosis.contains("MALARIA;PALUDISME"));
    assert!(resp.raw_explanation.starts_with("NOTICE:"));
    assert_complete(&resp);
}

#[tokio::test]
async fn test_raw_explanation_keeps_provider_text() {
    let (_tmp, cfg) = setup();
    let reply = "Here is my answer.\n\nPossible diagnosis\nMaybe malaria.\n\nTreatment summary\nRest.";
    let factory = Arc::new(ScriptedFactory::new(Reply::Text(reply.to_string())));
    let engine = engine(&cfg, Arc::new(DisabledProvider), factory);
    engine
        .set_provider(ProviderId::OpenAi, Some(OPENAI_KEY))
        .await
        .unwrap();

    let resp = engine.recommend(&request("paludisme", 1)).await.unwrap();
    assert_eq!(resp.explanation_source, Some(ExplanationSource::Partial));
    assert_eq!(resp.raw_explanation, reply);
    assert_eq!(resp.sections.diagnosis, "Maybe malaria.");
    assert_eq!(resp.sections.treatment_summary, "Rest.");
    assert_complete(&resp);
}

#[tokio::test]
async fn test_missing_components_use_generic_wording() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("remedies.csv"),
        "subject_terms,remedy_names,dosage,preparation,parts_used,active_components\n\
         toux,Eucalyptus globulus,5 leaves,Inhale the steam,Feuilles,\n",
    )
    .unwrap();
    let cfg = test_config(tmp.path());
    let engine = engine(
        &cfg,
        Arc::new(DisabledProvider),
        Arc::new(ScriptedFactory::new(Reply::Fail)),
    );

    let resp = engine.recommend(&request("toux", 1)).await.unwrap();
    assert_eq!(resp.active_components, COMPONENTS_UNAVAILABLE);
    let summary = &resp.sections.active_components_summary;
    assert!(summary.contains("traditional compounds"), "{}", summary);
    assert!(!summary.contains(COMPONENTS_UNAVAILABLE));
}

// ─── No-match policy ────────────────────────────────────────────────

#[tokio::test]
async fn test_two_attempt_no_match_policy() {
    let (_tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Text(FULL_REPLY.to_string())));
    let engine = engine(&cfg, Arc::new(VocabEmbedder), factory.clone());
    engine
        .set_provider(ProviderId::OpenAi, Some(OPENAI_KEY))
        .await
        .unwrap();

    for attempt in [0, 1] {
        let resp = engine
            .recommend(&request("sprained ankle", attempt))
            .await
            .unwrap();
        assert!(resp.needs_more_details);
        assert!(!resp.requires_consultation);
        assert_eq!(resp.remedy_name, CLARIFICATION_REQUESTED);
    }

    let resp = engine
        .recommend(&request("sprained ankle since monday", 2))
        .await
        .unwrap();
    assert!(resp.requires_consultation);
    assert!(!resp.needs_more_details);
    assert_eq!(resp.remedy_name, CONSULTATION_RECOMMENDED);

    // No-match responses never call the generator.
    assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_blank_query_against_empty_store_is_unprocessable() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path()); // no CSV written
    let engine = engine(
        &cfg,
        Arc::new(DisabledProvider),
        Arc::new(ScriptedFactory::new(Reply::Fail)),
    );

    let err = engine.recommend(&request("   ", 1)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Unprocessable(_)));

    // A real query against the empty store is just a miss.
    let resp = engine.recommend(&request("paludisme", 1)).await.unwrap();
    assert!(resp.needs_more_details);
}

#[tokio::test]
async fn test_blank_query_with_rows_asks_for_details() {
    let (_tmp, cfg) = setup();
    let engine = engine(
        &cfg,
        Arc::new(DisabledProvider),
        Arc::new(ScriptedFactory::new(Reply::Fail)),
    );
    let resp = engine.recommend(&request("", 1)).await.unwrap();
    assert!(resp.needs_more_details);
}

// ─── Provider switching ─────────────────────────────────────────────

#[tokio::test]
async fn test_failed_switch_keeps_previous_backend() {
    let (_tmp, cfg) = setup();
    let factory = Arc::new(
        ScriptedFactory::new(Reply::Text(FULL_REPLY.to_string())).rejecting(ProviderId::HuggingFace),
    );
    let engine = engine(&cfg, Arc::new(DisabledProvider), factory.clone());

    engine
        .set_provider(ProviderId::OpenAi, Some(OPENAI_KEY))
        .await
        .unwrap();
    assert_eq!(engine.gate().persisted_choice(), Some(ProviderId::OpenAi));

    // Rejected by the live probe.
    let err = engine
        .set_provider(ProviderId::HuggingFace, Some(HF_TOKEN))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ProviderValidation { .. }));

    // Malformed: rejected before any generator is built.
    let created = factory.created.load(Ordering::SeqCst);
    let err = engine
        .set_provider(ProviderId::OpenAi, Some("sk-short"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ProviderValidation { .. }));
    assert_eq!(factory.created.load(Ordering::SeqCst), created);

    let status = engine.provider_status().await;
    assert_eq!(status.llm_backend, Some(ProviderId::OpenAi));
    assert!(status.validated);
    assert_eq!(engine.gate().persisted_choice(), Some(ProviderId::OpenAi));

    let resp = engine.recommend(&request("paludisme", 1)).await.unwrap();
    assert_eq!(resp.explanation_source, Some(ExplanationSource::Provider));
}

#[tokio::test]
async fn test_persistence_failure_keeps_previous_backend() {
    let (tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Text(FULL_REPLY.to_string())));
    let engine = engine(&cfg, Arc::new(DisabledProvider), factory);

    engine
        .set_provider(ProviderId::OpenAi, Some(OPENAI_KEY))
        .await
        .unwrap();

    // A directory where the temporary state file goes makes the write fail.
    fs::create_dir(tmp.path().join("llm_backend.tmp")).unwrap();

    let err = engine
        .set_provider(ProviderId::HuggingFace, Some(HF_TOKEN))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Persistence(_)), "{:?}", err);

    let status = engine.provider_status().await;
    assert_eq!(status.llm_backend, Some(ProviderId::OpenAi));
    assert_eq!(engine.gate().persisted_choice(), Some(ProviderId::OpenAi));
}

#[tokio::test]
async fn test_restore_provider_leaves_index_cold() {
    let (_tmp, cfg) = setup();
    let engine = engine(
        &cfg,
        Arc::new(VocabEmbedder),
        Arc::new(ScriptedFactory::new(Reply::Fail)),
    );

    assert!(engine.restore_provider().await.is_none());
    let status = engine.index_status().await;
    assert!(!status.cached);
    assert!(status.metadata.is_none());

    engine.start().await;
    assert!(engine.index_status().await.cached);
}

// ─── Chat ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_degrades_without_backend() {
    let (_tmp, cfg) = setup();
    let engine = engine(
        &cfg,
        Arc::new(DisabledProvider),
        Arc::new(ScriptedFactory::new(Reply::Fail)),
    );
    let resp = engine.chat("Bonjour").await;
    assert!(resp.degraded);
    assert!(resp.backend.is_none());
    assert!(resp.response.starts_with("Hello!"));
    assert!(resp.processing_time >= 0.0);
}

#[tokio::test]
async fn test_chat_uses_active_backend() {
    let (_tmp, cfg) = setup();
    let factory = Arc::new(ScriptedFactory::new(Reply::Text("  Neem is bitter.  ".into())));
    let engine = engine(&cfg, Arc::new(DisabledProvider), factory.clone());
    engine
        .set_provider(ProviderId::OpenAi, Some(OPENAI_KEY))
        .await
        .unwrap();

    let resp = engine.chat("Tell me about neem").await;
    assert!(!resp.degraded);
    assert_eq!(resp.backend, Some(ProviderId::OpenAi));
    assert_eq!(resp.response, "Neem is bitter.");
    assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
}
