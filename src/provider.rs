//! Text-generation providers and the gate that holds the active one.
//!
//! Every backend implements [`TextGenerator`]. The set of backends is the
//! closed enum [`ProviderId`]; a [`GeneratorFactory`] turns an id plus a
//! credential into an instance, so tests can swap in fakes without touching
//! the gate.
//!
//! # Switching
//!
//! [`ProviderGate::set_active`] is replace-or-rollback:
//!
//! ```text
//! resolve credential → format check → construct → live probe → persist choice → swap handle
//! ```
//!
//! Any failing step returns an error and leaves the previously active handle
//! and the persisted choice untouched. Switches are serialized; in-flight
//! requests keep the `Arc` they already hold.
//!
//! # Credential probe
//!
//! | Probe outcome | Result |
//! |---------------|--------|
//! | 2xx | valid |
//! | 401 / 403 | invalid |
//! | other status, network error | valid (the format check already passed) |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{BackendConfig, GenerationConfig};
use crate::error::PipelineError;

/// Minimum plausible length for any API credential.
const MIN_CREDENTIAL_LEN: usize = 20;

// ═══════════════════════════════════════════════════════════════════════
// Provider identity
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderId {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "huggingface")]
    HuggingFace,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::OpenAi, ProviderId::HuggingFace];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::HuggingFace => "huggingface",
        }
    }

    /// Environment variable consulted when no credential is supplied.
    pub fn credential_env(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "OPENAI_API_KEY",
            ProviderId::HuggingFace => "HF_API_KEY",
        }
    }

    fn credential_prefix(&self) -> &'static str {
        match self {
            ProviderId::OpenAi => "sk-",
            ProviderId::HuggingFace => "hf_",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderId::OpenAi),
            "huggingface" | "hf" => Ok(ProviderId::HuggingFace),
            other => Err(format!(
                "unknown backend '{}'. Must be openai or huggingface.",
                other
            )),
        }
    }
}

/// Cheap structural check run before any network call.
pub fn check_credential_format(id: ProviderId, secret: &str) -> std::result::Result<(), String> {
    let secret = secret.trim();
    if !secret.starts_with(id.credential_prefix()) {
        return Err(format!(
            "{} credentials must start with '{}'",
            id,
            id.credential_prefix()
        ));
    }
    if secret.len() < MIN_CREDENTIAL_LEN {
        return Err(format!(
            "{} credential is too short ({} < {} characters)",
            id,
            secret.len(),
            MIN_CREDENTIAL_LEN
        ));
    }
    Ok(())
}

/// Explicit credential if non-blank, else the backend's environment variable.
pub fn resolve_credential(id: ProviderId, explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            std::env::var(id.credential_env())
                .ok()
                .filter(|s| !s.trim().is_empty())
        })
}

// ═══════════════════════════════════════════════════════════════════════
// Generator trait
// ═══════════════════════════════════════════════════════════════════════

/// Sampling knobs for one generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A text-generation backend.
///
/// `generate` is never retried by the pipeline; callers absorb its errors.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn id(&self) -> ProviderId;

    fn model(&self) -> &str;

    /// Live probe of `secret`. Network errors count as valid.
    async fn validate_credential(&self, secret: &str) -> bool;

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String>;
}

/// Builds generator instances from an id and a credential.
pub trait GeneratorFactory: Send + Sync {
    fn create(&self, id: ProviderId, credential: &str) -> Result<Arc<dyn TextGenerator>>;
}

// ============ OpenAI-compatible chat endpoint ============

/// HTTP plumbing shared by both hosted variants.
struct ChatEndpoint {
    model: String,
    base_url: String,
    probe_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ChatEndpoint {
    fn new(backend: &BackendConfig, api_key: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            model: backend.model.clone(),
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            probe_url: backend.probe_url.clone(),
            api_key: api_key.trim().to_string(),
            client,
        })
    }

    async fn probe(&self, label: ProviderId, secret: &str) -> bool {
        let resp = self
            .client
            .get(&self.probe_url)
            .header("Authorization", format!("Bearer {}", secret.trim()))
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status().as_u16();
                if status == 401 || status == 403 {
                    return false;
                }
                if !response.status().is_success() {
                    warn!(provider = %label, status, "credential probe inconclusive, accepting");
                }
                true
            }
            Err(e) => {
                warn!(provider = %label, error = %e, "credential probe unreachable, accepting");
                true
            }
        }
    }

    async fn complete(&self, label: ProviderId, prompt: &str, options: &GenerationOptions) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", label))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("{} API error {}: {}", label, status, body_text);
        }

        Ok(response.json().await?)
    }
}

/// `choices[0].message.content` of a chat-completions response.
fn parse_chat_completion(json: &serde_json::Value) -> Option<String> {
    json.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

fn non_empty(text: Option<String>, label: ProviderId) -> Result<String> {
    match text {
        Some(t) if !t.trim().is_empty() => Ok(t.trim().to_string()),
        Some(_) => bail!("{} returned an empty completion", label),
        None => bail!("{} returned a malformed completion", label),
    }
}

// ============ OpenAI ============

/// Hosted commercial backend (chat completions).
pub struct OpenAiGenerator {
    endpoint: ChatEndpoint,
}

impl OpenAiGenerator {
    pub fn new(backend: &BackendConfig, api_key: &str, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            endpoint: ChatEndpoint::new(backend, api_key, timeout_secs)?,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn validate_credential(&self, secret: &str) -> bool {
        if check_credential_format(ProviderId::OpenAi, secret).is_err() {
            return false;
        }
        self.endpoint.probe(ProviderId::OpenAi, secret).await
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let json = self.endpoint.complete(ProviderId::OpenAi, prompt, options).await?;
        non_empty(parse_chat_completion(&json), ProviderId::OpenAi)
    }
}

// ============ Hugging Face ============

/// Open-model backend served through the Hugging Face router.
///
/// Accepts both the chat-completions shape and the older text-generation
/// shape (`[{"generated_text": ...}]`) some endpoints still return.
pub struct HuggingFaceGenerator {
    endpoint: ChatEndpoint,
}

impl HuggingFaceGenerator {
    pub fn new(backend: &BackendConfig, api_key: &str, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            endpoint: ChatEndpoint::new(backend, api_key, timeout_secs)?,
        })
    }
}

fn parse_generated_text(json: &serde_json::Value) -> Option<String> {
    json.get(0)?
        .get("generated_text")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl TextGenerator for HuggingFaceGenerator {
    fn id(&self) -> ProviderId {
        ProviderId::HuggingFace
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn validate_credential(&self, secret: &str) -> bool {
        if check_credential_format(ProviderId::HuggingFace, secret).is_err() {
            return false;
        }
        self.endpoint.probe(ProviderId::HuggingFace, secret).await
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let json = self
            .endpoint
            .complete(ProviderId::HuggingFace, prompt, options)
            .await?;
        let text = parse_chat_completion(&json).or_else(|| parse_generated_text(&json));
        non_empty(text, ProviderId::HuggingFace)
    }
}

/// Factory for the real HTTP backends.
pub struct HttpGeneratorFactory {
    config: GenerationConfig,
}

impl HttpGeneratorFactory {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl GeneratorFactory for HttpGeneratorFactory {
    fn create(&self, id: ProviderId, credential: &str) -> Result<Arc<dyn TextGenerator>> {
        let backend = self.config.backend(id);
        let timeout = self.config.timeout_secs;
        Ok(match id {
            ProviderId::OpenAi => Arc::new(OpenAiGenerator::new(backend, credential, timeout)?),
            ProviderId::HuggingFace => {
                Arc::new(HuggingFaceGenerator::new(backend, credential, timeout)?)
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Health gate
// ═══════════════════════════════════════════════════════════════════════

/// The active backend.
#[derive(Clone)]
pub struct ProviderHandle {
    pub id: ProviderId,
    pub validated: bool,
    pub instance: Arc<dyn TextGenerator>,
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("validated", &self.validated)
            .field("model", &self.instance.model())
            .finish()
    }
}

/// Persisted backend choice. The credential itself is never written.
#[derive(Debug, Serialize, Deserialize)]
struct BackendChoice {
    llm_backend: ProviderId,
    updated_at: DateTime<Utc>,
}

/// Holds at most one active [`ProviderHandle`].
pub struct ProviderGate {
    factory: Arc<dyn GeneratorFactory>,
    state_path: PathBuf,
    active: RwLock<Option<ProviderHandle>>,
    switch_lock: Mutex<()>,
}

impl ProviderGate {
    pub fn new(factory: Arc<dyn GeneratorFactory>, state_path: &Path) -> Self {
        Self {
            factory,
            state_path: state_path.to_path_buf(),
            active: RwLock::new(None),
            switch_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the active handle.
    pub async fn active(&self) -> Option<ProviderHandle> {
        self.active.read().await.clone()
    }

    /// Validate and activate `id`, persisting the choice.
    ///
    /// On any failure the previous handle stays active.
    pub async fn set_active(
        &self,
        id: ProviderId,
        credential: Option<&str>,
    ) -> crate::error::Result<ProviderHandle> {
        self.activate(id, credential, true).await
    }

    /// Re-activate the persisted choice, or `default` when none was saved.
    ///
    /// Leaves the gate unset (with a warning) when that fails.
    pub async fn restore(&self, default: Option<ProviderId>) -> Option<ProviderHandle> {
        let choice = self.persisted_choice().or(default)?;
        match self.activate(choice, None, false).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(provider = %choice, error = %e, "could not restore generation backend, using templated explanations");
                None
            }
        }
    }

    /// The backend recorded on disk, if any.
    pub fn persisted_choice(&self) -> Option<ProviderId> {
        let content = std::fs::read_to_string(&self.state_path).ok()?;
        match serde_json::from_str::<BackendChoice>(&content) {
            Ok(choice) => Some(choice.llm_backend),
            Err(e) => {
                warn!(path = %self.state_path.display(), error = %e, "ignoring unreadable backend choice");
                None
            }
        }
    }

    async fn activate(
        &self,
        id: ProviderId,
        credential: Option<&str>,
        persist: bool,
    ) -> crate::error::Result<ProviderHandle> {
        let _guard = self.switch_lock.lock().await;

        let rejected = |reason: String| PipelineError::ProviderValidation {
            provider: id.to_string(),
            reason,
        };

        let secret = resolve_credential(id, credential).ok_or_else(|| {
            rejected(format!(
                "no credential supplied and {} is not set",
                id.credential_env()
            ))
        })?;
        check_credential_format(id, &secret).map_err(rejected)?;

        let instance = self
            .factory
            .create(id, &secret)
            .map_err(|e| rejected(format!("{:#}", e)))?;

        if !instance.validate_credential(&secret).await {
            return Err(rejected("credential rejected by the provider".to_string()));
        }

        if persist {
            write_choice(&self.state_path, id)
                .map_err(|e| PipelineError::Persistence(format!("{:#}", e)))?;
        }

        let handle = ProviderHandle {
            id,
            validated: true,
            instance,
        };
        *self.active.write().await = Some(handle.clone());
        info!(provider = %id, model = handle.instance.model(), "generation backend active");
        Ok(handle)
    }
}

/// Write the choice through a temporary file and rename it into place.
fn write_choice(path: &Path, id: ProviderId) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let choice = BackendChoice {
        llm_backend: id,
        updated_at: Utc::now(),
    };
    let temp_file = path.with_extension("tmp");
    std::fs::write(&temp_file, serde_json::to_vec_pretty(&choice)?)?;
    std::fs::rename(&temp_file, path)?;
    Ok(())
}
