//! Open-ended chat over the active backend.
//!
//! Chat shares only the provider gate with the recommendation flow: no
//! retrieval, no sections. When the backend is unset or fails the reply comes
//! from [`crate::fallback::canned_chat_reply`] and `degraded` is set.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::fallback::canned_chat_reply;
use crate::provider::{GenerationOptions, ProviderId};
use crate::recommend::Engine;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    /// Backend that produced `response`; `None` when degraded.
    pub backend: Option<ProviderId>,
    pub degraded: bool,
    /// Seconds spent answering.
    pub processing_time: f64,
}

fn chat_prompt(message: &str) -> String {
    format!(
        "You are an expert in African herbal medicine with a warm, educational approach. \
         Answer the following question concisely, informatively and kindly, always putting patient \
         safety and accuracy first. If the question is about a specific treatment or particular \
         symptoms, politely suggest switching to the consultation mode for a more detailed, \
         personalised recommendation.\n\n\
         Question: {}\n\n\
         Answer warmly and professionally in at most 200 words.",
        message.trim()
    )
}

impl Engine {
    pub async fn chat(&self, message: &str) -> ChatResponse {
        let started = Instant::now();

        let (response, backend) = match self.gate().active().await {
            Some(handle) => {
                let options = GenerationOptions {
                    max_tokens: self.config().generation.chat_max_tokens,
                    temperature: self.config().generation.temperature,
                };
                match handle.instance.generate(&chat_prompt(message), &options).await {
                    Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), Some(handle.id)),
                    Ok(_) => {
                        warn!(provider = %handle.id, "empty chat reply, using canned response");
                        (canned_chat_reply(message).to_string(), None)
                    }
                    Err(e) => {
                        let err = PipelineError::ProviderGeneration(format!("{:#}", e));
                        warn!(provider = %handle.id, error = %err, "using canned chat response");
                        (canned_chat_reply(message).to_string(), None)
                    }
                }
            }
            None => {
                debug!("no generation backend active, using canned chat response");
                (canned_chat_reply(message).to_string(), None)
            }
        };

        ChatResponse {
            response,
            degraded: backend.is_none(),
            backend,
            processing_time: started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_prompt_embeds_question() {
        let prompt = chat_prompt("  What is neem used for? ");
        assert!(prompt.contains("Question: What is neem used for?\n"));
        assert!(prompt.contains("200 words"));
    }
}
