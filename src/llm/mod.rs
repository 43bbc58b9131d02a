//! Generation-service boundary
//!
//! This module handles:
//! - The `GenerationService` seam and its HTTP implementation
//! - Report-section prompt rendering
//! - The explicit no-data degradation decision

mod client;
mod prompts;

pub use client::{LlmApi, LlmClient, LlmConfig, LlmResponse};
pub use prompts::{section_title, SectionPrompt};

use crate::assemble::{AssembledContext, PromptPayload};
use crate::config::{GenerationConfig, NoDataPolicy};
use crate::corpus::FinancialContext;
use crate::error::Result;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Free text returned by a generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    /// False when the backend answered but produced nothing usable
    pub success: bool,
    pub model: String,
    pub tokens_used: Option<usize>,
}

/// External text generator for report sections
#[async_trait]
pub trait GenerationService: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(&self, payload: &PromptPayload) -> Result<Generation>;
}

/// Build the configured generator; `None` means the generate stage is skipped
pub fn generator_from_config(
    config: &GenerationConfig,
    retry: RetryPolicy,
) -> Result<Option<Arc<dyn GenerationService>>> {
    Ok(LlmConfig::from_generation(config)?
        .map(|llm| Arc::new(LlmClient::new(llm, retry)) as Arc<dyn GenerationService>))
}

/// What to do with one assembled section
#[derive(Debug, Clone, PartialEq)]
pub enum SectionPlan {
    /// Call the generator with this payload
    Generate(PromptPayload),
    /// Leave the section out, with the reason recorded in the report
    Skip(String),
}

/// Apply the no-data policy to an assembled context. Grounded contexts are
/// always generated; empty ones follow `no_data_policy`.
pub fn plan_section(
    context: &AssembledContext,
    financial_context: &FinancialContext,
    config: &GenerationConfig,
) -> SectionPlan {
    let payload = context.payload(financial_context);
    if !context.no_data {
        return SectionPlan::Generate(payload);
    }

    match config.no_data_policy {
        NoDataPolicy::SkipSection => {
            SectionPlan::Skip("no grounded context (policy: skip_section)".to_string())
        }
        NoDataPolicy::MetricsOnly if financial_context.is_empty() => SectionPlan::Skip(
            "no grounded context and no structured metrics (policy: metrics_only)".to_string(),
        ),
        NoDataPolicy::MetricsOnly => SectionPlan::Generate(payload),
        NoDataPolicy::Ungrounded if config.allow_ungrounded => SectionPlan::Generate(payload),
        NoDataPolicy::Ungrounded => SectionPlan::Skip(
            "ungrounded generation requested but allow_ungrounded is false".to_string(),
        ),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::PipelineError;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Deterministic generator that records calls and can fail per intent
    pub struct ScriptedGenerator {
        failing: Mutex<HashSet<String>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub fn new() -> Self {
            Self {
                failing: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing_for(self, intent: &str) -> Self {
            self.failing.lock().unwrap().insert(intent.to_string());
            self
        }

        pub fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        /// `<ticker>:<intent>` per call, in call order
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerationService for ScriptedGenerator {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, payload: &PromptPayload) -> Result<Generation> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", payload.ticker, payload.intent_label));

            if self.failing.lock().unwrap().contains(&payload.intent_label) {
                return Err(PipelineError::backend("generation", "model still loading"));
            }

            let markers: String = (1..=payload.citations.len())
                .map(|n| format!("[{}]", n))
                .collect();
            Ok(Generation {
                text: format!("{} {} analysis {}", payload.ticker, payload.intent_label, markers)
                    .trim_end()
                    .to_string(),
                success: true,
                model: "scripted".to_string(),
                tokens_used: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationProviderKind;

    fn empty_context() -> AssembledContext {
        AssembledContext::empty("risk_factors", "NEWCO", 6000)
    }

    fn metrics() -> FinancialContext {
        let mut context = FinancialContext::default();
        context.metrics.insert("free_cash_flow".to_string(), -2.0);
        context
    }

    #[test]
    fn test_no_generator_when_provider_none() {
        let retry = RetryPolicy::from_config(&Default::default());
        let generator = generator_from_config(&GenerationConfig::default(), retry.clone()).unwrap();
        assert!(generator.is_none());

        let config = GenerationConfig {
            provider: GenerationProviderKind::Ollama,
            ..Default::default()
        };
        let generator = generator_from_config(&config, retry).unwrap().unwrap();
        assert_eq!(generator.model(), "llama3");
    }

    #[test]
    fn test_skip_section_is_default_policy() {
        let plan = plan_section(&empty_context(), &metrics(), &GenerationConfig::default());
        assert!(matches!(plan, SectionPlan::Skip(reason) if reason.contains("skip_section")));
    }

    #[test]
    fn test_metrics_only_generates_ungrounded_payload() {
        let config = GenerationConfig {
            no_data_policy: NoDataPolicy::MetricsOnly,
            ..Default::default()
        };

        match plan_section(&empty_context(), &metrics(), &config) {
            SectionPlan::Generate(payload) => {
                assert!(!payload.grounded);
                assert!(payload.passages.is_empty());
                assert_eq!(payload.financial_context, vec!["free_cash_flow=-2"]);
            }
            other => panic!("expected generation, got {:?}", other),
        }

        let plan = plan_section(&empty_context(), &FinancialContext::default(), &config);
        assert!(matches!(plan, SectionPlan::Skip(_)));
    }

    #[test]
    fn test_ungrounded_requires_compliance_flag() {
        let mut config = GenerationConfig {
            no_data_policy: NoDataPolicy::Ungrounded,
            ..Default::default()
        };
        let plan = plan_section(&empty_context(), &FinancialContext::default(), &config);
        assert!(matches!(plan, SectionPlan::Skip(reason) if reason.contains("allow_ungrounded")));

        config.allow_ungrounded = true;
        let plan = plan_section(&empty_context(), &FinancialContext::default(), &config);
        assert!(matches!(plan, SectionPlan::Generate(p) if !p.grounded));
    }

    #[tokio::test]
    async fn test_scripted_generator() {
        use test_support::ScriptedGenerator;

        let generator = ScriptedGenerator::new().failing_for("guidance");
        let mut payload = empty_context().payload(&FinancialContext::default());
        assert!(generator.generate(&payload).await.is_ok());

        payload.intent_label = "guidance".to_string();
        assert!(generator.generate(&payload).await.is_err());
        generator.heal();
        assert!(generator.generate(&payload).await.unwrap().success);
        assert_eq!(generator.calls().len(), 3);
    }
}
