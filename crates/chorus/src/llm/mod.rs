pub mod anthropic;
pub mod openai;
pub mod retry;
pub mod types;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::llm::types::{ChatRequest, ChatResponse};

/// Trait for LLM providers.
///
/// Uses RPITIT, which means this trait is not dyn-compatible; use
/// [`BoxedProvider`] where dynamic dispatch is needed (the orchestrator
/// picks a provider per agent model at runtime).
pub trait LlmProvider: Send + Sync {
    fn chat(
        &self,
        request: ChatRequest,
    ) -> impl Future<Output = Result<ChatResponse, Error>> + Send;

    /// The model identifier this provider is bound to.
    fn model_name(&self) -> &str;
}

/// Object-safe adapter for [`LlmProvider`] (RPITIT → dyn). A blanket impl
/// covers all providers.
pub trait DynLlmProvider: Send + Sync {
    fn chat<'a>(
        &'a self,
        request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, Error>> + Send + 'a>>;

    fn model_name(&self) -> &str;
}

impl<P: LlmProvider> DynLlmProvider for P {
    fn chat<'a>(
        &'a self,
        request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse, Error>> + Send + 'a>> {
        Box::pin(LlmProvider::chat(self, request))
    }

    fn model_name(&self) -> &str {
        LlmProvider::model_name(self)
    }
}

/// Type-erased provider handle used throughout the orchestrator.
#[derive(Clone)]
pub struct BoxedProvider(Arc<dyn DynLlmProvider>);

impl BoxedProvider {
    pub fn new<P: LlmProvider + 'static>(provider: P) -> Self {
        Self(Arc::new(provider))
    }
}

impl LlmProvider for BoxedProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        self.0.chat(request).await
    }

    fn model_name(&self) -> &str {
        self.0.model_name()
    }
}

/// Model-id prefixes routed to the function-call (OpenAI-style) wire.
/// Everything else goes to the block-structured (Anthropic) wire.
pub const OPENAI_CHAT_PREFIXES: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt-"];

/// API credentials for the supported wire formats.
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
}

/// Build a provider for a model id, selecting the wire format by prefix.
pub fn provider_for_model(model: &str, keys: &ProviderKeys) -> Result<BoxedProvider, Error> {
    if OPENAI_CHAT_PREFIXES.iter().any(|p| model.starts_with(p)) {
        let key = keys
            .openai
            .as_deref()
            .ok_or_else(|| Error::Config("no OpenAI API key configured".into()))?;
        Ok(BoxedProvider::new(openai::OpenAiProvider::new(key, model)))
    } else {
        let key = keys
            .anthropic
            .as_deref()
            .ok_or_else(|| Error::Config("no Anthropic API key configured".into()))?;
        Ok(BoxedProvider::new(anthropic::AnthropicProvider::new(
            key, model,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ContentBlock, StopReason, Usage};

    struct FakeProvider;

    impl LlmProvider for FakeProvider {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, Error> {
            Ok(ChatResponse {
                content: vec![ContentBlock::Text { text: "fake".into() }],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                model: "fake-model".into(),
                raw_blocks: None,
            })
        }

        fn model_name(&self) -> &str {
            "fake-model"
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("", vec![types::Message::user("hi")])
    }

    #[tokio::test]
    async fn boxed_provider_delegates() {
        let provider = BoxedProvider::new(FakeProvider);
        let response = LlmProvider::chat(&provider, request()).await.unwrap();
        assert_eq!(response.text(), "fake");
        assert_eq!(LlmProvider::model_name(&provider), "fake-model");
    }

    #[test]
    fn boxed_provider_is_send_sync_clone() {
        fn assert_traits<T: Send + Sync + Clone>() {}
        assert_traits::<BoxedProvider>();
    }

    #[test]
    fn model_prefix_selects_wire() {
        let keys = ProviderKeys {
            anthropic: Some("ak".into()),
            openai: Some("ok".into()),
        };
        let p = provider_for_model("gpt-4o", &keys).unwrap();
        assert_eq!(LlmProvider::model_name(&p), "gpt-4o");
        let p = provider_for_model("claude-sonnet-4-20250514", &keys).unwrap();
        assert_eq!(LlmProvider::model_name(&p), "claude-sonnet-4-20250514");
    }

    #[test]
    fn missing_key_is_config_error() {
        let keys = ProviderKeys::default();
        assert!(provider_for_model("gpt-4o", &keys).is_err());
        assert!(provider_for_model("claude-3-haiku", &keys).is_err());
    }
}
