//! Chat-service gateway traits and the approval (ask) broker.
//!
//! The actual chat transport lives outside this crate; the orchestrator
//! talks to it through [`ChatGateway`] and [`AskUi`]. The broker adds the
//! policy the transport shouldn't have to know: per-channel serialization
//! of prompts, the 120-second deny-on-timeout, and only-the-invoker
//! resolution.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::tool_loop::AskOutcome;
use crate::error::Error;

pub type ChannelId = i64;
pub type MessageId = u64;

/// A status card rendered alongside (or instead of) plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCard {
    pub title: String,
    pub description: String,
    pub footer: Option<String>,
    /// Render hint: "info" while running, "error" on failures.
    pub tone: CardTone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardTone {
    Info,
    Error,
}

/// An outbound chat message: text, a card, or both.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub text: String,
    pub card: Option<StatusCard>,
    /// Message id this one replies to, if any.
    pub reply_to: Option<MessageId>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            card: None,
            reply_to: None,
        }
    }

    pub fn card(card: StatusCard) -> Self {
        Self {
            text: String::new(),
            card: Some(card),
            reply_to: None,
        }
    }
}

impl Default for StatusCard {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            footer: None,
            tone: CardTone::Info,
        }
    }
}

/// Narrow surface of the chat service.
pub trait ChatGateway: Send + Sync {
    fn send(
        &self,
        channel: ChannelId,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<MessageId, Error>> + Send + '_>>;

    fn edit(
        &self,
        channel: ChannelId,
        message_id: MessageId,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>;

    /// Update the service-wide presence/activity text.
    fn set_presence(
        &self,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>;
}

/// A pending approval prompt shown to the invoking user.
#[derive(Debug, Clone)]
pub struct AskPrompt {
    pub channel: ChannelId,
    /// Only this user may resolve the prompt.
    pub requester: i64,
    pub action: String,
    pub tool: String,
    pub arguments: String,
}

/// Interactive approval surface. An implementation shows Allow/Deny
/// controls bound to `requester`, resolves on the click, and disables the
/// controls afterwards (the broker handles the timeout).
pub trait AskUi: Send + Sync {
    fn ask(
        &self,
        prompt: AskPrompt,
    ) -> Pin<Box<dyn Future<Output = Result<bool, Error>> + Send + '_>>;
}

pub const ASK_TIMEOUT: Duration = Duration::from_secs(120);

/// Wraps an [`AskUi`] with per-channel serialization and deny-on-timeout.
pub struct AskBroker {
    ui: Arc<dyn AskUi>,
    timeout: Duration,
    channel_locks: Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AskBroker {
    pub fn new(ui: Arc<dyn AskUi>) -> Self {
        Self::with_timeout(ui, ASK_TIMEOUT)
    }

    pub fn with_timeout(ui: Arc<dyn AskUi>, timeout: Duration) -> Self {
        Self {
            ui,
            timeout,
            channel_locks: Mutex::new(HashMap::new()),
        }
    }

    fn channel_lock(&self, channel: ChannelId) -> Arc<tokio::sync::Mutex<()>> {
        self.channel_locks
            .lock()
            .expect("channel locks lock")
            .entry(channel)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Prompt for approval. One prompt at a time per channel; an
    /// unresolved prompt past the timeout denies.
    pub async fn ask(&self, prompt: AskPrompt) -> AskOutcome {
        let lock = self.channel_lock(prompt.channel);
        let _guard = lock.lock().await;

        match tokio::time::timeout(self.timeout, self.ui.ask(prompt)).await {
            Ok(Ok(true)) => AskOutcome::Approved,
            Ok(Ok(false)) => AskOutcome::Denied,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "ask UI failed, denying");
                AskOutcome::Denied
            }
            Err(_) => AskOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticAsk {
        answer: bool,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StaticAsk {
        fn new(answer: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer,
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    impl AskUi for StaticAsk {
        fn ask(
            &self,
            _prompt: AskPrompt,
        ) -> Pin<Box<dyn Future<Output = Result<bool, Error>> + Send + '_>> {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(self.answer)
            })
        }
    }

    fn prompt(channel: ChannelId) -> AskPrompt {
        AskPrompt {
            channel,
            requester: 7,
            action: "tool:bash:ls".into(),
            tool: "bash".into(),
            arguments: "{}".into(),
        }
    }

    #[tokio::test]
    async fn approve_and_deny_pass_through() {
        let broker = AskBroker::new(StaticAsk::new(true, Duration::ZERO));
        assert_eq!(broker.ask(prompt(1)).await, AskOutcome::Approved);

        let broker = AskBroker::new(StaticAsk::new(false, Duration::ZERO));
        assert_eq!(broker.ask(prompt(1)).await, AskOutcome::Denied);
    }

    #[tokio::test]
    async fn timeout_resolves_to_timed_out() {
        let broker = AskBroker::with_timeout(
            StaticAsk::new(true, Duration::from_secs(60)),
            Duration::from_millis(50),
        );
        assert_eq!(broker.ask(prompt(1)).await, AskOutcome::TimedOut);
    }

    #[tokio::test]
    async fn prompts_serialize_per_channel() {
        let ui = StaticAsk::new(true, Duration::from_millis(50));
        let broker = Arc::new(AskBroker::new(ui.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move { broker.ask(prompt(1)).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), AskOutcome::Approved);
        }
        assert_eq!(ui.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_channels_do_not_serialize() {
        let ui = StaticAsk::new(true, Duration::from_millis(50));
        let broker = Arc::new(AskBroker::new(ui.clone()));

        let a = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask(prompt(1)).await })
        };
        let b = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask(prompt(2)).await })
        };
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(ui.max_in_flight.load(Ordering::SeqCst), 2);
    }
}
