//! Relay Core
//!
//! Runtime that ties the gate, context assembly, search, commands and reply
//! dispatch together

pub mod commands;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod voice;

pub use error::{user_facing, RelayError};
pub use session::Session;

use anyhow::Result;
use commands::{Command, Parsed};
use context::{keeps_history, ContextAssembler};
use dispatch::{Dispatcher, ReplyTarget};
use relay_config::Config;
use relay_ipc::{Attachment, EventBus, InboundEvent, ReplySink};
use relay_policy::{AccessGate, GateDecision, Role, Scope};
use relay_providers::{
    BillingSource, ChatMessage, ChatOptions, OpenAIBilling, OpenAICompatibleProvider, Provider,
    RetryPolicy, WhisperTranscriber,
};
use relay_search::{
    trigger_from_config, GoogleCustomSearch, SearchAggregator, SearchTrigger, Synthesizer,
    WebSearch,
};
use relay_telegram::TelegramAdapter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use voice::{FfmpegConverter, VoicePipeline};

const MAX_INBOUND_CONCURRENCY: usize = 8;
const MODEL_SERVICE: &str = "openai";
const SCOPE_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// External services the runtime talks to.
pub struct Collaborators {
    pub provider: Arc<dyn Provider>,
    pub trigger: Arc<dyn SearchTrigger>,
    pub search: Option<SearchAggregator>,
    pub billing: Arc<dyn BillingSource>,
    pub voice: VoicePipeline,
    pub sink: Arc<dyn ReplySink>,
}

/// Accepted message, as decided by the gate.
#[derive(Debug, Clone, Copy)]
struct MessageContext {
    principal: i64,
    role: Role,
    scope: Scope,
    target: ReplyTarget,
}

impl MessageContext {
    fn remember<'a>(&self, answer: &'a str) -> Option<(i64, &'a str)> {
        keeps_history(self.role, self.scope).then_some((self.principal, answer))
    }
}

struct ScopedJob {
    event: InboundEvent,
    ctx: MessageContext,
}

struct ScopeWorker {
    queue: mpsc::UnboundedSender<ScopedJob>,
    handle: JoinHandle<()>,
}

pub struct RelayRuntime {
    gate: AccessGate,
    session: Arc<Session>,
    assembler: ContextAssembler,
    provider: Arc<dyn Provider>,
    trigger: Arc<dyn SearchTrigger>,
    search: Option<SearchAggregator>,
    billing: Arc<dyn BillingSource>,
    voice: VoicePipeline,
    dispatcher: Dispatcher,
    event_bus: EventBus,
    telegram: Option<Arc<TelegramAdapter>>,
}

impl RelayRuntime {
    /// Wires the production services from configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let event_bus = EventBus::new();
        let data_dir = config.data_dir()?;
        let openai = &config.openai;

        let provider: Arc<dyn Provider> = Arc::new(
            OpenAICompatibleProvider::new(
                MODEL_SERVICE.to_string(),
                openai.api_key.clone(),
                Some(openai.base_url.clone()),
                Duration::from_secs(openai.request_timeout_secs),
            )?
            .with_retry_policy(RetryPolicy {
                window_secs: openai.retry.window_secs,
                initial_delay_secs: openai.retry.initial_delay_secs,
                backoff_factor: openai.retry.backoff_factor,
                max_delay_secs: openai.retry.max_delay_secs,
            }),
        );

        let telegram = Arc::new(
            TelegramAdapter::new(&config.telegram, data_dir)?.with_event_bus(event_bus.clone()),
        );

        let transcriber = Arc::new(WhisperTranscriber::new(
            openai.api_key.clone(),
            &openai.base_url,
            openai.transcription_model.clone(),
            Duration::from_secs(openai.request_timeout_secs),
        )?);
        let billing = Arc::new(OpenAIBilling::new(
            openai.api_key.clone(),
            openai.billing_url.clone(),
            Duration::from_secs(openai.billing_timeout_secs),
        )?);

        let search = if config.search.is_enabled() {
            let backend = Arc::new(GoogleCustomSearch::new(&config.search)?);
            Some(SearchAggregator::new(
                WebSearch::new(backend, &config.search),
                Synthesizer::new(Arc::clone(&provider)),
            ))
        } else {
            info!("Web search disabled: search.api_key/search.cx not configured");
            None
        };
        let trigger = trigger_from_config(
            config.search.trigger_strategy()?,
            &config.search.keywords,
            Arc::clone(&provider),
        );

        let collaborators = Collaborators {
            provider,
            trigger,
            search,
            billing,
            voice: VoicePipeline::new(
                telegram.clone(),
                Arc::new(FfmpegConverter),
                transcriber,
            ),
            sink: telegram.clone(),
        };

        let mut runtime = Self::build(config, collaborators, event_bus)?;
        runtime.telegram = Some(telegram);
        Ok(runtime)
    }

    /// Runtime over caller-supplied services, without a chat adapter.
    pub fn with_collaborators(config: &Config, collaborators: Collaborators) -> Result<Self> {
        Self::build(config, collaborators, EventBus::new())
    }

    fn build(config: &Config, parts: Collaborators, event_bus: EventBus) -> Result<Self> {
        let gate = AccessGate::new(&config.telegram);
        let session = Arc::new(Session::new(&config.openai.model, config.history.capacity)?);
        info!(
            "Relay runtime configured (model={}, search={}, trigger={})",
            config.openai.model,
            parts.search.is_some(),
            parts.trigger.name()
        );
        Ok(Self {
            assembler: ContextAssembler::new(gate.bot_username()),
            gate,
            dispatcher: Dispatcher::new(parts.sink, Arc::clone(&session)),
            session,
            provider: parts.provider,
            trigger: parts.trigger,
            search: parts.search,
            billing: parts.billing,
            voice: parts.voice,
            event_bus,
            telegram: None,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("Relay runtime starting...");

        let mut inbound_rx = self.event_bus.subscribe();

        if let Some(telegram) = &self.telegram {
            let telegram = Arc::clone(telegram);
            tokio::spawn(async move {
                if let Err(e) = telegram.poll().await {
                    error!("Telegram adapter stopped: {}", e);
                }
            });
        }

        let mut workers: HashMap<String, ScopeWorker> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY));

        loop {
            tokio::select! {
                result = inbound_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Some(ctx) = self.admit(&event) {
                                self.enqueue(&mut workers, &semaphore, ScopedJob { event, ctx });
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping message processor");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event bus lagged by {} messages", n);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping relay runtime");
                    break;
                }
            }
        }

        Ok(())
    }

    /// One queue per chat: a private chat id is the principal id, so history
    /// updates for a principal happen in arrival order.
    fn inbound_scope_key(event: &InboundEvent) -> String {
        match event.chat_id() {
            Some(chat_id) => format!("{}:{}", event.channel, chat_id),
            None => format!("{}:unknown", event.channel),
        }
    }

    /// Hands an admitted event to its scope's worker, starting one when the
    /// scope has none or its worker is winding down after idling.
    fn enqueue(
        self: &Arc<Self>,
        workers: &mut HashMap<String, ScopeWorker>,
        semaphore: &Arc<Semaphore>,
        job: ScopedJob,
    ) {
        workers.retain(|_, worker| !worker.handle.is_finished());

        let scope_key = Self::inbound_scope_key(&job.event);
        let job = match workers.get(&scope_key) {
            Some(worker) => match worker.queue.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let previous = workers.remove(&scope_key).map(|worker| worker.handle);
        let (queue, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Arc::clone(self).drain_scope(
            scope_key.clone(),
            job,
            rx,
            previous,
            Arc::clone(semaphore),
        ));
        workers.insert(scope_key, ScopeWorker { queue, handle });
    }

    /// Processes one scope's events strictly one after another. A worker that
    /// replaces an idle one waits for it to finish first.
    async fn drain_scope(
        self: Arc<Self>,
        scope_key: String,
        first: ScopedJob,
        mut queue: mpsc::UnboundedReceiver<ScopedJob>,
        previous: Option<JoinHandle<()>>,
        semaphore: Arc<Semaphore>,
    ) {
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                error!("Previous worker for scope {} failed: {}", scope_key, e);
            }
        }

        let mut next = Some(first);
        let mut closing = false;
        loop {
            let job = match next.take() {
                Some(job) => job,
                None if closing => match queue.recv().await {
                    Some(job) => job,
                    None => break,
                },
                None => match tokio::time::timeout(SCOPE_IDLE_TIMEOUT, queue.recv()).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(_) => {
                        debug!("Scope {} idle, closing its worker", scope_key);
                        queue.close();
                        closing = true;
                        continue;
                    }
                },
            };

            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(err) => {
                    error!(
                        "Inbound worker semaphore closed (trace_id={}): {}",
                        job.event.trace_id, err
                    );
                    return;
                }
            };
            self.handle_admitted(job.event, job.ctx).await;
        }
    }

    /// Runs the gate. Every evaluation is audit-logged by the gate itself.
    fn admit(&self, event: &InboundEvent) -> Option<MessageContext> {
        let GateDecision::Allow {
            principal,
            role,
            scope,
        } = self.gate.evaluate(event)
        else {
            return None;
        };
        let chat_id = event.chat_id()?;
        Some(MessageContext {
            principal,
            role,
            scope,
            target: ReplyTarget {
                chat_id,
                reply_to: event.message_id,
            },
        })
    }

    /// Full handling of one inbound event. Denied events end silently; any
    /// failure after the gate becomes an error reply.
    pub async fn handle_event(&self, event: InboundEvent) {
        if let Some(ctx) = self.admit(&event) {
            self.handle_admitted(event, ctx).await;
        }
    }

    async fn handle_admitted(&self, event: InboundEvent, ctx: MessageContext) {
        if let Err(err) = self.process(&event, &ctx).await {
            error!(
                "Error processing inbound message (trace_id={}): {:#}",
                event.trace_id, err
            );
            self.dispatcher.send_error(ctx.target, &err).await;
        }
    }

    async fn process(&self, event: &InboundEvent, ctx: &MessageContext) -> Result<()> {
        match &event.attachment {
            Some(Attachment::Unsupported { media }) => {
                info!("Unsupported {} attachment (trace_id={})", media, event.trace_id);
                return self
                    .dispatcher
                    .send(ctx.target, commands::UNSUPPORTED_ATTACHMENT)
                    .await;
            }
            Some(Attachment::Voice {
                file_id, mime_type, ..
            }) => {
                return self
                    .handle_voice(event, ctx, file_id, mime_type.as_deref())
                    .await;
            }
            None => {}
        }

        let text = event.text_or_caption();
        match commands::parse(text, self.gate.bot_username()) {
            Parsed::Foreign => {
                debug!("Ignoring command addressed to another bot (trace_id={})", event.trace_id);
                Ok(())
            }
            Parsed::Command(command) => self.handle_command(command, ctx).await,
            Parsed::Text => {
                let _typing = self.dispatcher.start_typing(ctx.target.chat_id);
                let answer = self.answer(event, ctx, text).await?;
                self.dispatcher
                    .respond(ctx.target, &answer, ctx.remember(&answer))
                    .await
            }
        }
    }

    async fn handle_voice(
        &self,
        event: &InboundEvent,
        ctx: &MessageContext,
        file_id: &str,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let _typing = self.dispatcher.start_typing(ctx.target.chat_id);
        let transcript = self.voice.transcribe(file_id, mime_type).await?;
        if transcript.is_empty() {
            return self
                .dispatcher
                .send(ctx.target, commands::EMPTY_TRANSCRIPT)
                .await;
        }
        info!("Voice transcript (trace_id={}): {}", event.trace_id, transcript);

        let answer = self.answer(event, ctx, &transcript).await?;
        self.dispatcher
            .respond(
                ctx.target,
                &commands::voice_reply_text(&transcript, &answer),
                ctx.remember(&answer),
            )
            .await
    }

    /// Produces the answer text for a user input, either through search or a
    /// direct completion. The user turn enters history before any model call.
    async fn answer(
        &self,
        event: &InboundEvent,
        ctx: &MessageContext,
        raw_input: &str,
    ) -> Result<String> {
        let input = self.assembler.strip_mention(raw_input);
        let model = self.session.active_model().await;
        let history_kept = keeps_history(ctx.role, ctx.scope);

        if let Some(search) = &self.search {
            if self.trigger.should_search(&input, &model).await {
                if history_kept {
                    self.session
                        .append_turn(ctx.principal, ChatMessage::user(input.clone()))
                        .await;
                }
                return search
                    .answer(&model, &input)
                    .await
                    .map_err(|e| RelayError::upstream(MODEL_SERVICE, e).into());
            }
        }

        let history = if history_kept {
            self.session.history(ctx.principal).await
        } else {
            Vec::new()
        };
        let reply_parent = if self.gate.is_reply_to_bot(event) {
            event.reply_to.as_ref().and_then(|reply| reply.text.as_deref())
        } else {
            None
        };
        let turns = self
            .assembler
            .assemble(ctx.scope, ctx.role, reply_parent, &history, raw_input);

        if history_kept {
            self.session
                .append_turn(ctx.principal, ChatMessage::user(input))
                .await;
        }

        let response = self
            .provider
            .chat(&model, turns, &ChatOptions::default())
            .await
            .map_err(|e| RelayError::upstream(MODEL_SERVICE, e))?;
        let text = response.text().trim();
        if text.is_empty() {
            return Err(RelayError::Upstream {
                service: MODEL_SERVICE,
                message: "empty completion".to_string(),
            }
            .into());
        }
        Ok(text.to_string())
    }

    async fn handle_command(&self, command: Command, ctx: &MessageContext) -> Result<()> {
        let elevated = ctx.role == Role::Elevated;
        let reply = match command {
            Command::Start => commands::start_text(ctx.role),
            Command::Help => commands::help_text(ctx.role),
            Command::Model(_) if !elevated => commands::MODEL_DENIED.to_string(),
            Command::Model(None) => {
                commands::current_model_text(&self.session.active_model().await)
            }
            Command::Model(Some(name)) => {
                let model = self.session.set_model(&name).await?;
                info!("Active model switched to {} by {}", model, ctx.principal);
                commands::model_set_text(&model)
            }
            Command::Quota if !elevated => commands::QUOTA_DENIED.to_string(),
            Command::Quota => {
                let _typing = self.dispatcher.start_typing(ctx.target.chat_id);
                commands::quota_text(self.billing.credit_grants().await)
            }
            Command::Reset if ctx.scope.is_private() => {
                self.session.clear_history(ctx.principal).await;
                commands::HISTORY_CLEARED.to_string()
            }
            Command::Reset => commands::RESET_PRIVATE_ONLY.to_string(),
            Command::Search(query) if query.is_empty() => commands::SEARCH_USAGE.to_string(),
            Command::Search(query) => match &self.search {
                None => commands::SEARCH_DISABLED.to_string(),
                Some(search) => {
                    let _typing = self.dispatcher.start_typing(ctx.target.chat_id);
                    let model = self.session.active_model().await;
                    search
                        .answer(&model, &query)
                        .await
                        .map_err(|e| RelayError::upstream(MODEL_SERVICE, e))?
                }
            },
        };
        self.dispatcher.send(ctx.target, &reply).await
    }
}
