//! The transformation chain. Every stage is a [TransformationFn]; the [Transformer] runs them in
//! order for each message of a batch and sorts the outcome into a [TransformationResult].
//!
//! ```text
//! msg --> (stage 1) --> (stage 2) --> ... --> (stage n) --> successful
//!             |             |                     |
//!             +-------------+---------------------+-------> filtered / invalid
//! ```
//!
//! A stage may hand an [IntermediateState] to the next one so that a payload parsed once does not
//! have to be parsed again.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::config::TransformConfig;
use crate::message::Message;
use crate::snowplow::{ParsedEvent, SnowplowError};
use crate::Result;

/// Built-in transformations that need no script.
pub mod builtin;

/// Script engines (JavaScript and Lua) that turn user code into a [TransformationFn].
pub mod engine;

use engine::{Engine, EngineProtocol, javascript::JsEngine, lua::LuaEngine};

/// Value threaded from one stage to the next for a single message.
#[derive(Debug, Clone)]
pub enum IntermediateState {
    /// The exchange record returned by a script engine.
    Protocol(EngineProtocol),
    /// A Snowplow enriched event that has already been parsed.
    SpEnriched(Arc<ParsedEvent>),
}

impl IntermediateState {
    /// Reuses a parsed enriched event if the state holds one, parses the payload otherwise.
    pub fn enriched_event(
        state: Option<&IntermediateState>,
        message: &Message,
    ) -> std::result::Result<Arc<ParsedEvent>, SnowplowError> {
        match state {
            Some(IntermediateState::SpEnriched(parsed)) => Ok(Arc::clone(parsed)),
            _ => ParsedEvent::parse(&message.data).map(Arc::new),
        }
    }
}

/// What a single stage did with a message.
#[derive(Debug)]
pub enum StageOutcome {
    /// Continue with the (possibly modified) message.
    Success(Message, Option<IntermediateState>),
    /// Drop the message; it is acked without being delivered.
    Filtered(Message),
    /// The message could not be processed. It carries the error that explains why.
    Failed(Message),
}

/// A single transformation stage.
pub type TransformationFn =
    Arc<dyn Fn(Message, Option<IntermediateState>) -> StageOutcome + Send + Sync>;

/// Outcome of running a batch through the chain.
#[derive(Debug, Default)]
pub struct TransformationResult {
    pub successful: Vec<Message>,
    pub filtered: Vec<Message>,
    pub invalid: Vec<Message>,
}

impl TransformationResult {
    pub fn new(successful: Vec<Message>, filtered: Vec<Message>, invalid: Vec<Message>) -> Self {
        Self {
            successful,
            filtered,
            invalid,
        }
    }

    pub fn total(&self) -> usize {
        self.successful.len() + self.filtered.len() + self.invalid.len()
    }
}

/// Runs an ordered list of stages over message batches. It keeps no per-message state between
/// calls, so a single instance can be shared by concurrent batches.
#[derive(Clone, Default)]
pub struct Transformer {
    stages: Vec<TransformationFn>,
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl Transformer {
    pub fn new(stages: Vec<TransformationFn>) -> Self {
        Self { stages }
    }

    /// Builds every configured stage, smoke testing script entry points along the way.
    pub fn from_config(configs: &[TransformConfig]) -> Result<Self> {
        let mut stages = Vec::with_capacity(configs.len());
        for config in configs {
            let stage = match config {
                TransformConfig::Js(cfg) => {
                    let engine = JsEngine::new(cfg)?;
                    engine.smoke_test(&cfg.entrypoint)?;
                    engine.make_function(&cfg.entrypoint)
                }
                TransformConfig::Lua(cfg) => {
                    let engine = LuaEngine::new(cfg)?;
                    engine.smoke_test(&cfg.entrypoint)?;
                    engine.make_function(&cfg.entrypoint)
                }
                TransformConfig::Base64Encode {} => builtin::base64_encode(),
                TransformConfig::Base64Decode {} => builtin::base64_decode(),
                TransformConfig::SpEnrichedToJson {} => builtin::sp_enriched_to_json(),
                TransformConfig::SpEnrichedSetPk(cfg) => {
                    builtin::sp_enriched_set_pk(&cfg.atomic_field)?
                }
                TransformConfig::SpEnrichedFilter(cfg) => builtin::sp_enriched_filter(cfg)?,
                TransformConfig::SpEnrichedFilterContext(cfg) => {
                    builtin::sp_enriched_filter_context(cfg)?
                }
                TransformConfig::SpEnrichedFilterUnstructEvent(cfg) => {
                    builtin::sp_enriched_filter_unstruct_event(cfg)?
                }
            };
            stages.push(stage);
        }
        Ok(Self::new(stages))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Applies the chain to every message. The input batch is never modified; each message is
    /// copied before the first stage sees it.
    pub fn transform(&self, messages: &[Message]) -> TransformationResult {
        if self.stages.is_empty() {
            return TransformationResult::new(messages.to_vec(), vec![], vec![]);
        }

        let mut result = TransformationResult::default();
        for message in messages {
            match self.apply(message.clone()) {
                StageOutcome::Success(mut msg, _) => {
                    msg.time_transformed = Some(Utc::now());
                    result.successful.push(msg);
                }
                StageOutcome::Filtered(msg) => result.filtered.push(msg),
                StageOutcome::Failed(msg) => result.invalid.push(msg),
            }
        }

        debug!(
            successful = result.successful.len(),
            filtered = result.filtered.len(),
            invalid = result.invalid.len(),
            "Transformed batch"
        );
        result
    }

    /// Feeds one message through the stages, stopping at the first filter or failure.
    fn apply(&self, message: Message) -> StageOutcome {
        let mut message = message;
        let mut state = None;
        for stage in &self.stages {
            match stage(message, state) {
                StageOutcome::Success(next, next_state) => {
                    message = next;
                    state = next_state;
                }
                terminal => return terminal,
            }
        }
        StageOutcome::Success(message, state)
    }
}
