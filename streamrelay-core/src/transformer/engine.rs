//! Script engines share one contract: the script is compiled when the engine is built, every
//! invocation gets a fresh interpreter, and data crosses the boundary as an [EngineProtocol]
//! record:
//!
//! ```text
//! { "FilterOut": bool, "PartitionKey": string, "Data": string | object, "HTTPHeaders": object }
//! ```
//!
//! The interpreters only exchange JSON values with the host. Decoding the value a script returned
//! into a [ReturnShape] and applying it to the message is done here, once, for both languages.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::Result;
use crate::error::MessageError;
use crate::message::Message;
use crate::transformer::{IntermediateState, StageOutcome, TransformationFn};

/// JavaScript engine backed by QuickJS.
pub mod javascript;

/// Lua 5.4 engine.
pub mod lua;

const KEY_FILTER_OUT: &str = "FilterOut";
const KEY_PARTITION_KEY: &str = "PartitionKey";
const KEY_DATA: &str = "Data";
const KEY_HTTP_HEADERS: &str = "HTTPHeaders";

/// The record exchanged with scripts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineProtocol {
    #[serde(rename = "FilterOut")]
    pub filter_out: bool,
    #[serde(rename = "PartitionKey")]
    pub partition_key: String,
    #[serde(rename = "Data")]
    pub data: ProtocolData,
    #[serde(rename = "HTTPHeaders", skip_serializing_if = "Option::is_none")]
    pub http_headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProtocolData {
    Text(String),
    Structured(Map<String, Value>),
}

impl EngineProtocol {
    pub fn with_text(data: impl Into<String>) -> Self {
        Self {
            filter_out: false,
            partition_key: String::new(),
            data: ProtocolData::Text(data.into()),
            http_headers: None,
        }
    }

    pub fn data_text(&self) -> Option<&str> {
        match &self.data {
            ProtocolData::Text(text) => Some(text),
            ProtocolData::Structured(_) => None,
        }
    }
}

/// The shapes a script's return value may take.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnShape {
    /// A protocol record with `FilterOut` set.
    FilterMessage,
    /// A bare string replaces the payload verbatim.
    ReplaceData(String),
    /// A plain object (no protocol keys) replaces the payload with its JSON encoding.
    ReplaceStructured(Map<String, Value>),
    ProtocolRecord(EngineProtocol),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReturnError {
    #[error("invalid return type from {language} transformation; got {nil}")]
    Nil {
        language: &'static str,
        nil: &'static str,
    },

    #[error("invalid return type from {language} transformation; expected string or object")]
    InvalidType { language: &'static str },

    #[error("protocol violation in return value from {language} transformation")]
    ProtocolViolation { language: &'static str },
}

impl ReturnShape {
    /// Decodes a returned value. Anything that is not one of the known shapes is rejected; nothing
    /// is coerced.
    pub fn decode(
        value: Value,
        language: &'static str,
        nil: &'static str,
    ) -> std::result::Result<Self, ReturnError> {
        let violation = ReturnError::ProtocolViolation { language };
        let invalid = ReturnError::InvalidType { language };

        let mut map = match value {
            Value::Null => return Err(ReturnError::Nil { language, nil }),
            Value::String(text) => return Ok(ReturnShape::ReplaceData(text)),
            Value::Object(map) => map,
            _ => return Err(invalid),
        };

        let is_protocol = [KEY_FILTER_OUT, KEY_PARTITION_KEY, KEY_DATA, KEY_HTTP_HEADERS]
            .iter()
            .any(|key| map.contains_key(*key));
        if !is_protocol {
            return Ok(ReturnShape::ReplaceStructured(map));
        }

        let filter_out = match map.remove(KEY_FILTER_OUT) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => flag,
            Some(_) => return Err(violation),
        };
        if filter_out {
            return Ok(ReturnShape::FilterMessage);
        }

        let partition_key = match map.remove(KEY_PARTITION_KEY) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(key)) => key,
            Some(_) => return Err(violation),
        };

        let http_headers = match map.remove(KEY_HTTP_HEADERS) {
            None | Some(Value::Null) => None,
            Some(Value::Object(entries)) => {
                let mut headers = HashMap::with_capacity(entries.len());
                for (name, value) in entries {
                    let Value::String(value) = value else {
                        return Err(violation);
                    };
                    headers.insert(name, value);
                }
                Some(headers)
            }
            Some(_) => return Err(violation),
        };

        let data = match map.remove(KEY_DATA) {
            Some(Value::String(text)) => ProtocolData::Text(text),
            Some(Value::Object(structured)) => ProtocolData::Structured(structured),
            _ => return Err(invalid),
        };

        Ok(ReturnShape::ProtocolRecord(EngineProtocol {
            filter_out,
            partition_key,
            data,
            http_headers,
        }))
    }
}

/// Why an interpreter did not hand back a value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptFailure {
    /// The interpreter could not be set up or the program failed to load.
    Init(String),
    /// The entry point threw or the interpreter failed while running it.
    Runtime(String),
    /// The run timeout interrupted the interpreter.
    DeadlineExceeded,
    /// The returned value has no JSON representation (a function, for example).
    Unrepresentable(String),
}

/// A script engine. Implementors provide the interpreter specific pieces; [Engine::make_function]
/// wires them into a [TransformationFn].
pub trait Engine: Clone + Send + Sync + 'static {
    /// Language name used in error messages.
    const LANGUAGE: &'static str;
    /// What the language calls a missing value.
    const NIL: &'static str;

    /// Loads the compiled program into a throwaway interpreter and checks that `entrypoint`
    /// exists and is callable, without calling it.
    fn smoke_test(&self, entrypoint: &str) -> Result<()>;

    /// Calls `entrypoint` with `input` in a fresh interpreter, bounded by the run timeout.
    fn call(&self, entrypoint: &str, input: &Value) -> std::result::Result<Value, ScriptFailure>;

    fn snowplow_mode(&self) -> bool;

    /// Whether null fields are stripped from structured output before it is encoded.
    fn remove_nulls(&self) -> bool {
        false
    }

    fn make_function(&self, entrypoint: &str) -> TransformationFn {
        let engine = self.clone();
        let entrypoint = entrypoint.to_string();
        Arc::new(move |message, state| run_stage(&engine, &entrypoint, message, state))
    }
}

fn fail(mut message: Message, error: MessageError) -> StageOutcome {
    message.set_error(error);
    StageOutcome::Failed(message)
}

fn run_stage<E: Engine>(
    engine: &E,
    entrypoint: &str,
    message: Message,
    state: Option<IntermediateState>,
) -> StageOutcome {
    let language = E::LANGUAGE;

    let input = match build_input(engine.snowplow_mode(), &message, state)
        .and_then(|input| serde_json::to_value(input).map_err(|e| e.to_string()))
    {
        Ok(input) => input,
        Err(e) => {
            let safe = format!("failed making input for the {language} runtime");
            let detail = format!("{safe}: {e}");
            return fail(message, MessageError::transformation(safe, detail));
        }
    };

    let output = match engine.call(entrypoint, &input) {
        Ok(output) => output,
        Err(ScriptFailure::DeadlineExceeded) => {
            let safe = format!("{language} function [{entrypoint}] exceeded its run timeout");
            return fail(
                message,
                MessageError::deadline_exceeded(safe, "runtime deadline exceeded"),
            );
        }
        Err(ScriptFailure::Init(e)) => {
            let safe = format!("failed initializing {language} runtime");
            let detail = format!("{safe}: {e}");
            return fail(message, MessageError::transformation(safe, detail));
        }
        Err(ScriptFailure::Runtime(e)) => {
            let safe = format!("error running {language} function [{entrypoint}]");
            let detail = format!("{safe}: {e}");
            return fail(message, MessageError::transformation(safe, detail));
        }
        Err(ScriptFailure::Unrepresentable(e)) => {
            let err = ReturnError::InvalidType { language };
            return fail(
                message,
                MessageError::transformation(err.to_string(), format!("{err}: {e}")),
            );
        }
    };

    match ReturnShape::decode(output, language, E::NIL) {
        Ok(shape) => apply_shape(message, shape, engine.remove_nulls()),
        Err(err) => fail(
            message,
            MessageError::transformation(err.to_string(), err.to_string()),
        ),
    }
}

/// Builds the record handed to the script. A protocol left by a previous engine stage is passed on
/// as is; any other state is ignored and the input is rebuilt from the payload.
fn build_input(
    snowplow_mode: bool,
    message: &Message,
    state: Option<IntermediateState>,
) -> std::result::Result<EngineProtocol, String> {
    if let Some(IntermediateState::Protocol(protocol)) = state {
        return Ok(protocol);
    }

    let mut candidate = EngineProtocol {
        http_headers: message.headers.clone(),
        ..EngineProtocol::with_text(String::from_utf8_lossy(&message.data))
    };
    if !snowplow_mode {
        return Ok(candidate);
    }

    let parsed =
        IntermediateState::enriched_event(state.as_ref(), message).map_err(|e| e.to_string())?;
    candidate.data = ProtocolData::Structured(parsed.to_map().map_err(|e| e.to_string())?);
    Ok(candidate)
}

fn apply_shape(mut message: Message, shape: ReturnShape, remove_nulls: bool) -> StageOutcome {
    let mut protocol = match shape {
        ReturnShape::FilterMessage => return StageOutcome::Filtered(message),
        ReturnShape::ReplaceData(text) => EngineProtocol {
            http_headers: message.headers.clone(),
            ..EngineProtocol::with_text(text)
        },
        ReturnShape::ReplaceStructured(map) => EngineProtocol {
            filter_out: false,
            partition_key: String::new(),
            data: ProtocolData::Structured(map),
            http_headers: message.headers.clone(),
        },
        ReturnShape::ProtocolRecord(protocol) => protocol,
    };

    match &mut protocol.data {
        ProtocolData::Text(text) => message.data = Bytes::from(text.clone()),
        ProtocolData::Structured(map) => {
            if remove_nulls {
                remove_null_fields(map);
            }
            match serde_json::to_vec(map) {
                Ok(encoded) => message.data = Bytes::from(encoded),
                Err(e) => {
                    return fail(
                        message,
                        MessageError::transformation(
                            "error encoding message data",
                            format!("error encoding message data: {e}"),
                        ),
                    );
                }
            }
        }
    }

    if !protocol.partition_key.is_empty() && protocol.partition_key != message.partition_key {
        message.partition_key = protocol.partition_key.clone();
    }

    // an explicit null leaves the headers alone; any map replaces them
    if let Some(headers) = &protocol.http_headers {
        message.headers = Some(headers.clone());
    }

    StageOutcome::Success(message, Some(IntermediateState::Protocol(protocol)))
}

fn remove_null_fields(map: &mut Map<String, Value>) {
    map.retain(|_, value| !value.is_null());
    for value in map.values_mut() {
        remove_nulls_in(value);
    }
}

fn remove_nulls_in(value: &mut Value) {
    match value {
        Value::Object(map) => remove_null_fields(map),
        Value::Array(items) => items.iter_mut().for_each(remove_nulls_in),
        _ => {}
    }
}
