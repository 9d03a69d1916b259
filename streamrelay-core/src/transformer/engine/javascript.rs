use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime, Value as JsValue};
use serde_json::Value;

use super::{Engine, ScriptFailure};
use crate::config::JsEngineConfig;
use crate::{Error, Result};

const MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;
const MAX_STACK_SIZE_BYTES: usize = 1024 * 1024;

/// Runs JavaScript transformations. The source is syntax checked when the engine is built and
/// evaluated again in a brand new QuickJS runtime for every message.
#[derive(Debug, Clone)]
pub struct JsEngine {
    name: Arc<str>,
    source: Arc<str>,
    run_timeout: Duration,
    snowplow_mode: bool,
    remove_nulls: bool,
}

impl JsEngine {
    pub fn new(config: &JsEngineConfig) -> Result<Self> {
        let engine = Self {
            name: config.source.name().into(),
            source: config.source.load()?.into(),
            run_timeout: Duration::from_secs(config.timeout_sec),
            snowplow_mode: config.snowplow_mode,
            remove_nulls: config.remove_nulls,
        };
        engine.compile()?;
        Ok(engine)
    }

    /// Parses the source without running it, by handing it to the `Function` constructor.
    fn compile(&self) -> Result<()> {
        let (_runtime, context) = self
            .interpreter(Instant::now() + self.run_timeout, Arc::new(AtomicBool::new(false)))
            .map_err(|e| Error::Engine(format!("initializing JavaScript runtime: {e}")))?;

        context.with(|ctx| {
            let constructor: Function<'_> = ctx
                .globals()
                .get("Function")
                .map_err(|e| Error::Engine(format!("initializing JavaScript runtime: {e}")))?;
            constructor
                .call::<_, JsValue<'_>>((self.source.to_string(),))
                .catch(&ctx)
                .map(|_| ())
                .map_err(|e| {
                    Error::Engine(format!(
                        "compiling JavaScript transformation {}: {}",
                        self.name,
                        describe(e)
                    ))
                })
        })
    }

    fn interpreter(
        &self,
        deadline: Instant,
        tripped: Arc<AtomicBool>,
    ) -> rquickjs::Result<(Runtime, Context)> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(MEMORY_LIMIT_BYTES);
        runtime.set_max_stack_size(MAX_STACK_SIZE_BYTES);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            if Instant::now() >= deadline {
                tripped.store(true, Ordering::Relaxed);
                return true;
            }
            false
        })));
        let context = Context::full(&runtime)?;
        Ok((runtime, context))
    }

    /// Evaluates the program and looks up the entry point.
    fn load<'js>(&self, ctx: &Ctx<'js>, entrypoint: &str) -> std::result::Result<Function<'js>, String> {
        ctx.eval::<JsValue<'_>, _>(self.source.as_bytes().to_vec())
            .catch(ctx)
            .map_err(|e| format!("could not load JavaScript code: {}", describe(e)))?;

        let candidate: JsValue<'js> = ctx
            .globals()
            .get(entrypoint)
            .map_err(|e| format!("could not read global {entrypoint:?}: {e}"))?;
        candidate
            .into_function()
            .ok_or_else(|| format!("could not assert as function: {entrypoint:?}"))
    }
}

impl Engine for JsEngine {
    const LANGUAGE: &'static str = "JavaScript";
    const NIL: &'static str = "null or undefined";

    fn smoke_test(&self, entrypoint: &str) -> Result<()> {
        let (_runtime, context) = self
            .interpreter(Instant::now() + self.run_timeout, Arc::new(AtomicBool::new(false)))
            .map_err(|e| Error::Engine(format!("initializing JavaScript runtime: {e}")))?;
        context.with(|ctx| {
            self.load(&ctx, entrypoint)
                .map(|_| ())
                .map_err(|e| Error::Engine(format!("{}: {e}", self.name)))
        })
    }

    fn call(&self, entrypoint: &str, input: &Value) -> std::result::Result<Value, ScriptFailure> {
        let tripped = Arc::new(AtomicBool::new(false));
        let (_runtime, context) = self
            .interpreter(Instant::now() + self.run_timeout, Arc::clone(&tripped))
            .map_err(|e| ScriptFailure::Init(e.to_string()))?;
        let input = serde_json::to_string(input).map_err(|e| ScriptFailure::Init(e.to_string()))?;

        let outcome = context.with(|ctx| {
            let function = self.load(&ctx, entrypoint).map_err(ScriptFailure::Init)?;
            let argument = ctx
                .json_parse(input)
                .catch(&ctx)
                .map_err(|e| ScriptFailure::Init(describe(e)))?;
            let returned: JsValue<'_> = function
                .call((argument,))
                .catch(&ctx)
                .map_err(|e| ScriptFailure::Runtime(describe(e)))?;
            to_json(&ctx, returned)
        });

        match outcome {
            Err(_) if tripped.load(Ordering::Relaxed) => Err(ScriptFailure::DeadlineExceeded),
            other => other,
        }
    }

    fn snowplow_mode(&self) -> bool {
        self.snowplow_mode
    }

    fn remove_nulls(&self) -> bool {
        self.remove_nulls
    }
}

/// Converts a returned value to JSON. `undefined` and `null` both become [Value::Null].
fn to_json<'js>(ctx: &Ctx<'js>, value: JsValue<'js>) -> std::result::Result<Value, ScriptFailure> {
    if value.is_undefined() || value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(text) = value.as_string() {
        return text
            .to_string()
            .map(Value::String)
            .map_err(|e| ScriptFailure::Runtime(e.to_string()));
    }

    let encoded = ctx
        .json_stringify(value)
        .catch(ctx)
        .map_err(|e| ScriptFailure::Unrepresentable(describe(e)))?
        .ok_or_else(|| ScriptFailure::Unrepresentable("value has no JSON form".to_string()))?
        .to_string()
        .map_err(|e| ScriptFailure::Unrepresentable(e.to_string()))?;
    serde_json::from_str(&encoded).map_err(|e| ScriptFailure::Unrepresentable(e.to_string()))
}

/// Renders a caught exception as `Name: message` so the error code can be derived from it.
fn describe(err: CaughtError<'_>) -> String {
    match err {
        CaughtError::Exception(exception) => {
            let message = exception.message().unwrap_or_default();
            match exception.get::<_, String>("name") {
                Ok(name) => format!("{name}: {message}"),
                Err(_) => message,
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;

    use super::*;
    use crate::config::ScriptSource;
    use crate::message::Message;
    use crate::transformer::engine::{EngineProtocol, ProtocolData};
    use crate::transformer::{IntermediateState, StageOutcome};

    fn js(script: &str) -> JsEngine {
        JsEngine::new(&JsEngineConfig::new(ScriptSource::inline(script))).unwrap()
    }

    fn run(engine: &JsEngine, msg: Message) -> StageOutcome {
        engine.make_function("main")(msg, None)
    }

    #[test]
    fn test_compile_error_fails_fast() {
        let err = JsEngine::new(&JsEngineConfig::new(ScriptSource::inline(
            "function main(x) { return x;",
        )))
        .unwrap_err();
        assert!(matches!(err, Error::Engine(msg) if msg.contains("SyntaxError")));
    }

    #[test]
    fn test_smoke_test() {
        let engine = js("function main(x) { return x; }");
        assert!(engine.smoke_test("main").is_ok());
        assert!(engine.smoke_test("missing").is_err());

        let engine = js("var main = 5;");
        assert!(engine.smoke_test("main").is_err());
    }

    #[test]
    fn test_identity_is_noop() {
        let engine = js("function main(x) { return x; }");
        let msg = Message::new("payload", "key")
            .with_headers(HashMap::from([("h".to_string(), "v".to_string())]));

        let StageOutcome::Success(out, state) = run(&engine, msg.clone()) else {
            panic!("expected success");
        };
        assert_eq!(out.data, msg.data);
        assert_eq!(out.partition_key, msg.partition_key);
        assert_eq!(out.headers, msg.headers);
        assert!(matches!(state, Some(IntermediateState::Protocol(_))));
    }

    #[test]
    fn test_rewrites_data_key_and_headers() {
        let engine = js(
            r#"
            function main(x) {
                return {
                    Data: x.Data.toUpperCase(),
                    PartitionKey: "new-key",
                    HTTPHeaders: { "content-type": "text/plain" },
                };
            }
            "#,
        );
        let StageOutcome::Success(out, _) = run(&engine, Message::new("hello", "old-key")) else {
            panic!("expected success");
        };
        assert_eq!(out.data, Bytes::from("HELLO"));
        assert_eq!(out.partition_key, "new-key");
        assert_eq!(out.headers.unwrap()["content-type"], "text/plain");
    }

    #[test]
    fn test_string_and_object_returns() {
        let engine = js(r#"function main(x) { return "replaced"; }"#);
        let StageOutcome::Success(out, _) = run(&engine, Message::new("hello", "k")) else {
            panic!("expected success");
        };
        assert_eq!(out.data, Bytes::from("replaced"));

        let engine = js(r#"function main(x) { return { greeting: x.Data, n: 1 }; }"#);
        let StageOutcome::Success(out, _) = run(&engine, Message::new("hello", "k")) else {
            panic!("expected success");
        };
        let written: Value = serde_json::from_slice(&out.data).unwrap();
        assert_eq!(written, serde_json::json!({"greeting": "hello", "n": 1}));
    }

    #[test]
    fn test_filter_discards_data() {
        let engine = js(r#"function main(x) { return { FilterOut: true, Data: "x" }; }"#);
        let StageOutcome::Filtered(out) = run(&engine, Message::new("original", "k")) else {
            panic!("expected filtered");
        };
        assert_eq!(out.data, Bytes::from("original"));
    }

    #[test]
    fn test_invalid_returns() {
        let cases = [
            ("function main(x) { return null; }", "got null or undefined"),
            ("function main(x) { }", "got null or undefined"),
            ("function main(x) { return 42; }", "expected string or object"),
            ("function main(x) { return { Data: 42 }; }", "expected string or object"),
            ("function main(x) { return function() {}; }", "expected string or object"),
            (
                r#"function main(x) { return { Data: "x", FilterOut: "no" }; }"#,
                "protocol violation",
            ),
        ];
        for (script, expected) in cases {
            let StageOutcome::Failed(out) = run(&js(script), Message::new("a", "k")) else {
                panic!("expected failure for {script}");
            };
            let err = out.error.unwrap();
            assert!(err.safe_message().contains(expected), "{script}: {err}");
            assert_eq!(out.data, Bytes::from("a"));
        }
    }

    #[test]
    fn test_thrown_error_carries_code() {
        let engine = js("function main(x) { return x.Data.nope.deeper; }");
        let StageOutcome::Failed(out) = run(&engine, Message::new("a", "k")) else {
            panic!("expected failure");
        };
        let err = out.error.unwrap();
        assert_eq!(err.code(), "TypeError");
        assert_eq!(err.safe_message(), "error running JavaScript function [main]");
    }

    #[test]
    fn test_timeout_interrupts() {
        let mut config = JsEngineConfig::new(ScriptSource::inline("function main(x) { while (true) {} }"));
        config.timeout_sec = 1;
        let engine = JsEngine::new(&config).unwrap();

        let started = Instant::now();
        let StageOutcome::Failed(out) = run(&engine, Message::new("payload", "k")) else {
            panic!("expected failure");
        };
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(out.error.unwrap().is_deadline_exceeded());
        assert_eq!(out.data, Bytes::from("payload"));
    }

    #[test]
    fn test_protocol_state_is_used_as_input() {
        let engine = js(r#"function main(x) { return x.Data + "!"; }"#);
        let state = IntermediateState::Protocol(EngineProtocol {
            data: ProtocolData::Text("from state".into()),
            ..EngineProtocol::with_text("")
        });
        let StageOutcome::Success(out, _) =
            engine.make_function("main")(Message::new("payload", "k"), Some(state))
        else {
            panic!("expected success");
        };
        assert_eq!(out.data, Bytes::from("from state!"));
    }

    #[test]
    fn test_snowplow_mode_and_remove_nulls() {
        let mut config = JsEngineConfig::new(ScriptSource::inline(
            r#"function main(x) { return { Data: { app: x.Data.app_id, gone: null } }; }"#,
        ));
        config.snowplow_mode = true;
        config.remove_nulls = true;
        let engine = JsEngine::new(&config).unwrap();

        let msg = Message::new(crate::snowplow::test_data::sample_event(), "k");
        let StageOutcome::Success(out, _) = run(&engine, msg) else {
            panic!("expected success");
        };
        assert_eq!(out.data, Bytes::from(r#"{"app":"test-data1"}"#));

        let StageOutcome::Failed(out) = run(&engine, Message::new("not an event", "k")) else {
            panic!("expected failure");
        };
        assert_eq!(
            out.error.unwrap().safe_message(),
            "failed making input for the JavaScript runtime"
        );
    }
}
