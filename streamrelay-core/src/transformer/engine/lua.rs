use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mlua::{
    Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, VmState,
};
use serde_json::Value;

use super::{Engine, ScriptFailure};
use crate::config::LuaEngineConfig;
use crate::{Error, Result};

/// The deadline is checked once every this many VM instructions.
const INSTRUCTIONS_PER_CHECK: u32 = 1000;

/// Base functions that are unset in sandboxed interpreters.
const SANDBOX_REMOVED_GLOBALS: [&str; 4] = ["dofile", "loadfile", "load", "collectgarbage"];

/// Runs Lua transformations, one fresh interpreter per message.
#[derive(Debug, Clone)]
pub struct LuaEngine {
    name: Arc<str>,
    source: Arc<str>,
    run_timeout: Duration,
    sandbox: bool,
    snowplow_mode: bool,
}

impl LuaEngine {
    pub fn new(config: &LuaEngineConfig) -> Result<Self> {
        let engine = Self {
            name: config.source.name().into(),
            source: config.source.load()?.into(),
            run_timeout: Duration::from_secs(config.timeout_sec),
            sandbox: config.sandbox,
            snowplow_mode: config.snowplow_mode,
        };
        engine.compile()?;
        Ok(engine)
    }

    fn compile(&self) -> Result<()> {
        let lua = self
            .interpreter()
            .map_err(|e| Error::Engine(format!("initializing Lua runtime: {e}")))?;
        lua.load(self.source.as_ref())
            .set_name(self.name.as_ref())
            .into_function()
            .map(|_| ())
            .map_err(|e| Error::Engine(format!("compiling Lua transformation {}: {e}", self.name)))
    }

    /// A sandboxed interpreter only gets the string, table, math and utf8 libraries on top of the
    /// base functions, minus the ones that reach the filesystem or load code.
    fn interpreter(&self) -> mlua::Result<Lua> {
        if !self.sandbox {
            return Ok(Lua::new());
        }
        let lua = Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )?;
        let globals = lua.globals();
        for name in SANDBOX_REMOVED_GLOBALS {
            globals.set(name, mlua::Value::Nil)?;
        }
        Ok(lua)
    }

    /// Makes the VM raise an error once `deadline` has passed, and records that it did.
    fn arm_deadline(lua: &Lua, deadline: Instant, tripped: Arc<AtomicBool>) {
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(INSTRUCTIONS_PER_CHECK),
            move |_lua, _debug| {
                if Instant::now() >= deadline {
                    tripped.store(true, Ordering::Relaxed);
                    return Err(mlua::Error::runtime("runtime deadline exceeded"));
                }
                Ok(VmState::Continue)
            },
        );
    }

    /// Runs the chunk and looks up the entry point among the globals.
    fn load(&self, lua: &Lua, entrypoint: &str) -> std::result::Result<Function, String> {
        lua.load(self.source.as_ref())
            .set_name(self.name.as_ref())
            .exec()
            .map_err(|e| format!("could not load lua code: {e}"))?;
        match lua.globals().get::<mlua::Value>(entrypoint) {
            Ok(mlua::Value::Function(function)) => Ok(function),
            _ => Err(format!("global {entrypoint}() Lua function not found")),
        }
    }

    fn invoke(
        &self,
        lua: &Lua,
        entrypoint: &str,
        input: &Value,
    ) -> std::result::Result<Value, ScriptFailure> {
        let function = self.load(lua, entrypoint).map_err(ScriptFailure::Init)?;
        let options = SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false);
        let argument = lua
            .to_value_with(input, options)
            .map_err(|e| ScriptFailure::Init(e.to_string()))?;
        let returned = function
            .call::<mlua::Value>(argument)
            .map_err(|e| ScriptFailure::Runtime(e.to_string()))?;
        lua.from_value::<Value>(returned)
            .map_err(|e| ScriptFailure::Unrepresentable(e.to_string()))
    }
}

impl Engine for LuaEngine {
    const LANGUAGE: &'static str = "Lua";
    const NIL: &'static str = "nil";

    fn smoke_test(&self, entrypoint: &str) -> Result<()> {
        let lua = self
            .interpreter()
            .map_err(|e| Error::Engine(format!("initializing Lua runtime: {e}")))?;
        Self::arm_deadline(
            &lua,
            Instant::now() + self.run_timeout,
            Arc::new(AtomicBool::new(false)),
        );
        self.load(&lua, entrypoint)
            .map(|_| ())
            .map_err(|e| Error::Engine(format!("{}: {e}", self.name)))
    }

    fn call(&self, entrypoint: &str, input: &Value) -> std::result::Result<Value, ScriptFailure> {
        let lua = self
            .interpreter()
            .map_err(|e| ScriptFailure::Init(e.to_string()))?;
        let tripped = Arc::new(AtomicBool::new(false));
        Self::arm_deadline(&lua, Instant::now() + self.run_timeout, Arc::clone(&tripped));

        match self.invoke(&lua, entrypoint, input) {
            Err(_) if tripped.load(Ordering::Relaxed) => Err(ScriptFailure::DeadlineExceeded),
            other => other,
        }
    }

    fn snowplow_mode(&self) -> bool {
        self.snowplow_mode
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::ScriptSource;
    use crate::message::Message;
    use crate::transformer::StageOutcome;

    fn lua(script: &str) -> LuaEngine {
        LuaEngine::new(&LuaEngineConfig::new(ScriptSource::inline(script))).unwrap()
    }

    fn run(engine: &LuaEngine, msg: Message) -> StageOutcome {
        engine.make_function("main")(msg, None)
    }

    #[test]
    fn test_compile_error_fails_fast() {
        let result = LuaEngine::new(&LuaEngineConfig::new(ScriptSource::inline(
            "function main(x) return x",
        )));
        assert!(matches!(result, Err(Error::Engine(_))));
    }

    #[test]
    fn test_smoke_test() {
        let engine = lua("function main(x) return x end");
        assert!(engine.smoke_test("main").is_ok());
        assert!(engine.smoke_test("other").is_err());
    }

    #[test]
    fn test_identity_is_noop() {
        let engine = lua("function main(x) return x end");
        let msg = Message::new("payload", "key");
        let StageOutcome::Success(out, _) = run(&engine, msg.clone()) else {
            panic!("expected success");
        };
        assert_eq!(out.data, msg.data);
        assert_eq!(out.partition_key, "key");
        assert_eq!(out.headers, None);
    }

    #[test]
    fn test_rewrites_data_and_key() {
        let engine = lua(
            r#"
            function main(x)
                return { Data = string.upper(x.Data), PartitionKey = "lua-key" }
            end
            "#,
        );
        let StageOutcome::Success(out, _) = run(&engine, Message::new("hello", "k")) else {
            panic!("expected success");
        };
        assert_eq!(out.data, Bytes::from("HELLO"));
        assert_eq!(out.partition_key, "lua-key");
    }

    #[test]
    fn test_filter_and_invalid_returns() {
        let engine = lua(r#"function main(x) return { FilterOut = true, Data = "x" } end"#);
        assert!(matches!(
            run(&engine, Message::new("a", "k")),
            StageOutcome::Filtered(_)
        ));

        let engine = lua("function main(x) return nil end");
        let StageOutcome::Failed(out) = run(&engine, Message::new("a", "k")) else {
            panic!("expected failure");
        };
        assert_eq!(
            out.error.unwrap().safe_message(),
            "invalid return type from Lua transformation; got nil"
        );

        let engine = lua("function main(x) return true end");
        let StageOutcome::Failed(out) = run(&engine, Message::new("a", "k")) else {
            panic!("expected failure");
        };
        assert!(
            out.error
                .unwrap()
                .safe_message()
                .contains("expected string or object")
        );
    }

    #[test]
    fn test_runtime_error() {
        let engine = lua(r#"function main(x) error("boom") end"#);
        let StageOutcome::Failed(out) = run(&engine, Message::new("a", "k")) else {
            panic!("expected failure");
        };
        let err = out.error.unwrap();
        assert_eq!(err.safe_message(), "error running Lua function [main]");
        assert!(err.detail().contains("boom"));
    }

    #[test]
    fn test_sandbox_hides_os() {
        let script = r#"function main(x) return os.getenv("HOME") or "none" end"#;
        let StageOutcome::Failed(_) = run(&lua(script), Message::new("a", "k")) else {
            panic!("os should not be reachable in the sandbox");
        };

        let mut config = LuaEngineConfig::new(ScriptSource::inline(script));
        config.sandbox = false;
        let engine = LuaEngine::new(&config).unwrap();
        assert!(matches!(
            run(&engine, Message::new("a", "k")),
            StageOutcome::Success(..)
        ));
    }

    #[test]
    fn test_sandbox_cannot_load_code() {
        let script = r#"
            function main(x)
                local hidden = loadfile == nil and dofile == nil and load == nil
                    and collectgarbage == nil
                return tostring(hidden)
            end
        "#;
        let StageOutcome::Success(out, _) = run(&lua(script), Message::new("a", "k")) else {
            panic!("expected success");
        };
        assert_eq!(out.data, Bytes::from("true"));

        let mut secret = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut secret, b"return 'from disk'").unwrap();
        let script = format!(
            r#"function main(x) local f = loadfile({:?}) return f() end"#,
            secret.path().display().to_string()
        );
        let StageOutcome::Failed(out) = run(&lua(&script), Message::new("a", "k")) else {
            panic!("files should not be loadable in the sandbox");
        };
        assert_eq!(out.data, Bytes::from("a"));
    }

    #[test]
    fn test_timeout_interrupts() {
        let mut config =
            LuaEngineConfig::new(ScriptSource::inline("function main(x) while true do end end"));
        config.timeout_sec = 1;
        let engine = LuaEngine::new(&config).unwrap();

        let started = Instant::now();
        let StageOutcome::Failed(out) = run(&engine, Message::new("payload", "k")) else {
            panic!("expected failure");
        };
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(out.error.unwrap().is_deadline_exceeded());
        assert_eq!(out.data, Bytes::from("payload"));
    }

    #[test]
    fn test_snowplow_mode_table_output() {
        let mut config = LuaEngineConfig::new(ScriptSource::inline(
            r#"
            function main(x)
                return { Data = { app = x.Data.app_id, platform = x.Data.platform } }
            end
            "#,
        ));
        config.snowplow_mode = true;
        let engine = LuaEngine::new(&config).unwrap();

        let msg = Message::new(crate::snowplow::test_data::sample_event(), "k");
        let StageOutcome::Success(out, _) = run(&engine, msg) else {
            panic!("expected success");
        };
        let written: Value = serde_json::from_slice(&out.data).unwrap();
        assert_eq!(
            written,
            serde_json::json!({"app": "test-data1", "platform": "pc"})
        );
    }
}
