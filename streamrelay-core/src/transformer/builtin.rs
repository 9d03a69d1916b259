//! Stages that need no script. The Snowplow ones parse the payload as an enriched event at most
//! once per message and pass the parsed event on to the next stage.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use regex::Regex;
use serde_json::Value;

use super::{IntermediateState, StageOutcome, TransformationFn};
use crate::config::{
    FilterAction, SpEnrichedFilterConfig, SpEnrichedFilterContextConfig,
    SpEnrichedFilterUnstructEventConfig,
};
use crate::error::MessageError;
use crate::message::Message;
use crate::snowplow::{
    ParsedEvent, PathSegment, SnowplowError, is_known_field, parse_field_path,
};
use crate::{Error, Result};

fn fail(mut message: Message, safe_message: &str, detail: impl ToString) -> StageOutcome {
    let detail = format!("{safe_message}: {}", detail.to_string());
    message.set_error(MessageError::transformation(safe_message, detail));
    StageOutcome::Failed(message)
}

fn parsed_event(
    message: &Message,
    state: Option<&IntermediateState>,
) -> std::result::Result<Arc<ParsedEvent>, String> {
    IntermediateState::enriched_event(state, message).map_err(|e| e.to_string())
}

pub fn base64_encode() -> TransformationFn {
    Arc::new(|mut message, _| {
        message.data = Bytes::from(STANDARD.encode(&message.data));
        StageOutcome::Success(message, None)
    })
}

pub fn base64_decode() -> TransformationFn {
    Arc::new(|mut message, _| match STANDARD.decode(&message.data) {
        Ok(decoded) => {
            message.data = Bytes::from(decoded);
            StageOutcome::Success(message, None)
        }
        Err(e) => fail(message, "failed to decode data as base64", e),
    })
}

/// Replaces an enriched TSV payload with its JSON form.
pub fn sp_enriched_to_json() -> TransformationFn {
    Arc::new(|mut message, state| {
        let parsed = match parsed_event(&message, state.as_ref()) {
            Ok(parsed) => parsed,
            Err(e) => return fail(message, "cannot parse message as a snowplow enriched event", e),
        };
        match parsed.to_json() {
            Ok(json) => {
                message.data = Bytes::from(json);
                StageOutcome::Success(message, Some(IntermediateState::SpEnriched(parsed)))
            }
            Err(e) => fail(message, "error transforming event to JSON", e),
        }
    })
}

/// Uses the value of an atomic field as the partition key. An empty field yields an empty key.
pub fn sp_enriched_set_pk(atomic_field: &str) -> Result<TransformationFn> {
    if !is_known_field(atomic_field) {
        return Err(Error::Config(format!(
            "unknown atomic field {atomic_field:?} for sp_enriched_set_pk"
        )));
    }
    let field = atomic_field.to_string();
    Ok(Arc::new(move |mut message, state| {
        let parsed = match parsed_event(&message, state.as_ref()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return fail(message, "intermediate state cannot be parsed as parsedEvent", e);
            }
        };
        match parsed.get_value(&field) {
            Ok(value) => {
                message.partition_key = display_value(value.as_ref());
                StageOutcome::Success(message, Some(IntermediateState::SpEnriched(parsed)))
            }
            Err(e) => fail(message, "failed to get value of the provided atomic field", e),
        }
    }))
}

/// Keeps or drops events depending on whether an atomic field matches a regex. Empty fields are
/// matched as the empty string.
pub fn sp_enriched_filter(config: &SpEnrichedFilterConfig) -> Result<TransformationFn> {
    if !is_known_field(&config.atomic_field) {
        return Err(Error::Config(format!(
            "unknown atomic field {:?} for sp_enriched_filter",
            config.atomic_field
        )));
    }
    let field = config.atomic_field.clone();
    filter_stage(&config.regex, config.filter_action, move |parsed| {
        Ok(vec![parsed.raw_value(&field)?.to_string()])
    })
}

pub fn sp_enriched_filter_context(
    config: &SpEnrichedFilterContextConfig,
) -> Result<TransformationFn> {
    let path = field_path(&config.custom_field_path)?;
    let name = config.context_full_name.clone();
    filter_stage(&config.regex, config.filter_action, move |parsed| {
        let values = parsed.context_values(&name, &path)?;
        Ok(values.iter().map(|v| display_value(Some(v))).collect())
    })
}

pub fn sp_enriched_filter_unstruct_event(
    config: &SpEnrichedFilterUnstructEventConfig,
) -> Result<TransformationFn> {
    let path = field_path(&config.custom_field_path)?;
    let version = compile(&config.unstruct_event_version_regex)?;
    let name = config.unstruct_event_name.clone();
    filter_stage(&config.regex, config.filter_action, move |parsed| {
        if parsed.raw_value("event_name")? != name
            || !version.is_match(parsed.raw_value("event_version")?)
        {
            return Ok(Vec::new());
        }
        let value = parsed.unstruct_event_value(&path)?;
        Ok(value.iter().map(|v| display_value(Some(v))).collect())
    })
}

fn field_path(path: &str) -> Result<Vec<PathSegment>> {
    parse_field_path(path).map_err(|e| Error::Config(format!("error creating filter: {e}")))
}

fn compile(regex: &str) -> Result<Regex> {
    Regex::new(regex).map_err(|e| Error::Config(format!("error compiling regex for filter: {e}")))
}

/// Shared body of the filters. `values` extracts what the regex is run against; no values at all
/// is matched as the empty string. The event passes when any value matches.
fn filter_stage<V>(regex: &str, action: FilterAction, values: V) -> Result<TransformationFn>
where
    V: Fn(&ParsedEvent) -> std::result::Result<Vec<String>, SnowplowError> + Send + Sync + 'static,
{
    let regex = compile(regex)?;
    let drop_if_matched = action == FilterAction::Drop;

    Ok(Arc::new(move |message, state| {
        let parsed = match parsed_event(&message, state.as_ref()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return fail(message, "intermediate state cannot be parsed as parsedEvent", e);
            }
        };
        let matched = match values(&parsed) {
            Ok(found) if found.is_empty() => regex.is_match(""),
            Ok(found) => found.iter().any(|v| regex.is_match(v)),
            Err(e) => return fail(message, "failed to get value of parsed event", e),
        };
        if matched == drop_if_matched {
            return StageOutcome::Filtered(message);
        }
        StageOutcome::Success(message, Some(IntermediateState::SpEnriched(parsed)))
    }))
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snowplow::test_data::{enriched_event, sample_event};

    fn success(outcome: StageOutcome) -> (Message, Option<IntermediateState>) {
        match outcome {
            StageOutcome::Success(msg, state) => (msg, state),
            other => panic!("expected success, got {other:?}"),
        }
    }

    fn filter(field: &str, regex: &str, action: FilterAction) -> TransformationFn {
        sp_enriched_filter(&SpEnrichedFilterConfig {
            atomic_field: field.to_string(),
            regex: regex.to_string(),
            filter_action: action,
        })
        .unwrap()
    }

    #[test]
    fn test_base64_roundtrip() {
        let (encoded, state) = success(base64_encode()(Message::new("Hello!", "k"), None));
        assert_eq!(encoded.data, Bytes::from("SGVsbG8h"));
        assert!(state.is_none());

        let (decoded, _) = success(base64_decode()(encoded, None));
        assert_eq!(decoded.data, Bytes::from("Hello!"));
    }

    #[test]
    fn test_base64_decode_failure() {
        let StageOutcome::Failed(msg) = base64_decode()(Message::new("not base64!", "k"), None)
        else {
            panic!("expected failure");
        };
        assert_eq!(
            msg.error.unwrap().safe_message(),
            "failed to decode data as base64"
        );
        assert_eq!(msg.data, Bytes::from("not base64!"));
    }

    #[test]
    fn test_to_json_keeps_parsed_event() {
        let (msg, state) = success(sp_enriched_to_json()(Message::new(sample_event(), "k"), None));
        let json: Value = serde_json::from_slice(&msg.data).unwrap();
        assert_eq!(json["app_id"], "test-data1");
        assert!(matches!(state, Some(IntermediateState::SpEnriched(_))));
    }

    #[test]
    fn test_to_json_rejects_non_enriched() {
        let outcome = sp_enriched_to_json()(Message::new("just text", "k"), None);
        assert!(matches!(outcome, StageOutcome::Failed(_)));
    }

    #[test]
    fn test_set_pk() {
        assert!(matches!(sp_enriched_set_pk("nope"), Err(Error::Config(_))));

        let stage = sp_enriched_set_pk("app_id").unwrap();
        let (msg, _) = success(stage(Message::new(sample_event(), "old"), None));
        assert_eq!(msg.partition_key, "test-data1");

        let stage = sp_enriched_set_pk("domain_sessionidx").unwrap();
        let (msg, _) = success(stage(Message::new(sample_event(), "old"), None));
        assert_eq!(msg.partition_key, "3");
    }

    #[test]
    fn test_set_pk_reuses_state() {
        let (to_json, state) =
            success(sp_enriched_to_json()(Message::new(sample_event(), "k"), None));
        // the payload is JSON now, so only the state can provide the field
        let (msg, _) = success(sp_enriched_set_pk("platform").unwrap()(to_json, state));
        assert_eq!(msg.partition_key, "pc");
    }

    #[test]
    fn test_filter_keep_and_drop() {
        let keep = filter("app_id", "^test-data", FilterAction::Keep);
        assert!(matches!(
            keep(Message::new(sample_event(), "k"), None),
            StageOutcome::Success(..)
        ));
        let keep_other = filter("app_id", "^other$", FilterAction::Keep);
        assert!(matches!(
            keep_other(Message::new(sample_event(), "k"), None),
            StageOutcome::Filtered(_)
        ));

        let drop = filter("app_id", "^test-data", FilterAction::Drop);
        assert!(matches!(
            drop(Message::new(sample_event(), "k"), None),
            StageOutcome::Filtered(_)
        ));
    }

    #[test]
    fn test_filter_empty_field_matches_empty_string() {
        let keep_empty = filter("user_id", "^$", FilterAction::Keep);
        assert!(matches!(
            keep_empty(Message::new(sample_event(), "k"), None),
            StageOutcome::Success(..)
        ));
    }

    #[test]
    fn test_filter_config_errors() {
        let bad_regex = sp_enriched_filter(&SpEnrichedFilterConfig {
            atomic_field: "app_id".to_string(),
            regex: "(".to_string(),
            filter_action: FilterAction::Keep,
        });
        assert!(matches!(bad_regex, Err(Error::Config(_))));
    }

    fn nested_context_event() -> String {
        enriched_event(&[(
            "contexts",
            r#"{"schema":"iglu:com.snowplowanalytics.snowplow/contexts/jsonschema/1-0-0","data":[{"schema":"iglu:nl.basjes/yauaa_context/jsonschema/1-0-0","data":{"test1":{"test2":[{"test3":"testValue"}]}}},{"schema":"iglu:nl.basjes/yauaa_context/jsonschema/1-0-0","data":{"test1":{"test2":[{"test3":1}]}}}]}"#,
        )])
    }

    fn context_filter(
        name: &str,
        path: &str,
        regex: &str,
        action: FilterAction,
    ) -> TransformationFn {
        sp_enriched_filter_context(&SpEnrichedFilterContextConfig {
            context_full_name: name.to_string(),
            custom_field_path: path.to_string(),
            regex: regex.to_string(),
            filter_action: action,
        })
        .unwrap()
    }

    fn kept(stage: &TransformationFn, data: &str) -> bool {
        match stage(Message::new(data.to_string(), "k"), None) {
            StageOutcome::Success(..) => true,
            StageOutcome::Filtered(_) => false,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_context_filter() {
        let event = nested_context_event();
        let name = "contexts_nl_basjes_yauaa_context_1";
        let path = "test1.test2[0].test3";

        assert!(kept(&context_filter(name, path, "^testValue$", FilterAction::Keep), &event));
        assert!(!kept(&context_filter(name, path, "^testValue$", FilterAction::Drop), &event));
        // numbers are matched on their text
        assert!(kept(&context_filter(name, path, "^1$", FilterAction::Keep), &event));
        assert!(!kept(&context_filter(name, path, "^1$", FilterAction::Drop), &event));

        let other = "contexts_nl_basjes_yauaa_context_2";
        assert!(!kept(&context_filter(other, path, "^testValue$", FilterAction::Keep), &event));
        let missing = "test1.test2[0].nothingHere";
        assert!(!kept(&context_filter(name, missing, "^testValue$", FilterAction::Keep), &event));
        assert!(kept(&context_filter(name, missing, "^testValue$", FilterAction::Drop), &event));
    }

    #[test]
    fn test_context_filter_config_errors() {
        let unmatched_brace = sp_enriched_filter_context(&SpEnrichedFilterContextConfig {
            context_full_name: "contexts_nl_basjes_yauaa_context_1".to_string(),
            custom_field_path: "test1.test2[0.test3".to_string(),
            regex: ".*".to_string(),
            filter_action: FilterAction::Keep,
        });
        assert!(matches!(unmatched_brace, Err(Error::Config(_))));
    }

    #[test]
    fn test_unstruct_event_filter() {
        let filter = |version: &str, regex: &str, action| {
            sp_enriched_filter_unstruct_event(&SpEnrichedFilterUnstructEventConfig {
                unstruct_event_name: "add_to_cart".to_string(),
                unstruct_event_version_regex: version.to_string(),
                custom_field_path: "sku".to_string(),
                regex: regex.to_string(),
                filter_action: action,
            })
            .unwrap()
        };
        let unstruct = r#"{"schema":"iglu:com.snowplowanalytics.snowplow/unstruct_event/jsonschema/1-0-0","data":{"schema":"iglu:com.snowplowanalytics.snowplow/add_to_cart/jsonschema/1-0-0","data":{"sku":"item41","quantity":2}}}"#;
        let event = |name: &str| {
            enriched_event(&[
                ("event_name", name),
                ("event_version", "1-0-0"),
                ("unstruct_event", unstruct),
            ])
        };

        assert!(kept(&filter(".*", "^item41$", FilterAction::Keep), &event("add_to_cart")));
        assert!(!kept(&filter(".*", "^item41$", FilterAction::Drop), &event("add_to_cart")));
        assert!(!kept(&filter(".*", "^item42$", FilterAction::Keep), &event("add_to_cart")));

        // another version or event name leaves nothing to match
        assert!(!kept(&filter("^2-", "^item41$", FilterAction::Keep), &event("add_to_cart")));
        assert!(!kept(&filter(".*", "^item41$", FilterAction::Keep), &event("remove_from_cart")));
        assert!(kept(&filter(".*", "^item41$", FilterAction::Drop), &event("remove_from_cart")));
    }

    #[test]
    fn test_unstruct_event_filter_rejects_non_enriched() {
        let stage = sp_enriched_filter_unstruct_event(&SpEnrichedFilterUnstructEventConfig {
            unstruct_event_name: "add_to_cart".to_string(),
            unstruct_event_version_regex: ".*".to_string(),
            custom_field_path: "sku".to_string(),
            regex: ".*".to_string(),
            filter_action: FilterAction::Keep,
        });
        assert!(matches!(
            stage.unwrap()(Message::new("just text", "k"), None),
            StageOutcome::Failed(_)
        ));
    }
}
