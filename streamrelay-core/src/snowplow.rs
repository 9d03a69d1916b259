//! Parser for Snowplow enriched events: one tab separated line with a fixed set of 131 fields.
//!
//! Fields are kept as raw strings after parsing and converted on demand, so a stage that only
//! needs a single field (e.g. setting the partition key) does not pay for a full conversion.
//! Self-describing contexts and unstructured events are shredded into keys of the form
//! `contexts_<vendor>_<name>_<major>` and `unstruct_event_<vendor>_<name>_<major>`.

use chrono::{NaiveDateTime, SecondsFormat};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnowplowError {
    #[error("cannot parse tsv event - payload is not valid utf-8")]
    NotUtf8,

    #[error("cannot parse tsv event - wrong number of fields provided: {0}")]
    WrongFieldCount(usize),

    #[error("unknown field {0:?}")]
    UnknownField(String),

    #[error("error parsing field {field}: {reason}")]
    Field { field: &'static str, reason: String },

    #[error("invalid field path {0:?}")]
    InvalidPath(String),
}

/// One step into a JSON document: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Splits a path like `test1.test2[0].test3` into keys and array indexes.
pub fn parse_field_path(path: &str) -> Result<Vec<PathSegment>, SnowplowError> {
    let invalid = || SnowplowError::InvalidPath(path.to_string());
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = part.split_at(part.find('[').unwrap_or(part.len()));
        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string()));
        }
        while let Some(inner) = rest.strip_prefix('[') {
            let (index, after) = inner.split_once(']').ok_or_else(invalid)?;
            segments.push(PathSegment::Index(index.parse().map_err(|_| invalid())?));
            rest = after;
        }
        if !rest.is_empty() {
            return Err(invalid());
        }
    }
    if segments.is_empty() {
        return Err(invalid());
    }
    Ok(segments)
}

fn lookup<'a>(mut value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    for segment in path {
        value = match segment {
            PathSegment::Key(key) => value.get(key.as_str())?,
            PathSegment::Index(index) => value.get(*index)?,
        };
    }
    Some(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Str,
    Int,
    Double,
    Bool,
    Timestamp,
    Contexts,
    Unstruct,
}

use FieldKind::{Bool, Contexts, Double, Int, Str, Timestamp, Unstruct};

const FIELDS: [(&str, FieldKind); 131] = [
    ("app_id", Str),
    ("platform", Str),
    ("etl_tstamp", Timestamp),
    ("collector_tstamp", Timestamp),
    ("dvce_created_tstamp", Timestamp),
    ("event", Str),
    ("event_id", Str),
    ("txn_id", Int),
    ("name_tracker", Str),
    ("v_tracker", Str),
    ("v_collector", Str),
    ("v_etl", Str),
    ("user_id", Str),
    ("user_ipaddress", Str),
    ("user_fingerprint", Str),
    ("domain_userid", Str),
    ("domain_sessionidx", Int),
    ("network_userid", Str),
    ("geo_country", Str),
    ("geo_region", Str),
    ("geo_city", Str),
    ("geo_zipcode", Str),
    ("geo_latitude", Double),
    ("geo_longitude", Double),
    ("geo_region_name", Str),
    ("ip_isp", Str),
    ("ip_organization", Str),
    ("ip_domain", Str),
    ("ip_netspeed", Str),
    ("page_url", Str),
    ("page_title", Str),
    ("page_referrer", Str),
    ("page_urlscheme", Str),
    ("page_urlhost", Str),
    ("page_urlport", Int),
    ("page_urlpath", Str),
    ("page_urlquery", Str),
    ("page_urlfragment", Str),
    ("refr_urlscheme", Str),
    ("refr_urlhost", Str),
    ("refr_urlport", Int),
    ("refr_urlpath", Str),
    ("refr_urlquery", Str),
    ("refr_urlfragment", Str),
    ("refr_medium", Str),
    ("refr_source", Str),
    ("refr_term", Str),
    ("mkt_medium", Str),
    ("mkt_source", Str),
    ("mkt_term", Str),
    ("mkt_content", Str),
    ("mkt_campaign", Str),
    ("contexts", Contexts),
    ("se_category", Str),
    ("se_action", Str),
    ("se_label", Str),
    ("se_property", Str),
    ("se_value", Double),
    ("unstruct_event", Unstruct),
    ("tr_orderid", Str),
    ("tr_affiliation", Str),
    ("tr_total", Double),
    ("tr_tax", Double),
    ("tr_shipping", Double),
    ("tr_city", Str),
    ("tr_state", Str),
    ("tr_country", Str),
    ("ti_orderid", Str),
    ("ti_sku", Str),
    ("ti_name", Str),
    ("ti_category", Str),
    ("ti_price", Double),
    ("ti_quantity", Int),
    ("pp_xoffset_min", Int),
    ("pp_xoffset_max", Int),
    ("pp_yoffset_min", Int),
    ("pp_yoffset_max", Int),
    ("useragent", Str),
    ("br_name", Str),
    ("br_family", Str),
    ("br_version", Str),
    ("br_type", Str),
    ("br_renderengine", Str),
    ("br_lang", Str),
    ("br_features_pdf", Bool),
    ("br_features_flash", Bool),
    ("br_features_java", Bool),
    ("br_features_director", Bool),
    ("br_features_quicktime", Bool),
    ("br_features_realplayer", Bool),
    ("br_features_windowsmedia", Bool),
    ("br_features_gears", Bool),
    ("br_features_silverlight", Bool),
    ("br_cookies", Bool),
    ("br_colordepth", Str),
    ("br_viewwidth", Int),
    ("br_viewheight", Int),
    ("os_name", Str),
    ("os_family", Str),
    ("os_manufacturer", Str),
    ("os_timezone", Str),
    ("dvce_type", Str),
    ("dvce_ismobile", Bool),
    ("dvce_screenwidth", Int),
    ("dvce_screenheight", Int),
    ("doc_charset", Str),
    ("doc_width", Int),
    ("doc_height", Int),
    ("tr_currency", Str),
    ("tr_total_base", Double),
    ("tr_tax_base", Double),
    ("tr_shipping_base", Double),
    ("ti_currency", Str),
    ("ti_price_base", Double),
    ("base_currency", Str),
    ("geo_timezone", Str),
    ("mkt_clickid", Str),
    ("mkt_network", Str),
    ("etl_tags", Str),
    ("dvce_sent_tstamp", Timestamp),
    ("refr_domain_userid", Str),
    ("refr_dvce_tstamp", Timestamp),
    ("derived_contexts", Contexts),
    ("domain_sessionid", Str),
    ("derived_tstamp", Timestamp),
    ("event_vendor", Str),
    ("event_name", Str),
    ("event_format", Str),
    ("event_version", Str),
    ("event_fingerprint", Str),
    ("true_tstamp", Timestamp),
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A successfully split enriched event.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    fields: Vec<String>,
}

impl ParsedEvent {
    pub fn parse(data: &[u8]) -> Result<Self, SnowplowError> {
        let line = std::str::from_utf8(data).map_err(|_| SnowplowError::NotUtf8)?;
        let fields: Vec<String> = line.split('\t').map(str::to_string).collect();
        if fields.len() != FIELDS.len() {
            return Err(SnowplowError::WrongFieldCount(fields.len()));
        }
        Ok(Self { fields })
    }

    /// Converts every non-empty field into its typed JSON value.
    pub fn to_map(&self) -> Result<Map<String, Value>, SnowplowError> {
        let mut out = Map::new();
        for ((name, kind), raw) in FIELDS.iter().zip(&self.fields) {
            if raw.is_empty() {
                continue;
            }
            match kind {
                Contexts => {
                    for (key, data) in shred_contexts(name, raw)? {
                        match out.get_mut(&key) {
                            Some(Value::Array(existing)) => existing.push(data),
                            _ => {
                                out.insert(key, Value::Array(vec![data]));
                            }
                        }
                    }
                }
                Unstruct => {
                    let (key, data) = shred_unstruct(name, raw)?;
                    out.insert(key, data);
                }
                _ => {
                    out.insert(name.to_string(), convert(name, *kind, raw)?);
                }
            }
        }
        Ok(out)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, SnowplowError> {
        let map = self.to_map()?;
        serde_json::to_vec(&Value::Object(map)).map_err(|e| SnowplowError::Field {
            field: "event",
            reason: e.to_string(),
        })
    }

    /// Typed value of one atomic field. `None` when the field is empty.
    pub fn get_value(&self, field: &str) -> Result<Option<Value>, SnowplowError> {
        let (idx, &(name, kind)) = FIELDS
            .iter()
            .enumerate()
            .find(|(_, (name, _))| *name == field)
            .ok_or_else(|| SnowplowError::UnknownField(field.to_string()))?;
        let raw = self.fields.get(idx).map(String::as_str).unwrap_or_default();
        if raw.is_empty() {
            return Ok(None);
        }
        match kind {
            Contexts | Unstruct => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| field_err(name, e)),
            _ => convert(name, kind, raw).map(Some),
        }
    }

    /// Values at `path` in every context shredded as `name`, from both `contexts` and
    /// `derived_contexts`. Contexts without a value at `path` are skipped.
    pub fn context_values(
        &self,
        name: &str,
        path: &[PathSegment],
    ) -> Result<Vec<Value>, SnowplowError> {
        let mut found = Vec::new();
        for (&(field, kind), raw) in FIELDS.iter().zip(&self.fields) {
            if kind != Contexts || raw.is_empty() {
                continue;
            }
            for (key, data) in shred_contexts(field, raw)? {
                if key == name
                    && let Some(value) = lookup(&data, path)
                {
                    found.push(value.clone());
                }
            }
        }
        Ok(found)
    }

    /// Value at `path` in the unstructured event's data. `None` without an event or a value.
    pub fn unstruct_event_value(
        &self,
        path: &[PathSegment],
    ) -> Result<Option<Value>, SnowplowError> {
        let raw = self.raw_value("unstruct_event")?;
        if raw.is_empty() {
            return Ok(None);
        }
        let (_, data) = shred_unstruct("unstruct_event", raw)?;
        Ok(lookup(&data, path).cloned())
    }

    /// Raw text of one atomic field. Empty fields are returned as an empty string.
    pub fn raw_value(&self, field: &str) -> Result<&str, SnowplowError> {
        FIELDS
            .iter()
            .position(|(name, _)| *name == field)
            .and_then(|idx| self.fields.get(idx))
            .map(String::as_str)
            .ok_or_else(|| SnowplowError::UnknownField(field.to_string()))
    }
}

/// Whether `field` names one of the atomic enriched-event fields.
pub fn is_known_field(field: &str) -> bool {
    FIELDS.iter().any(|(name, _)| *name == field)
}

fn field_err(field: &'static str, reason: impl ToString) -> SnowplowError {
    SnowplowError::Field {
        field,
        reason: reason.to_string(),
    }
}

fn convert(name: &'static str, kind: FieldKind, raw: &str) -> Result<Value, SnowplowError> {
    match kind {
        Str => Ok(Value::String(raw.to_string())),
        Int => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| field_err(name, e)),
        Double => {
            let v = raw.parse::<f64>().map_err(|e| field_err(name, e))?;
            serde_json::Number::from_f64(v)
                .map(Value::Number)
                .ok_or_else(|| field_err(name, "not a finite number"))
        }
        Bool => match raw {
            "1" => Ok(Value::Bool(true)),
            "0" => Ok(Value::Bool(false)),
            other => Err(field_err(name, format!("invalid boolean {other:?}"))),
        },
        Timestamp => NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
            .map(|t| {
                Value::String(t.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true))
            })
            .map_err(|e| field_err(name, e)),
        Contexts | Unstruct => Err(field_err(name, "self-describing field is not atomic")),
    }
}

fn self_describing(name: &'static str, value: &Value) -> Result<(String, Value), SnowplowError> {
    let schema = value
        .get("schema")
        .and_then(Value::as_str)
        .ok_or_else(|| field_err(name, "missing schema"))?;
    let data = value
        .get("data")
        .cloned()
        .ok_or_else(|| field_err(name, "missing data"))?;
    Ok((schema.to_string(), data))
}

fn shred_contexts(name: &'static str, raw: &str) -> Result<Vec<(String, Value)>, SnowplowError> {
    let envelope: Value = serde_json::from_str(raw).map_err(|e| field_err(name, e))?;
    let (_, inner) = self_describing(name, &envelope)?;
    let Value::Array(contexts) = inner else {
        return Err(field_err(name, "contexts data is not an array"));
    };
    contexts
        .iter()
        .map(|ctx| -> Result<(String, Value), SnowplowError> {
            let (schema, data) = self_describing(name, ctx)?;
            Ok((shredded_key("contexts", &schema).ok_or_else(|| field_err(name, schema))?, data))
        })
        .collect()
}

fn shred_unstruct(name: &'static str, raw: &str) -> Result<(String, Value), SnowplowError> {
    let envelope: Value = serde_json::from_str(raw).map_err(|e| field_err(name, e))?;
    let (_, inner) = self_describing(name, &envelope)?;
    let (schema, data) = self_describing(name, &inner)?;
    let key = shredded_key("unstruct_event", &schema).ok_or_else(|| field_err(name, schema))?;
    Ok((key, data))
}

/// `iglu:com.acme/someEvent/jsonschema/1-0-2` becomes `<prefix>_com_acme_some_event_1`.
fn shredded_key(prefix: &str, schema: &str) -> Option<String> {
    let path = schema.strip_prefix("iglu:")?;
    let mut parts = path.split('/');
    let vendor = parts.next()?;
    let name = parts.next()?;
    let _format = parts.next()?;
    let major = parts.next()?.split('-').next()?;
    if vendor.is_empty() || name.is_empty() || major.is_empty() {
        return None;
    }
    Some(format!(
        "{prefix}_{}_{}_{major}",
        vendor.replace(['.', '-'], "_"),
        snake_case(name)
    ))
}

fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else if c == '-' {
            out.push('_');
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod test_data {
    use super::FIELDS;

    /// Builds a tab separated enriched event with the given fields set and all others empty.
    pub(crate) fn enriched_event(values: &[(&str, &str)]) -> String {
        FIELDS
            .iter()
            .map(|(name, _)| {
                values
                    .iter()
                    .find(|(field, _)| field == name)
                    .map(|(_, v)| *v)
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join("\t")
    }

    pub(crate) fn sample_event() -> String {
        enriched_event(&[
            ("app_id", "test-data1"),
            ("platform", "pc"),
            ("collector_tstamp", "2019-05-10 14:40:35.972"),
            ("event", "unstruct"),
            ("event_id", "e9234345-f042-46ad-b1aa-424464066a33"),
            ("domain_sessionidx", "3"),
            ("geo_latitude", "51.5"),
            ("br_cookies", "1"),
            ("dvce_ismobile", "0"),
            (
                "contexts",
                r#"{"schema":"iglu:com.snowplowanalytics.snowplow/contexts/jsonschema/1-0-0","data":[{"schema":"iglu:com.acme/justInts/jsonschema/1-0-0","data":{"integerField":0}},{"schema":"iglu:com.acme/justInts/jsonschema/1-0-0","data":{"integerField":1}}]}"#,
            ),
            (
                "unstruct_event",
                r#"{"schema":"iglu:com.snowplowanalytics.snowplow/unstruct_event/jsonschema/1-0-0","data":{"schema":"iglu:com.snowplowanalytics.snowplow/add_to_cart/jsonschema/1-0-0","data":{"sku":"item41","quantity":2}}}"#,
            ),
        ])
    }
}
