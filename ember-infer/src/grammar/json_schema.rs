//! JSON Schema to GBNF conversion, covering the subset that matters for
//! structured output: objects, arrays, enums, unions and `$ref`s.

use super::parser::MAX_REPETITION;
use ember_core::error::{EmberError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

const SPACE_RULE: &str = r#"| " " | "\n" [ \t]{0,20}"#;

const PRIMITIVES: &[(&str, &str, &[&str])] = &[
    ("boolean", r#"("true" | "false") space"#, &[]),
    ("null", r#""null" space"#, &[]),
    ("decimal-part", "[0-9]{1,16}", &[]),
    ("integral-part", "[0] | [1-9] [0-9]{0,15}", &[]),
    (
        "number",
        r#"("-"? integral-part) ("." decimal-part)? ([eE] [-+]? integral-part)? space"#,
        &["integral-part", "decimal-part"],
    ),
    ("integer", r#"("-"? integral-part) space"#, &["integral-part"]),
    ("char", r#"[^"\\\x7F\x00-\x1F] | [\\] (["\\bfnrt] | "u" [0-9a-fA-F]{4})"#, &[]),
    ("string", r#""\"" char* "\"" space"#, &["char"]),
    (
        "value",
        "object | array | string | number | boolean | null",
        &["object", "array", "string", "number", "boolean", "null"],
    ),
    (
        "object",
        r#""{" space ( string ":" space value ("," space string ":" space value)* )? "}" space"#,
        &["string", "value"],
    ),
    (
        "array",
        r#""[" space ( value ("," space value)* )? "]" space"#,
        &["value"],
    ),
];

fn fail(msg: impl Into<String>) -> EmberError {
    EmberError::GrammarCompileFailed(msg.into())
}

/// Quote `text` as a GBNF string literal.
fn literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn json_literal(value: &Value) -> String {
    format!("{} space", literal(&value.to_string()))
}

/// Clamp `minLength`/`minItems` style bounds to what a grammar can expand.
/// An upper bound past the limit becomes unbounded.
fn bounds(name: &str, min: u64, max: Option<u64>) -> Result<(u64, Option<u64>)> {
    let limit = MAX_REPETITION as u64;
    if min > limit {
        return Err(fail(format!("minimum count {min} in '{name}' exceeds {limit}")));
    }
    Ok((min, max.filter(|&hi| hi <= limit)))
}

fn rule_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "r".into()
    } else {
        cleaned
    }
}

/// Convert a schema into GBNF whose `root` rule accepts matching JSON text.
pub fn schema_to_gbnf(schema: &Value) -> Result<String> {
    let mut conv = Converter {
        root: schema,
        rules: BTreeMap::new(),
        refs: HashMap::new(),
    };
    conv.rules.insert("space".into(), SPACE_RULE.into());
    let body = conv.visit(schema, "root")?;
    if body != "root" {
        conv.rules.insert("root".into(), body);
    }
    Ok(conv
        .rules
        .iter()
        .map(|(name, body)| format!("{name} ::= {body}\n"))
        .collect())
}

struct Converter<'a> {
    root: &'a Value,
    rules: BTreeMap<String, String>,
    refs: HashMap<String, String>,
}

impl Converter<'_> {
    fn add_rule(&mut self, name: &str, body: String) -> String {
        let base = rule_name(name);
        let mut key = base.clone();
        let mut i = 0;
        while let Some(existing) = self.rules.get(&key) {
            if *existing == body {
                return key;
            }
            i += 1;
            key = format!("{base}{i}");
        }
        self.rules.insert(key.clone(), body);
        key
    }

    /// Claim a name that no rule, built-in or generated, uses or can use.
    fn reserve(&mut self, name: &str) -> String {
        let base = rule_name(name);
        let mut key = base.clone();
        let mut i = 0;
        while self.rules.contains_key(&key) || PRIMITIVES.iter().any(|(n, ..)| *n == key) {
            i += 1;
            key = format!("{base}{i}");
        }
        self.rules.insert(key.clone(), String::new());
        key
    }

    fn primitive(&mut self, name: &str) -> String {
        if let Some((_, body, deps)) = PRIMITIVES.iter().find(|(n, ..)| *n == name) {
            if !self.rules.contains_key(name) {
                self.rules.insert(name.to_string(), body.to_string());
                for dep in deps.iter() {
                    self.primitive(dep);
                }
            }
        }
        name.to_string()
    }

    /// Returns a rule body (or a rule name) matching `schema`.
    fn visit(&mut self, schema: &Value, name: &str) -> Result<String> {
        let obj = match schema {
            Value::Bool(true) => return Ok(self.primitive("value")),
            Value::Bool(false) => return Err(fail("schema 'false' matches nothing")),
            Value::Object(obj) => obj,
            _ => return Err(fail(format!("schema for '{name}' must be an object"))),
        };

        if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
            return self.visit_ref(reference);
        }
        if let Some(values) = obj.get("enum").and_then(Value::as_array) {
            if values.is_empty() {
                return Err(fail(format!("empty enum in '{name}'")));
            }
            let alts: Vec<String> = values.iter().map(json_literal).collect();
            return Ok(self.add_rule(name, format!("({})", alts.join(" | "))));
        }
        if let Some(value) = obj.get("const") {
            return Ok(self.add_rule(name, json_literal(value)));
        }
        if let Some(variants) = obj
            .get("anyOf")
            .or_else(|| obj.get("oneOf"))
            .and_then(Value::as_array)
        {
            let alts = variants
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let body = self.visit(v, &format!("{name}-{i}"))?;
                    Ok(self.add_rule(&format!("{name}-{i}"), body))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(self.add_rule(name, alts.join(" | ")));
        }

        match obj.get("type") {
            Some(Value::Array(types)) => {
                let alts = types
                    .iter()
                    .enumerate()
                    .map(|(i, t)| {
                        let mut sub = obj.clone();
                        sub.insert("type".into(), t.clone());
                        let sub_name = format!("{name}-{i}");
                        let body = self.visit(&Value::Object(sub), &sub_name)?;
                        Ok(self.add_rule(&sub_name, body))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.add_rule(name, alts.join(" | ")))
            }
            Some(Value::String(t)) => match t.as_str() {
                "object" => self.visit_object(obj, name),
                "array" => self.visit_array(obj, name),
                "string" => self.visit_string(obj, name),
                "integer" | "number" | "boolean" | "null" => Ok(self.primitive(t)),
                other => Err(fail(format!("unsupported type '{other}'"))),
            },
            Some(_) => Err(fail(format!("invalid 'type' in '{name}'"))),
            None if obj.contains_key("properties") => self.visit_object(obj, name),
            None if obj.contains_key("items") || obj.contains_key("prefixItems") => {
                self.visit_array(obj, name)
            }
            None => Ok(self.primitive("value")),
        }
    }

    fn visit_ref(&mut self, reference: &str) -> Result<String> {
        if let Some(rule) = self.refs.get(reference) {
            return Ok(rule.clone());
        }
        let pointer = reference
            .strip_prefix('#')
            .ok_or_else(|| fail(format!("only local $ref is supported: {reference}")))?;
        let root = self.root;
        let target = root
            .pointer(pointer)
            .ok_or_else(|| fail(format!("unresolved $ref {reference}")))?;
        let last = pointer.rsplit('/').next().unwrap_or_default();
        // registered before visiting so recursive schemas terminate
        let name = self.reserve(&format!("ref-{last}"));
        self.refs.insert(reference.to_string(), name.clone());
        let body = self.visit(target, &format!("{name}-def"))?;
        self.rules.insert(name.clone(), body);
        Ok(name)
    }

    fn visit_string(&mut self, obj: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
        let min = obj.get("minLength").and_then(Value::as_u64).unwrap_or(0);
        let max = obj.get("maxLength").and_then(Value::as_u64);
        let reps = match bounds(name, min, max)? {
            (0, None) => return Ok(self.primitive("string")),
            (lo, Some(hi)) => format!("{{{lo},{hi}}}"),
            (lo, None) => format!("{{{lo},}}"),
        };
        self.primitive("char");
        Ok(self.add_rule(name, format!(r#""\"" char{reps} "\"" space"#)))
    }

    fn visit_array(&mut self, obj: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
        if let Some(tuple) = obj.get("prefixItems").and_then(Value::as_array) {
            let mut parts = Vec::new();
            for (i, item) in tuple.iter().enumerate() {
                let item_name = format!("{name}-tuple-{i}");
                let body = self.visit(item, &item_name)?;
                parts.push(self.add_rule(&item_name, body));
            }
            let inner = parts.join(r#" "," space "#);
            return Ok(self.add_rule(name, format!(r#""[" space {inner} "]" space"#)));
        }
        let item_schema = obj.get("items").cloned().unwrap_or(Value::Bool(true));
        let item_name = format!("{name}-item");
        let body = self.visit(&item_schema, &item_name)?;
        let item = self.add_rule(&item_name, body);

        let min = obj.get("minItems").and_then(Value::as_u64).unwrap_or(0);
        let max = obj.get("maxItems").and_then(Value::as_u64);
        let (min, max) = bounds(name, min, max)?;
        let more = format!(r#"("," space {item})"#);
        let list = match (min, max) {
            (_, Some(0)) => String::new(),
            (0, None) => format!("( {item} {more}* )?"),
            (0, Some(hi)) => format!("( {item} {more}{{0,{}}} )?", hi - 1),
            (lo, None) => format!("{item} {more}{{{},}}", lo - 1),
            (lo, Some(hi)) => format!("{item} {more}{{{},{}}}", lo - 1, hi.max(lo) - 1),
        };
        Ok(self.add_rule(name, format!(r#""[" space {list} "]" space"#)))
    }

    fn visit_object(&mut self, obj: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
        let Some(props) = obj.get("properties").and_then(Value::as_object) else {
            return Ok(self.primitive("object"));
        };
        let required: Vec<&str> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut kv_rules = HashMap::new();
        let (mut req, mut opt) = (Vec::new(), Vec::new());
        for (key, schema) in props {
            let prop_name = format!("{name}-{key}");
            let body = self.visit(schema, &prop_name)?;
            let value = self.add_rule(&prop_name, body);
            let kv = self.add_rule(
                &format!("{prop_name}-kv"),
                format!(r#"{} space ":" space {value}"#, literal(&Value::String(key.clone()).to_string())),
            );
            kv_rules.insert(key.as_str(), kv);
            if required.contains(&key.as_str()) {
                req.push(key.as_str());
            } else {
                opt.push(key.as_str());
            }
        }

        let mut body = String::from(r#""{" space "#);
        body.push_str(
            &req.iter()
                .map(|k| kv_rules[k].clone())
                .collect::<Vec<_>>()
                .join(r#" "," space "#),
        );
        if !opt.is_empty() {
            let alts: Vec<String> = (0..opt.len())
                .map(|i| self.optional_chain(name, &opt[i..], &kv_rules, false))
                .collect();
            if req.is_empty() {
                body.push_str(&format!("( {} )?", alts.join(" | ")));
            } else {
                body.push_str(&format!(r#" ( "," space ( {} ) )?"#, alts.join(" | ")));
            }
        }
        body.push_str(r#" "}" space"#);
        Ok(self.add_rule(name, body))
    }

    /// `k0 ("," k1)? ...`: any subset of `keys` in declaration order, starting
    /// with `keys[0]`.
    fn optional_chain(
        &mut self,
        name: &str,
        keys: &[&str],
        kv_rules: &HashMap<&str, String>,
        first_optional: bool,
    ) -> String {
        let Some((first, rest)) = keys.split_first() else {
            return String::new();
        };
        let kv = &kv_rules[first];
        let mut out = if first_optional {
            format!(r#"( "," space {kv} )?"#)
        } else {
            kv.clone()
        };
        if !rest.is_empty() {
            let tail = self.optional_chain(name, rest, kv_rules, true);
            let tail_rule = self.add_rule(&format!("{name}-{first}-rest"), tail);
            out.push(' ');
            out.push_str(&tail_rule);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::automaton::Matcher;
    use crate::grammar::parser::Grammar;
    use serde_json::json;
    use std::sync::Arc;

    fn accepts(schema: Value, text: &str) -> bool {
        let gbnf = schema_to_gbnf(&schema).unwrap();
        let grammar = Grammar::parse(&gbnf).unwrap_or_else(|e| panic!("{e}\n{gbnf}"));
        let mut m = Matcher::new(Arc::new(grammar));
        m.accept_str(text) && m.is_accepting()
    }

    #[test]
    fn object_with_optional_properties() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "string"},
                "c": {"type": "boolean"}
            },
            "required": ["a"]
        });
        assert!(accepts(schema.clone(), r#"{"a": 1}"#));
        assert!(accepts(schema.clone(), r#"{"a": -12, "c": true}"#));
        assert!(accepts(schema.clone(), r#"{"a":0,"b":"hi","c":false}"#));
        assert!(!accepts(schema.clone(), r#"{"b": "x"}"#));
        assert!(!accepts(schema, r#"{"a": 01}"#));
    }

    #[test]
    fn arrays_enums_and_refs() {
        let schema = json!({
            "type": "array",
            "items": {"$ref": "#/$defs/color"},
            "minItems": 1,
            "maxItems": 2,
            "$defs": {"color": {"enum": ["red", "green", null]}}
        });
        assert!(accepts(schema.clone(), r#"["red"]"#));
        assert!(accepts(schema.clone(), r#"["green", null]"#));
        assert!(!accepts(schema.clone(), "[]"));
        assert!(!accepts(schema.clone(), r#"["red","red","red"]"#));
        assert!(!accepts(schema, r#"["blue"]"#));
    }

    #[test]
    fn unions_and_free_values() {
        let schema = json!({"anyOf": [{"type": "null"}, {"type": "string", "maxLength": 3}]});
        assert!(accepts(schema.clone(), "null"));
        assert!(accepts(schema.clone(), r#""abc""#));
        assert!(!accepts(schema, r#""abcd""#));
        assert!(accepts(json!({}), r#"{"x": [1, 2.5e3, "y"]}"#));
    }

    #[test]
    fn refs_never_shadow_other_rules() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "string"},
                "b": {"$ref": "#/$defs/string"}
            },
            "required": ["a", "b"],
            "$defs": {"string": {"type": "integer"}}
        });
        assert!(accepts(schema.clone(), r#"{"a": "x", "b": 1}"#));
        assert!(!accepts(schema, r#"{"a": "x", "b": "y"}"#));

        let tuple = json!({
            "prefixItems": [
                {"$ref": "#/$defs/p/properties/name"},
                {"$ref": "#/$defs/q/properties/name"}
            ],
            "$defs": {
                "p": {"properties": {"name": {"type": "string"}}},
                "q": {"properties": {"name": {"type": "integer"}}}
            }
        });
        assert!(accepts(tuple.clone(), r#"["x", 1]"#));
        assert!(!accepts(tuple, r#"["x", "y"]"#));
    }

    #[test]
    fn huge_bounds_stay_compilable() {
        let text = json!({"type": "string", "maxLength": 1_000_000_000u64});
        assert!(accepts(text, r#""long enough""#));
        let list = json!({"type": "array", "items": {"type": "integer"}, "maxItems": 100_000});
        assert!(accepts(list, "[1, 2, 3]"));
        let err = schema_to_gbnf(&json!({"type": "string", "minLength": 5000})).unwrap_err();
        assert!(matches!(err, EmberError::GrammarCompileFailed(_)));
    }

    #[test]
    fn rejects_unknown_refs() {
        assert!(schema_to_gbnf(&json!({"$ref": "#/definitions/missing"})).is_err());
        assert!(schema_to_gbnf(&json!({"type": "date"})).is_err());
    }
}
