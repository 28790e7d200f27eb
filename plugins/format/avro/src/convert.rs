use std::collections::HashMap;

use apache_avro::Schema;
use apache_avro::schema::Name;
use apache_avro::types::Value;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bridge_api::BridgeError;

/// Именованные типы схемы: по ним разрешается `Schema::Ref`.
pub(crate) type Names = HashMap<Name, Schema>;

pub(crate) fn named_types(schema: &Schema) -> Names {
    let mut names = Names::new();
    collect_named(schema, &mut names);
    names
}

fn collect_named(schema: &Schema, names: &mut Names) {
    match schema {
        Schema::Record(record) => {
            names.insert(record.name.clone(), schema.clone());
            for field in &record.fields {
                collect_named(&field.schema, names);
            }
        }
        Schema::Enum(e) => {
            names.insert(e.name.clone(), schema.clone());
        }
        Schema::Fixed(f) => {
            names.insert(f.name.clone(), schema.clone());
        }
        Schema::Array(array) => collect_named(&array.items, names),
        Schema::Map(map) => collect_named(&map.types, names),
        Schema::Decimal(decimal) => collect_named(&decimal.inner, names),
        Schema::Union(union) => {
            for variant in union.variants() {
                collect_named(variant, names);
            }
        }
        _ => {}
    }
}

// ═══════════════════════════════════════════════════════════════
//  Avro → JSON conversion
// ═══════════════════════════════════════════════════════════════

pub(crate) fn avro_to_value(value: &Value) -> Result<serde_json::Value, BridgeError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::json!(i),
        Value::Long(l) => serde_json::json!(l),
        Value::Float(f) => serde_json::json!(f),
        Value::Double(d) => serde_json::json!(d),
        Value::Bytes(b) | Value::Fixed(_, b) => serde_json::Value::String(BASE64.encode(b)),
        Value::String(s) | Value::Enum(_, s) => serde_json::Value::String(s.clone()),
        Value::Union(_, inner) => avro_to_value(inner)?,
        Value::Array(items) => serde_json::Value::Array(
            items.iter().map(avro_to_value).collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| avro_to_value(v).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()?,
        ),
        Value::Record(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(k, v)| avro_to_value(v).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()?,
        ),
        Value::Date(d) => serde_json::json!(d),
        Value::TimeMillis(t) => serde_json::json!(t),
        Value::TimeMicros(t) => serde_json::json!(t),
        Value::TimestampMillis(t) => serde_json::json!(t),
        Value::TimestampMicros(t) => serde_json::json!(t),
        Value::TimestampNanos(t) => serde_json::json!(t),
        Value::Decimal(d) => {
            let bytes: Vec<u8> = d
                .try_into()
                .map_err(|e| BridgeError::malformed(format!("decimal: {e}")))?;
            serde_json::Value::String(BASE64.encode(bytes))
        }
        Value::BigDecimal(d) => serde_json::Value::String(d.to_string()),
        Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        Value::Duration(_) => serde_json::Value::Null,
        Value::LocalTimestampMillis(t) => serde_json::json!(t),
        Value::LocalTimestampMicros(t) => serde_json::json!(t),
        Value::LocalTimestampNanos(t) => serde_json::json!(t),
    })
}

// ═══════════════════════════════════════════════════════════════
//  JSON → Avro conversion
// ═══════════════════════════════════════════════════════════════

/// Строгая конвертация: любое несоответствие типу схемы —
/// `SchemaMismatch` с путём до поля (`$.items[2].price`).
pub(crate) fn value_to_avro(
    val: &serde_json::Value,
    schema: &Schema,
    names: &Names,
    path: &str,
) -> Result<Value, BridgeError> {
    use serde_json::Value as J;

    match (val, schema) {
        (J::Null, Schema::Null) => Ok(Value::Null),
        (J::Bool(b), Schema::Boolean) => Ok(Value::Boolean(*b)),
        (J::Number(n), Schema::Int) => n
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::Int)
            .ok_or_else(|| BridgeError::mismatch(path, format!("{n} does not fit 'int'"))),
        (J::Number(n), Schema::Long) => n
            .as_i64()
            .map(Value::Long)
            .ok_or_else(|| BridgeError::mismatch(path, format!("{n} is not a 'long'"))),
        (J::Number(n), Schema::Float) => n
            .as_f64()
            .map(|f| Value::Float(f as f32))
            .ok_or_else(|| BridgeError::mismatch(path, format!("{n} is not a 'float'"))),
        (J::Number(n), Schema::Double) => n
            .as_f64()
            .map(Value::Double)
            .ok_or_else(|| BridgeError::mismatch(path, format!("{n} is not a 'double'"))),
        (J::Number(n), Schema::Date) => n
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::Date)
            .ok_or_else(|| BridgeError::mismatch(path, format!("{n} is not a 'date'"))),
        (J::Number(n), Schema::TimeMillis) => n
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::TimeMillis)
            .ok_or_else(|| BridgeError::mismatch(path, format!("{n} is not a 'time-millis'"))),
        (J::Number(n), Schema::TimestampMillis) => n
            .as_i64()
            .map(Value::TimestampMillis)
            .ok_or_else(|| BridgeError::mismatch(path, format!("{n} is not a 'timestamp-millis'"))),
        (J::Number(n), Schema::TimestampMicros) => n
            .as_i64()
            .map(Value::TimestampMicros)
            .ok_or_else(|| BridgeError::mismatch(path, format!("{n} is not a 'timestamp-micros'"))),
        (J::String(s), Schema::String) => Ok(Value::String(s.clone())),
        (J::String(s), Schema::Bytes) => BASE64
            .decode(s)
            .map(Value::Bytes)
            .map_err(|e| BridgeError::mismatch(path, format!("bytes must be base64: {e}"))),
        (J::String(s), Schema::Fixed(fixed)) => {
            let bytes = BASE64
                .decode(s)
                .map_err(|e| BridgeError::mismatch(path, format!("fixed must be base64: {e}")))?;
            if bytes.len() != fixed.size {
                return Err(BridgeError::mismatch(
                    path,
                    format!("fixed '{}' expects {} bytes, got {}", fixed.name, fixed.size, bytes.len()),
                ));
            }
            Ok(Value::Fixed(fixed.size, bytes))
        }
        (J::String(s), Schema::Enum(enum_schema)) => enum_schema
            .symbols
            .iter()
            .position(|sym| sym == s)
            .map(|idx| Value::Enum(idx as u32, s.clone()))
            .ok_or_else(|| {
                BridgeError::mismatch(path, format!("'{s}' is not a symbol of enum '{}'", enum_schema.name))
            }),
        (J::Array(items), Schema::Array(inner)) => {
            let avro_items: Result<Vec<Value>, BridgeError> = items
                .iter()
                .enumerate()
                .map(|(i, item)| value_to_avro(item, &inner.items, names, &format!("{path}[{i}]")))
                .collect();
            Ok(Value::Array(avro_items?))
        }
        (J::Object(map), Schema::Map(inner)) => {
            let mut entries = HashMap::with_capacity(map.len());
            for (k, v) in map {
                entries.insert(k.clone(), value_to_avro(v, &inner.types, names, &format!("{path}.{k}"))?);
            }
            Ok(Value::Map(entries))
        }
        (J::Object(map), Schema::Record(record_schema)) => {
            let mut fields = Vec::with_capacity(record_schema.fields.len());
            for field in &record_schema.fields {
                let field_path = format!("{path}.{}", field.name);
                let avro_val = match (map.get(&field.name), &field.default) {
                    (Some(v), _) => value_to_avro(v, &field.schema, names, &field_path)?,
                    (None, Some(default)) => value_to_avro(default, &field.schema, names, &field_path)?,
                    (None, None) if is_nullable(&field.schema) => {
                        value_to_avro(&J::Null, &field.schema, names, &field_path)?
                    }
                    (None, None) => {
                        return Err(BridgeError::mismatch(field_path, "required field is missing"));
                    }
                };
                fields.push((field.name.clone(), avro_val));
            }
            Ok(Value::Record(fields))
        }
        (val, Schema::Union(union_schema)) => {
            for (idx, variant) in union_schema.variants().iter().enumerate() {
                if let Ok(v) = value_to_avro(val, variant, names, path) {
                    return Ok(Value::Union(idx as u32, Box::new(v)));
                }
            }
            Err(BridgeError::mismatch(path, format!("{val} matches no branch of the union")))
        }
        (val, Schema::Ref { name }) => match names.get(name) {
            Some(named) => value_to_avro(val, named, names, path),
            None => Err(BridgeError::mismatch(path, format!("unknown named type '{name}'"))),
        },
        (val, schema) => Err(BridgeError::mismatch(
            path,
            format!("{} cannot be encoded as {}", json_type(val), schema_name(schema)),
        )),
    }
}

/// `["null", T]` и подобные union'ы допускают отсутствие поля.
pub(crate) fn is_nullable(schema: &Schema) -> bool {
    match schema {
        Schema::Null => true,
        Schema::Union(u) => u.variants().iter().any(|v| matches!(v, Schema::Null)),
        _ => false,
    }
}

fn json_type(val: &serde_json::Value) -> &'static str {
    match val {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn schema_name(schema: &Schema) -> String {
    match schema {
        Schema::Record(r) => format!("record '{}'", r.name),
        Schema::Enum(e) => format!("enum '{}'", e.name),
        Schema::Fixed(f) => format!("fixed '{}'", f.name),
        Schema::Ref { name } => format!("reference '{name}'"),
        other => format!("'{:?}'", apache_avro::schema::SchemaKind::from(other)).to_lowercase(),
    }
}
