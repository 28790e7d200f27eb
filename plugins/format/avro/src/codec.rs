use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use apache_avro::Schema;
use futures::FutureExt;
use futures::future::Shared;

use bridge_api::{BoxFuture, BridgeError, ErrorKind, RetryPolicy, SchemaRef, SchemaRegistry};

use crate::convert::{Names, avro_to_value, is_nullable, named_types, value_to_avro};
use crate::wire;

// ═══════════════════════════════════════════════════════════════
//  SchemaHandle
// ═══════════════════════════════════════════════════════════════

/// Зарегистрированная схема: id в registry, адрес и разобранное определение.
#[derive(Clone, Debug)]
pub struct SchemaHandle {
    id: u32,
    reference: SchemaRef,
    schema: Arc<Schema>,
    names: Arc<Names>,
}

impl SchemaHandle {
    pub fn new(id: u32, reference: SchemaRef, schema: Schema) -> Self {
        let names = Arc::new(named_types(&schema));
        Self { id, reference, schema: Arc::new(schema), names }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn reference(&self) -> &SchemaRef {
        &self.reference
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

// ═══════════════════════════════════════════════════════════════
//  Schema cache
// ═══════════════════════════════════════════════════════════════

type Lookup = Shared<BoxFuture<'static, Result<SchemaHandle, BridgeError>>>;

enum Slot {
    Ready(SchemaHandle),
    /// Запрос в registry уже идёт — новые вызовы ждут его же.
    Pending(Lookup),
}

/// Параметры обращения к registry.
#[derive(Debug, Clone, Copy)]
pub struct LookupConfig {
    pub retry: RetryPolicy,
    /// Таймаут одной попытки.
    pub timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(3, Duration::from_millis(200)),
            timeout: Duration::from_secs(10),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  SchemaCodec
// ═══════════════════════════════════════════════════════════════

/// JSON ↔ Avro (Confluent wire format) со схемами из registry.
///
/// Кэш схем живёт всё время процесса и разделяется между pipeline'ами.
/// Промах кэша → ровно один логический lookup; параллельные вызовы
/// для той же схемы ждут один и тот же запрос.
pub struct SchemaCodec {
    registry: Arc<dyn SchemaRegistry>,
    lookup: LookupConfig,
    cache: Mutex<HashMap<SchemaRef, Slot>>,
}

impl SchemaCodec {
    pub fn new(registry: Arc<dyn SchemaRegistry>, lookup: LookupConfig) -> Self {
        Self {
            registry,
            lookup,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<SchemaRef, Slot>> {
        // Под lock'ом нет кода, способного оставить map в частичном состоянии.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Получить схему: из кэша или (один раз) из registry.
    pub async fn resolve(&self, reference: &SchemaRef) -> Result<SchemaHandle, BridgeError> {
        let lookup = {
            let mut cache = self.cache();
            match cache.get(reference) {
                Some(Slot::Ready(handle)) => return Ok(handle.clone()),
                Some(Slot::Pending(lookup)) => lookup.clone(),
                None => {
                    let lookup = self.start_lookup(reference.clone());
                    cache.insert(reference.clone(), Slot::Pending(lookup.clone()));
                    lookup
                }
            }
        };

        let result = lookup.clone().await;

        let mut cache = self.cache();
        match &result {
            Ok(handle) => {
                cache.insert(reference.clone(), Slot::Ready(handle.clone()));
                cache
                    .entry(SchemaRef::Id(handle.id))
                    .or_insert_with(|| Slot::Ready(handle.clone()));
            }
            Err(_) => {
                // Неудача не кэшируется; удаляем только свой pending.
                let ours = matches!(
                    cache.get(reference),
                    Some(Slot::Pending(current)) if Shared::ptr_eq(current, &lookup)
                );
                if ours {
                    cache.remove(reference);
                }
            }
        }
        result
    }

    fn start_lookup(&self, reference: SchemaRef) -> Lookup {
        let registry = self.registry.clone();
        let config = self.lookup;
        let fut: BoxFuture<'static, Result<SchemaHandle, BridgeError>> = Box::pin(async move {
            let mut attempts = 0;
            loop {
                let outcome = match tokio::time::timeout(config.timeout, registry.fetch(&reference)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(BridgeError::SchemaUnavailable(format!(
                        "{reference}: lookup timed out after {:?}",
                        config.timeout
                    ))),
                };
                attempts += 1;
                match outcome {
                    Ok(registered) => {
                        let schema = Schema::parse_str(&registered.definition).map_err(|e| {
                            BridgeError::SchemaUnavailable(format!("{reference}: invalid definition: {e}"))
                        })?;
                        tracing::info!(schema = %reference, id = registered.id, "schema resolved");
                        return Ok(SchemaHandle::new(registered.id, reference, schema));
                    }
                    Err(e) if e.kind() == ErrorKind::Retriable && config.retry.allows(attempts) => {
                        let delay = config.retry.backoff(attempts - 1);
                        tracing::warn!(schema = %reference, attempt = attempts, ?delay, error = %e, "schema lookup failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        tracing::error!(schema = %reference, attempts, error = %e, "schema lookup failed");
                        // неизвестный id из заголовка — ошибка записи, неизвестный subject — нет
                        return Err(match (e, &reference) {
                            (e @ BridgeError::SchemaUnavailable(_), _) => e,
                            (e @ BridgeError::SchemaNotFound(_), SchemaRef::Id(_)) => e,
                            (other, _) => BridgeError::SchemaUnavailable(format!("{reference}: {other}")),
                        });
                    }
                }
            }
        });
        fut.shared()
    }

    /// Разобрать JSON и проверить логическую форму под record-схему:
    /// объект верхнего уровня и все обязательные поля на месте.
    pub fn decode_json(&self, bytes: &[u8], handle: &SchemaHandle) -> Result<serde_json::Value, BridgeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if let Schema::Record(record) = handle.schema() {
            let object = value.as_object().ok_or_else(|| {
                BridgeError::malformed(format!("expected a JSON object for record '{}'", record.name))
            })?;
            if let Some(missing) = record.fields.iter().find(|f| {
                f.default.is_none() && !is_nullable(&f.schema) && !object.contains_key(&f.name)
            }) {
                return Err(BridgeError::malformed(format!("missing required field '{}'", missing.name)));
            }
        }
        Ok(value)
    }

    /// JSON value → framed Avro bytes.
    pub fn encode_avro(&self, value: &serde_json::Value, handle: &SchemaHandle) -> Result<Vec<u8>, BridgeError> {
        let avro_value = value_to_avro(value, handle.schema(), &handle.names, "$")?;
        let datum = apache_avro::to_avro_datum(handle.schema(), avro_value)
            .map_err(|e| BridgeError::mismatch("$", format!("avro encode: {e}")))?;
        Ok(wire::frame(handle.id, &datum))
    }

    /// Framed Avro bytes → JSON value, схема задана явно.
    pub fn decode_avro(&self, bytes: &[u8], handle: &SchemaHandle) -> Result<serde_json::Value, BridgeError> {
        let (id, datum) = wire::split(bytes)?;
        if id != handle.id {
            return Err(BridgeError::malformed(format!(
                "frame carries schema id {id}, expected {}",
                handle.id
            )));
        }
        let mut reader = datum;
        let avro_value = apache_avro::from_avro_datum(handle.schema(), &mut reader, None)
            .map_err(|e| BridgeError::malformed(format!("avro decode: {e}")))?;
        if !reader.is_empty() {
            return Err(BridgeError::malformed(format!("{} trailing bytes after avro datum", reader.len())));
        }
        // обрезанный datum может разобраться в значение не по схеме
        if !avro_value.validate(handle.schema()) {
            return Err(BridgeError::malformed("avro datum does not conform to its schema"));
        }
        avro_to_value(&avro_value)
    }

    /// Framed Avro bytes → JSON value, схема по id из заголовка.
    /// Id, которого нет в registry, — `SchemaNotFound` (ошибка записи).
    pub async fn decode_framed(&self, bytes: &[u8]) -> Result<serde_json::Value, BridgeError> {
        let (id, _) = wire::split(bytes)?;
        let handle = self.resolve(&SchemaRef::Id(id)).await?;
        self.decode_avro(bytes, &handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use bridge_api::{RegisteredSchema, SchemaVersion};
    use serde_json::json;

    use super::*;

    const MESSAGE_SCHEMA: &str = r#"{"type":"record","name":"AvroMessage","namespace":"org.acme.avro",
        "fields":[{"name":"id","type":"string"},{"name":"msg","type":"string"}]}"#;

    /// Registry, падающий первые `failures` раз.
    struct FlakyRegistry {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyRegistry {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self { calls: AtomicU32::new(0), failures })
        }
    }

    impl SchemaRegistry for FlakyRegistry {
        fn fetch(&self, _reference: &SchemaRef) -> BoxFuture<'_, Result<RegisteredSchema, BridgeError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                if call < self.failures {
                    return Err(BridgeError::SchemaUnavailable("registry 503".into()));
                }
                Ok(RegisteredSchema {
                    id: 42,
                    subject: Some("avro-topic-value".into()),
                    version: Some(1),
                    definition: MESSAGE_SCHEMA.into(),
                })
            })
        }
    }

    fn subject() -> SchemaRef {
        SchemaRef::subject("avro-topic-value", SchemaVersion::Latest)
    }

    fn codec(registry: Arc<FlakyRegistry>, attempts: u32) -> SchemaCodec {
        SchemaCodec::new(
            registry,
            LookupConfig {
                retry: RetryPolicy::new(attempts, Duration::from_millis(10)),
                timeout: Duration::from_secs(1),
            },
        )
    }

    fn handle() -> SchemaHandle {
        SchemaHandle::new(42, subject(), Schema::parse_str(MESSAGE_SCHEMA).unwrap())
    }

    #[test]
    fn json_avro_json_roundtrip() {
        let codec = codec(FlakyRegistry::new(0), 1);
        let handle = handle();
        let value = codec.decode_json(br#"{"id":"1","msg":"hello"}"#, &handle).unwrap();
        let bytes = codec.encode_avro(&value, &handle).unwrap();
        let mut expected = vec![0u8, 0, 0, 0, 42, 2, b'1', 10];
        expected.extend_from_slice(b"hello");
        assert_eq!(bytes, expected);
        assert_eq!(codec.decode_avro(&bytes, &handle).unwrap(), json!({"id": "1", "msg": "hello"}));
    }

    #[test]
    fn malformed_json_and_missing_fields() {
        let codec = codec(FlakyRegistry::new(0), 1);
        let handle = handle();
        let inputs: [&[u8]; 3] = [br#"{"id":}"#, br#"["id"]"#, br#"{"id":"1"}"#];
        for input in inputs {
            let err = codec.decode_json(input, &handle).unwrap_err();
            assert!(matches!(err, BridgeError::MalformedInput(_)), "{err}");
        }
    }

    #[test]
    fn wrong_field_type_is_schema_mismatch() {
        let codec = codec(FlakyRegistry::new(0), 1);
        let handle = handle();
        let value = codec.decode_json(br#"{"id":1,"msg":"hello"}"#, &handle).unwrap();
        let err = codec.encode_avro(&value, &handle).unwrap_err();
        assert!(matches!(err, BridgeError::SchemaMismatch { ref path, .. } if path == "$.id"));
    }

    #[test]
    fn truncated_and_foreign_frames_are_malformed() {
        let codec = codec(FlakyRegistry::new(0), 1);
        let handle = handle();
        let bytes = codec.encode_avro(&json!({"id": "1", "msg": "hello"}), &handle).unwrap();

        for cut in 1..=3 {
            let truncated = &bytes[..bytes.len() - cut];
            let result = codec.decode_avro(truncated, &handle);
            assert!(matches!(result, Err(BridgeError::MalformedInput(_))), "cut {cut}: {result:?}");
        }

        let mut foreign = bytes.clone();
        foreign[4] = 7;
        assert!(matches!(codec.decode_avro(&foreign, &handle), Err(BridgeError::MalformedInput(_))));

        let mut trailing = bytes;
        trailing.push(0);
        assert!(matches!(codec.decode_avro(&trailing, &handle), Err(BridgeError::MalformedInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolves_share_one_lookup() {
        let registry = FlakyRegistry::new(2);
        let codec = codec(registry.clone(), 3);
        let reference = subject();

        let results = futures::future::join_all((0..8).map(|_| codec.resolve(&reference))).await;

        assert!(results.iter().all(|r| r.as_ref().map(|h| h.id()) == Ok(42)));
        // two failures + one success, shared by all eight callers
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);

        // cached by subject and by id
        codec.resolve(&reference).await.unwrap();
        codec.resolve(&SchemaRef::Id(42)).await.unwrap();
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_lookup_is_not_cached() {
        let registry = FlakyRegistry::new(2);
        let codec = codec(registry.clone(), 2);
        let reference = subject();

        let results = futures::future::join_all((0..4).map(|_| codec.resolve(&reference))).await;
        assert!(results.iter().all(|r| matches!(r, Err(BridgeError::SchemaUnavailable(_)))));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 2);

        // next call starts a fresh lookup, which now succeeds
        assert_eq!(codec.resolve(&reference).await.unwrap().id(), 42);
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    /// Знает только схему с id 42.
    struct OneSchemaRegistry;

    impl SchemaRegistry for OneSchemaRegistry {
        fn fetch(&self, reference: &SchemaRef) -> BoxFuture<'_, Result<RegisteredSchema, BridgeError>> {
            let result = match reference {
                SchemaRef::Id(42) => Ok(RegisteredSchema {
                    id: 42,
                    subject: None,
                    version: None,
                    definition: MESSAGE_SCHEMA.into(),
                }),
                other => Err(BridgeError::SchemaNotFound(format!("{other}: not registered"))),
            };
            Box::pin(async move { result })
        }
    }

    #[tokio::test]
    async fn unknown_header_id_is_a_record_error() {
        let codec = SchemaCodec::new(Arc::new(OneSchemaRegistry), LookupConfig::default());
        let mut bytes = codec.encode_avro(&json!({"id": "7", "msg": "x"}), &handle()).unwrap();
        bytes[4] = 99;
        let err = codec.decode_framed(&bytes).await.unwrap_err();
        assert!(matches!(err, BridgeError::SchemaNotFound(_)), "{err}");
        assert_eq!(err.kind(), ErrorKind::Record);

        // неизвестный subject остаётся проблемой окружения
        let err = codec.resolve(&subject()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Retriable);
    }

    #[test]
    fn named_type_references_roundtrip() {
        let codec = codec(FlakyRegistry::new(0), 1);
        let schema = Schema::parse_str(
            r#"{"type":"record","name":"Move","namespace":"org.acme.avro","fields":[
                {"name":"from","type":{"type":"record","name":"Point","fields":[{"name":"x","type":"int"}]}},
                {"name":"to","type":"Point"}
            ]}"#,
        )
        .unwrap();
        let handle = SchemaHandle::new(5, SchemaRef::Id(5), schema);
        let value = json!({"from": {"x": 1}, "to": {"x": 2}});
        let bytes = codec.encode_avro(&value, &handle).unwrap();
        assert_eq!(codec.decode_avro(&bytes, &handle).unwrap(), value);
    }

    #[tokio::test]
    async fn decode_framed_resolves_by_header_id() {
        let registry = FlakyRegistry::new(0);
        let codec = codec(registry.clone(), 1);
        let bytes = codec.encode_avro(&json!({"id": "7", "msg": "x"}), &handle()).unwrap();
        assert_eq!(codec.decode_framed(&bytes).await.unwrap(), json!({"id": "7", "msg": "x"}));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
    }
}
