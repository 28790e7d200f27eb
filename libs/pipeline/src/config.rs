use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use bridge_api::{BridgeError, RetryPolicy, SchemaRef, SchemaVersion};
use codec_avro::LookupConfig;

use crate::credentials::Credentials;

pub const SECURITY_PROTOCOL: &str = "SASL_SSL";
pub const SASL_MECHANISM: &str = "PLAIN";
pub const AUTO_OFFSET_RESET: &str = "earliest";

// ═══════════════════════════════════════════════════════════════
//  Raw Config
// ═══════════════════════════════════════════════════════════════

/// Конфигурация до валидации: обязательные строки могут отсутствовать.
///
/// Ключи принимаются и в snake_case, и в исходном camelCase.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default, alias = "bootstrapServers")]
    pub bootstrap_servers: Option<String>,
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default, alias = "apiSecret")]
    pub api_secret: Option<String>,
    #[serde(default, alias = "sourceTopic")]
    pub source_topic: Option<String>,
    #[serde(default, alias = "destinationTopic")]
    pub destination_topic: Option<String>,
    #[serde(default, alias = "sourceGroupId")]
    pub source_group_id: Option<String>,
    #[serde(default, alias = "schemaRegistryUrl")]
    pub schema_registry_url: Option<String>,
    #[serde(default, alias = "schemaRegistryApiKey")]
    pub schema_registry_api_key: Option<String>,
    #[serde(default, alias = "schemaRegistryApiSecret")]
    pub schema_registry_api_secret: Option<String>,

    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
}

/// Непустое значение после trim, иначе имя опции в списке недостающих.
fn required(value: Option<String>, name: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => v,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

impl RawConfig {
    /// Проверить обязательные опции и собрать неизменяемый `BridgeConfig`.
    pub fn validate(self) -> Result<BridgeConfig, BridgeError> {
        let mut missing = Vec::new();
        let bootstrap_servers = required(self.bootstrap_servers, "bootstrapServers", &mut missing);
        let api_key = required(self.api_key, "apiKey", &mut missing);
        let api_secret = required(self.api_secret, "apiSecret", &mut missing);
        let source_topic = required(self.source_topic, "sourceTopic", &mut missing);
        let destination_topic = required(self.destination_topic, "destinationTopic", &mut missing);
        let source_group_id = required(self.source_group_id, "sourceGroupId", &mut missing);
        let schema_registry_url = required(self.schema_registry_url, "schemaRegistryUrl", &mut missing);
        let registry_key = required(self.schema_registry_api_key, "schemaRegistryApiKey", &mut missing);
        let registry_secret =
            required(self.schema_registry_api_secret, "schemaRegistryApiSecret", &mut missing);

        if !missing.is_empty() {
            return Err(BridgeError::config(format!(
                "missing required option(s): {}",
                missing.join(", ")
            )));
        }
        if source_topic == destination_topic {
            return Err(BridgeError::config(format!(
                "sourceTopic and destinationTopic must differ, both are '{source_topic}'"
            )));
        }

        let broker_credentials = Credentials::new(api_key, api_secret)?;
        let registry_credentials = Credentials::new(registry_key, registry_secret)?;
        let schema_version =
            self.schema.version.parse::<SchemaVersion>().map_err(BridgeError::config)?;

        if self.consumer.max_batch == 0 || self.observer.max_batch == 0 {
            return Err(BridgeError::config("max_batch must be positive"));
        }
        if self.producer.max_in_flight == 0 {
            return Err(BridgeError::config("producer.max_in_flight must be positive"));
        }

        Ok(BridgeConfig {
            bootstrap_servers,
            broker_credentials,
            source_topic,
            destination_topic,
            source_group_id,
            schema_registry_url,
            registry_credentials,
            schema_version,
            consumer: self.consumer,
            producer: self.producer,
            pipeline: self.pipeline,
            schema: self.schema,
            observer: self.observer,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tuning sections
// ═══════════════════════════════════════════════════════════════

/// `[consumer]`
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Максимум записей за один poll.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Сколько poll ждёт данных, прежде чем вернуть пустой batch.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Ретраи fetch/commit при недоступности брокера.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            poll_timeout_ms: default_poll_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn default_max_batch() -> usize {
    500
}
fn default_poll_timeout_ms() -> u64 {
    1_000
}

/// `[producer]`
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    /// Глобальный лимит одновременных send'ов.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Ретраи `TransientSend`; `max_attempts` — потолок попыток.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_max_in_flight() -> usize {
    64
}

/// `[pipeline]`
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Сколько раз обрабатывать batch заново до остановки pipeline.
    #[serde(default = "default_batch_attempts")]
    pub batch_attempts: u32,
    /// Подряд неудачных poll'ов до эскалации.
    #[serde(default = "default_max_consecutive_pauses")]
    pub max_consecutive_pauses: u32,
    #[serde(default = "default_pause_initial_ms")]
    pub pause_initial_ms: u64,
    #[serde(default = "default_pause_max_ms")]
    pub pause_max_ms: u64,
    /// Сколько ждать in-flight send'ы после отмены.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Topic для poison-сообщений, по умолчанию `<sourceTopic>.dlq`.
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_attempts: default_batch_attempts(),
            max_consecutive_pauses: default_max_consecutive_pauses(),
            pause_initial_ms: default_pause_initial_ms(),
            pause_max_ms: default_pause_max_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            dead_letter_topic: None,
        }
    }
}

impl PipelineConfig {
    /// Backoff между повторами batch'а и паузами после неудачного poll.
    pub fn pause_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.batch_attempts,
            initial_delay_ms: self.pause_initial_ms,
            max_delay_ms: self.pause_max_ms,
            multiplier: 2.0,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_batch_attempts() -> u32 {
    5
}
fn default_max_consecutive_pauses() -> u32 {
    10
}
fn default_pause_initial_ms() -> u64 {
    500
}
fn default_pause_max_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// `[schema]`
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    /// Subject схемы назначения, по умолчанию `<destinationTopic>-value`.
    #[serde(default)]
    pub subject: Option<String>,
    /// `latest` или номер версии.
    #[serde(default = "default_schema_version")]
    pub version: String,
    #[serde(default = "default_lookup_attempts")]
    pub lookup_attempts: u32,
    #[serde(default = "default_lookup_initial_ms")]
    pub lookup_initial_ms: u64,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            subject: None,
            version: default_schema_version(),
            lookup_attempts: default_lookup_attempts(),
            lookup_initial_ms: default_lookup_initial_ms(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl SchemaConfig {
    pub fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            retry: RetryPolicy::new(self.lookup_attempts, Duration::from_millis(self.lookup_initial_ms)),
            timeout: Duration::from_millis(self.lookup_timeout_ms),
        }
    }
}

fn default_schema_version() -> String {
    "latest".into()
}
fn default_lookup_attempts() -> u32 {
    3
}
fn default_lookup_initial_ms() -> u64 {
    200
}
fn default_lookup_timeout_ms() -> u64 {
    10_000
}

/// `[observer]`
#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    #[serde(default = "default_observer_enabled")]
    pub enabled: bool,
    /// Группа ObserverSink'а, по умолчанию `<sourceGroupId>.observer`.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: default_observer_enabled(),
            group_id: None,
            max_batch: default_max_batch(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

fn default_observer_enabled() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════
//  Validated Config
// ═══════════════════════════════════════════════════════════════

/// Проверенная конфигурация моста. Строится один раз при старте.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bootstrap_servers: String,
    pub broker_credentials: Credentials,
    pub source_topic: String,
    pub destination_topic: String,
    pub source_group_id: String,
    pub schema_registry_url: String,
    pub registry_credentials: Credentials,
    pub schema_version: SchemaVersion,
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
    pub pipeline: PipelineConfig,
    pub schema: SchemaConfig,
    pub observer: ObserverConfig,
}

impl BridgeConfig {
    /// Схема назначения (TopicNameStrategy).
    pub fn destination_schema(&self) -> SchemaRef {
        let subject = self
            .schema
            .subject
            .clone()
            .unwrap_or_else(|| format!("{}-value", self.destination_topic));
        SchemaRef::subject(subject, self.schema_version)
    }

    pub fn dead_letter_topic(&self) -> String {
        self.pipeline
            .dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("{}.dlq", self.source_topic))
    }

    pub fn observer_group(&self) -> String {
        self.observer
            .group_id
            .clone()
            .unwrap_or_else(|| format!("{}.observer", self.source_group_id))
    }

    /// Consumer для ObserverSink'а: настройки `[observer]`, ретраи `[consumer]`.
    pub fn observer_consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_batch: self.observer.max_batch,
            poll_timeout_ms: self.observer.poll_timeout_ms,
            retry: self.consumer.retry,
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            bootstrap_servers: self.bootstrap_servers.clone(),
            security_protocol: SECURITY_PROTOCOL,
            sasl_mechanism: SASL_MECHANISM,
            credentials: self.broker_credentials.clone(),
        }
    }

    /// Свойства клиента schema registry.
    pub fn registry_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("schema.registry.url".to_string(), self.schema_registry_url.clone()),
            ("basic.auth.credentials.source".to_string(), "USER_INFO".to_string()),
            ("basic.auth.user.info".to_string(), self.registry_credentials.user_info()),
        ])
    }
}

// ═══════════════════════════════════════════════════════════════
//  Broker Settings
// ═══════════════════════════════════════════════════════════════

/// Транспортные настройки брокер-клиента (pass-through).
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub bootstrap_servers: String,
    pub security_protocol: &'static str,
    pub sasl_mechanism: &'static str,
    pub credentials: Credentials,
}

impl BrokerSettings {
    /// Kafka client properties. С `group` — свойства consumer'а.
    pub fn client_properties(&self, group: Option<&str>) -> BTreeMap<String, String> {
        let mut props = BTreeMap::from([
            ("bootstrap.servers".to_string(), self.bootstrap_servers.clone()),
            ("security.protocol".to_string(), self.security_protocol.to_string()),
            ("sasl.mechanism".to_string(), self.sasl_mechanism.to_string()),
            ("sasl.jaas.config".to_string(), self.credentials.auth_string().to_string()),
        ]);
        if let Some(group) = group {
            props.insert("group.id".to_string(), group.to_string());
            props.insert("auto.offset.reset".to_string(), AUTO_OFFSET_RESET.to_string());
        }
        props
    }
}
