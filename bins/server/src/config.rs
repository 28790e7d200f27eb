use clap::{Args, Parser, Subcommand};

use pipeline::{BridgeConfig, RawConfig};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "topic-bridge", about = "Мост JSON → Avro между topic'ами")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить мост и observer (локальный брокер, JSON строки из stdin)
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "config.toml", env = "BRIDGE_CONFIG")]
    pub config: String,

    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS")]
    pub bootstrap_servers: Option<String>,

    #[arg(long, env = "CONFLUENT_CLOUD_API_KEY")]
    pub api_key: Option<String>,

    #[arg(long, env = "CONFLUENT_CLOUD_API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,

    /// Topic с JSON строками
    #[arg(long, env = "KAFKA_TOPIC_STRING")]
    pub source_topic: Option<String>,

    /// Topic для Avro
    #[arg(long, env = "KAFKA_TOPIC_AVRO")]
    pub destination_topic: Option<String>,

    #[arg(long, env = "KAFKA_TOPIC_STRING_GROUP_ID")]
    pub source_group_id: Option<String>,

    /// `https://...` или `file://<.avsc файл | каталог>`
    #[arg(long, env = "SCHEMA_REGISTRY_URL")]
    pub schema_registry_url: Option<String>,

    #[arg(long, env = "CONFLUENT_CLOUD_SCHEMA_REGISTRY_API_KEY")]
    pub schema_registry_api_key: Option<String>,

    #[arg(long, env = "CONFLUENT_CLOUD_SCHEMA_REGISTRY_API_SECRET", hide_env_values = true)]
    pub schema_registry_api_secret: Option<String>,

    /// Партиций у topic'ов локального брокера
    #[arg(long, default_value_t = 3)]
    pub partitions: i32,
}

// ═══════════════════════════════════════════════════════════════
//  Effective — merged config
// ═══════════════════════════════════════════════════════════════

pub fn load_raw(path: &str) -> Result<RawConfig, ServerError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ServerError::Config { context: "read", detail: format!("'{path}': {e}") })?;
    toml::from_str(&content)
        .map_err(|e| ServerError::Config { context: "parse", detail: format!("'{path}': {e}") })
}

/// Итоговая конфигурация: config.toml < env/CLI. Отсутствующий файл
/// допустим, если всё задано через env/CLI.
pub fn effective(args: &ServeArgs) -> Result<BridgeConfig, ServerError> {
    let mut raw = if std::path::Path::new(&args.config).exists() {
        load_raw(&args.config)?
    } else {
        tracing::info!(config = %args.config, "config file not found, using env/CLI only");
        RawConfig::default()
    };
    merge(&mut raw, args);
    Ok(raw.validate()?)
}

fn merge(raw: &mut RawConfig, args: &ServeArgs) {
    fn set(slot: &mut Option<String>, value: &Option<String>) {
        if value.is_some() {
            slot.clone_from(value);
        }
    }
    set(&mut raw.bootstrap_servers, &args.bootstrap_servers);
    set(&mut raw.api_key, &args.api_key);
    set(&mut raw.api_secret, &args.api_secret);
    set(&mut raw.source_topic, &args.source_topic);
    set(&mut raw.destination_topic, &args.destination_topic);
    set(&mut raw.source_group_id, &args.source_group_id);
    set(&mut raw.schema_registry_url, &args.schema_registry_url);
    set(&mut raw.schema_registry_api_key, &args.schema_registry_api_key);
    set(&mut raw.schema_registry_api_secret, &args.schema_registry_api_secret);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(config: &str) -> ServeArgs {
        Cli::parse_from(["topic-bridge", "serve", "--config", config])
            .command
            .into_serve()
    }

    impl Commands {
        fn into_serve(self) -> ServeArgs {
            match self {
                Commands::Serve(args) => args,
            }
        }
    }

    #[test]
    fn cli_overrides_file_values() {
        let mut raw: RawConfig = toml::from_str(
            r#"
            bootstrapServers = "file-broker:9092"
            apiKey = "FILEKEY"
            "#,
        )
        .unwrap();
        let mut overrides = args("missing.toml");
        overrides.bootstrap_servers = Some("cli-broker:9092".into());
        merge(&mut raw, &overrides);

        assert_eq!(raw.bootstrap_servers.as_deref(), Some("cli-broker:9092"));
        assert_eq!(raw.api_key.as_deref(), Some("FILEKEY"));
    }

    #[test]
    fn bundled_config_validates() {
        let raw: RawConfig = toml::from_str(include_str!("../config.toml")).unwrap();
        let config = raw.validate().unwrap();
        assert_eq!(config.source_topic, "string-topic");
        assert_eq!(config.dead_letter_topic(), "string-topic.dlq");
        assert_eq!(config.producer.retry.max_attempts, 5);
        assert!(config.schema_registry_url.starts_with("file://"));
    }

    #[test]
    fn missing_file_and_options_fail_validation() {
        let mut bare = args("/nonexistent/topic-bridge.toml");
        // env в окружении теста не должен влиять
        bare.bootstrap_servers = None;
        bare.api_key = None;
        let err = effective(&bare).unwrap_err();
        assert!(err.to_string().contains("bootstrapServers"), "{err}");
    }
}
