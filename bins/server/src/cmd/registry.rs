use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bridge_api::SchemaRegistry;
use codec_avro::{HttpSchemaRegistry, StaticSchemaRegistry};
use pipeline::BridgeConfig;

use crate::error::ServerError;

const FILE_SCHEME: &str = "file://";
const REGISTRY_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry по URL: `file://` — схемы из `.avsc`, иначе HTTP.
pub fn build(config: &BridgeConfig) -> Result<Arc<dyn SchemaRegistry>, ServerError> {
    let url = config.schema_registry_url.as_str();
    if let Some(path) = url.strip_prefix(FILE_SCHEME) {
        let subject = match config.destination_schema() {
            bridge_api::SchemaRef::Subject { name, .. } => name,
            bridge_api::SchemaRef::Id(id) => id.to_string(),
        };
        return Ok(Arc::new(from_path(Path::new(path), &subject)?));
    }

    let credentials = &config.registry_credentials;
    Ok(Arc::new(HttpSchemaRegistry::new(
        url,
        Some((credentials.key().to_string(), credentials.secret().to_string())),
        REGISTRY_HTTP_TIMEOUT,
    )?))
}

/// Файл регистрируется под `subject`; в каталоге каждый `<subject>.avsc`
/// под своим именем.
fn from_path(path: &Path, subject: &str) -> Result<StaticSchemaRegistry, ServerError> {
    let mut registry = StaticSchemaRegistry::new();
    if path.is_dir() {
        let mut files: Vec<_> = std::fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "avsc"))
            .collect();
        files.sort();
        for file in files {
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = registry.register_file(stem, &file)?;
            tracing::info!(subject = %stem, id, file = %file.display(), "registered schema");
        }
    } else {
        let id = registry.register_file(subject, path)?;
        tracing::info!(subject = %subject, id, file = %path.display(), "registered schema");
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_registers_each_avsc_by_stem() {
        let dir = std::env::temp_dir().join(format!("topic-bridge-schemas-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("avro-topic-value.avsc"),
            r#"{"type":"record","name":"M","fields":[{"name":"id","type":"string"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let registry = from_path(&dir, "unused").unwrap();
        let found = registry
            .fetch(&bridge_api::SchemaRef::subject("avro-topic-value", bridge_api::SchemaVersion::Latest))
            .await
            .unwrap();
        assert_eq!(found.id, 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
