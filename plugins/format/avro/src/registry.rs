use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use bridge_api::{BoxFuture, BridgeError, RegisteredSchema, SchemaRef, SchemaRegistry, SchemaVersion};

// ═══════════════════════════════════════════════════════════════
//  HttpSchemaRegistry
// ═══════════════════════════════════════════════════════════════

const REGISTRY_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Клиент Confluent-совместимого registry (только чтение).
///
/// `GET /schemas/ids/{id}` и `GET /subjects/{subject}/versions/{version}`.
/// 404 → `SchemaNotFound`, прочие сбои → `SchemaUnavailable`.
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: reqwest::Url,
    /// `basic.auth.user.info` — (user, password).
    user_info: Option<(String, String)>,
}

#[derive(Deserialize)]
struct SchemaResponse {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    version: Option<u32>,
    schema: String,
}

impl HttpSchemaRegistry {
    pub fn new(
        base_url: &str,
        user_info: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| BridgeError::config(format!("schema registry url '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BridgeError::config(format!("schema registry url '{base_url}' cannot be a base")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::config(format!("schema registry client: {e}")))?;
        Ok(Self { client, base_url, user_info })
    }

    fn endpoint(&self, reference: &SchemaRef) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            match reference {
                SchemaRef::Id(id) => {
                    let id = id.to_string();
                    segments.extend(["schemas", "ids", id.as_str()]);
                }
                SchemaRef::Subject { name, version } => {
                    let version = version.to_string();
                    segments.extend(["subjects", name.as_str(), "versions", version.as_str()]);
                }
            }
        }
        url
    }

    async fn get(&self, reference: &SchemaRef) -> Result<RegisteredSchema, BridgeError> {
        let url = self.endpoint(reference);
        let unavailable = |detail: String| BridgeError::SchemaUnavailable(format!("{reference}: {detail}"));

        let mut request = self.client.get(url.clone()).header(reqwest::header::ACCEPT, REGISTRY_CONTENT_TYPE);
        if let Some((user, password)) = &self.user_info {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await.map_err(|e| unavailable(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::SchemaNotFound(format!("{reference}: GET {url}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(unavailable(format!("GET {url}: HTTP {status}")));
        }
        let body: SchemaResponse = response.json().await.map_err(|e| unavailable(e.to_string()))?;

        let id = match (body.id, reference) {
            (Some(id), _) => id,
            (None, SchemaRef::Id(id)) => *id,
            (None, SchemaRef::Subject { .. }) => return Err(unavailable("response carries no schema id".into())),
        };
        Ok(RegisteredSchema {
            id,
            subject: body.subject,
            version: body.version,
            definition: body.schema,
        })
    }
}

impl SchemaRegistry for HttpSchemaRegistry {
    fn fetch(&self, reference: &SchemaRef) -> BoxFuture<'_, Result<RegisteredSchema, BridgeError>> {
        let reference = reference.clone();
        Box::pin(async move { self.get(&reference).await })
    }
}

// ═══════════════════════════════════════════════════════════════
//  StaticSchemaRegistry
// ═══════════════════════════════════════════════════════════════

/// Registry из заранее известных схем (`.avsc` файлы, тесты).
/// Id выдаются по порядку регистрации, версии — по subject'у.
#[derive(Default)]
pub struct StaticSchemaRegistry {
    schemas: Vec<RegisteredSchema>,
    versions: BTreeMap<String, Vec<usize>>,
}

impl StaticSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Зарегистрировать определение под subject'ом; возвращает id.
    pub fn register(&mut self, subject: &str, definition: impl Into<String>) -> Result<u32, BridgeError> {
        let definition = definition.into();
        apache_avro::Schema::parse_str(&definition)
            .map_err(|e| BridgeError::config(format!("schema for subject '{subject}': {e}")))?;

        let id = self.schemas.len() as u32 + 1;
        let versions = self.versions.entry(subject.to_string()).or_default();
        versions.push(self.schemas.len());
        self.schemas.push(RegisteredSchema {
            id,
            subject: Some(subject.to_string()),
            version: Some(versions.len() as u32),
            definition,
        });
        Ok(id)
    }

    /// Прочитать `.avsc` файл и зарегистрировать его под subject'ом.
    pub fn register_file(&mut self, subject: &str, path: impl AsRef<Path>) -> Result<u32, BridgeError> {
        let path = path.as_ref();
        let definition = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("failed to read schema file '{}': {e}", path.display()))
        })?;
        self.register(subject, definition)
    }

    fn lookup(&self, reference: &SchemaRef) -> Option<&RegisteredSchema> {
        match reference {
            SchemaRef::Id(id) => self.schemas.iter().find(|s| s.id == *id),
            SchemaRef::Subject { name, version } => {
                let versions = self.versions.get(name)?;
                let idx = match version {
                    SchemaVersion::Latest => versions.last()?,
                    SchemaVersion::Number(n) => versions.get((*n as usize).checked_sub(1)?)?,
                };
                self.schemas.get(*idx)
            }
        }
    }
}

impl SchemaRegistry for StaticSchemaRegistry {
    fn fetch(&self, reference: &SchemaRef) -> BoxFuture<'_, Result<RegisteredSchema, BridgeError>> {
        let result = self
            .lookup(reference)
            .cloned()
            .ok_or_else(|| BridgeError::SchemaNotFound(format!("{reference}: not registered")));
        Box::pin(async move { result })
    }
}
