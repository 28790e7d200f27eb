use bridge_api::BridgeError;

/// JAAS login module для SASL/PLAIN.
pub const PLAIN_LOGIN_MODULE: &str = "org.apache.kafka.common.security.plain.PlainLoginModule";

/// Собрать JAAS-строку SASL/PLAIN из пары key/secret.
///
/// Чистая функция. Обратный слэш и двойная кавычка экранируются,
/// иначе значение разорвало бы строковый литерал JAAS.
pub fn build_auth_string(key: &str, secret: &str) -> Result<String, BridgeError> {
    if key.trim().is_empty() {
        return Err(BridgeError::config("credential key must not be empty"));
    }
    if secret.trim().is_empty() {
        return Err(BridgeError::config("credential secret must not be empty"));
    }
    Ok(format!(
        "{PLAIN_LOGIN_MODULE} required username=\"{}\" password=\"{}\";",
        escape(key),
        escape(secret)
    ))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Пара key/secret и производная JAAS-строка. Неизменяема.
///
/// `Debug` не раскрывает secret и JAAS-строку.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    key: String,
    secret: String,
    auth_string: String,
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Result<Self, BridgeError> {
        let key = key.into();
        let secret = secret.into();
        let auth_string = build_auth_string(&key, &secret)?;
        Ok(Self { key, secret, auth_string })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `sasl.jaas.config`.
    pub fn auth_string(&self) -> &str {
        &self.auth_string
    }

    /// `basic.auth.user.info` = `key:secret`.
    pub fn user_info(&self) -> String {
        format!("{}:{}", self.key, self.secret)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"***")
            .finish_non_exhaustive()
    }
}
