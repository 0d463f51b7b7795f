use crate::{env_optional, env_parse_or, ConfigError, FromEnv};

/// Redis connection configuration
///
/// `REDIS_URL` wins over `REDIS_HOST`; credentials and database are folded
/// into the URL by [`RedisConfig::build_url`].
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
}

impl RedisConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            username: None,
            password: None,
            database: 0,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    /// Connection URL with credentials and database applied.
    pub fn build_url(&self) -> String {
        let (scheme, rest) = match self.uri.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("redis", self.uri.as_str()),
        };
        // Credentials already present in the URI are kept as-is
        let (auth_in_uri, host_part) = match rest.rsplit_once('@') {
            Some((auth, host)) => (Some(auth), host),
            None => (None, rest),
        };
        let host = host_part.split('/').next().unwrap_or(host_part);

        let auth = match (auth_in_uri, &self.username, &self.password) {
            (Some(auth), _, _) => format!("{auth}@"),
            (None, Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, None, Some(pass)) => format!(":{pass}@"),
            (None, Some(user), None) => format!("{user}@"),
            (None, None, None) => String::new(),
        };

        format!("{scheme}://{auth}{host}/{}", self.database)
    }
}

impl FromEnv for RedisConfig {
    /// Requires `REDIS_URL` or `REDIS_HOST`
    fn from_env() -> Result<Self, ConfigError> {
        let uri = env_optional("REDIS_URL")
            .or_else(|| env_optional("REDIS_HOST"))
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;

        Ok(Self {
            uri,
            username: env_optional("REDIS_USERNAME"),
            password: env_optional("REDIS_PASSWORD"),
            database: env_parse_or("REDIS_DATABASE", 0)?,
        })
    }
}
