use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::SerializableSecretString;

/// A config type which can be converted into driver-specific connect options.
///
/// The connection parameters live in one serializable struct per database
/// flavor; this trait produces the corresponding `sqlx` options from them.
pub trait IntoConnectOptions<Output> {
    /// Creates connection options for the configured server and database.
    fn with_db(&self) -> Output;
}

/// Connection parameters for the Postgres reporting database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the Postgres server.
    pub host: String,
    /// Port number on which the Postgres server is listening.
    pub port: u16,
    /// Name of the database to connect to.
    pub name: String,
    /// Username for authentication.
    pub username: String,
    /// Password for the specified user. Redacted in debug output.
    pub password: Option<SerializableSecretString>,
    /// Whether TLS is required for the connection.
    #[serde(default)]
    pub require_tls: bool,
}

impl IntoConnectOptions<PgConnectOptions> for PgConnectionConfig {
    fn with_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_tls {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };

        let mut options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.name)
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }
}

/// Connection parameters for the read-only Moodle (MySQL) database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MySqlConnectionConfig {
    /// Hostname or IP address of the MySQL server.
    pub host: String,
    /// Port number on which the MySQL server is listening.
    pub port: u16,
    /// Name of the Moodle database.
    pub name: String,
    /// Username for authentication. A read-only account is expected.
    pub username: String,
    /// Password for the specified user. Redacted in debug output.
    pub password: Option<SerializableSecretString>,
    /// Whether TLS is required for the connection.
    #[serde(default)]
    pub require_tls: bool,
}

impl IntoConnectOptions<MySqlConnectOptions> for MySqlConnectionConfig {
    fn with_db(&self) -> MySqlConnectOptions {
        let ssl_mode = if self.require_tls {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Preferred
        };

        let mut options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.name)
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_options_carry_database_name() {
        let config = PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "celoeapi".to_string(),
            username: "etl".to_string(),
            password: None,
            require_tls: false,
        };

        let options: PgConnectOptions = config.with_db();
        assert_eq!(options.get_database(), Some("celoeapi"));
    }

    #[test]
    fn mysql_config_debug_output_redacts_password() {
        let config = MySqlConnectionConfig {
            host: "localhost".to_string(),
            port: 3306,
            name: "moodle".to_string(),
            username: "readonly".to_string(),
            password: Some("secret".to_string().into()),
            require_tls: false,
        };

        let _options: MySqlConnectOptions = config.with_db();

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
    }
}
