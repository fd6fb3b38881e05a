//! Connection configuration.
//!
//! Provides connection parameters for establishing PostgreSQL connections,
//! a builder-style API, and an environment-variable loader for CLI use.

use std::collections::HashMap;
use std::time::Duration;

/// PostgreSQL connection configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 5432)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication (optional for trust auth)
    pub password: Option<String>,
    /// Database name to connect to
    pub database: String,
    /// Client encoding sent at startup (default: UTF8)
    pub client_encoding: String,
    /// Application name (visible in pg_stat_activity)
    pub application_name: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Per-query timeout; expiry leaves the connection unusable
    pub query_timeout: Duration,
    /// Additional startup parameters
    pub options: HashMap<String, String>,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            password: None,
            database: String::new(),
            client_encoding: "UTF8".to_string(),
            application_name: None,
            connect_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
            options: HashMap::new(),
        }
    }
}

impl PgConfig {
    /// Create a new configuration with the given connection components.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `PG_HOST`, `PG_PORT`, `PG_DATABASE`,
    /// `PG_USER`, and `PG_PASSWORD`. Unset variables fall back to the
    /// defaults (`localhost`, 5432, empty database/user, no password).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("PG_HOST") {
            config.host = host;
        }
        if let Some(port) = std::env::var("PG_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.port = port;
        }
        if let Ok(database) = std::env::var("PG_DATABASE") {
            config.database = database;
        }
        if let Ok(user) = std::env::var("PG_USER") {
            config.user = user;
        }
        if let Ok(password) = std::env::var("PG_PASSWORD") {
            config.password = Some(password);
        }
        config
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the client encoding.
    pub fn client_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.client_encoding = encoding.into();
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-query timeout.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set an additional startup parameter.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Build the startup parameters to send to the server.
    pub fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("user".to_string(), self.user.clone()),
            ("database".to_string(), self.database.clone()),
            ("client_encoding".to_string(), self.client_encoding.clone()),
        ];

        if let Some(app_name) = &self.application_name {
            params.push(("application_name".to_string(), app_name.clone()));
        }

        for (k, v) in &self.options {
            params.push((k.clone(), v.clone()));
        }

        params
    }

    /// Get the host:port string for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
