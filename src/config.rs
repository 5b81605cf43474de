use lazy_static::lazy_static;

pub struct Config {
    /// Postgres connection string. When unset (or not a postgres scheme) the
    /// daemon falls back to a local sqlite file at `storage_path`.
    pub database_url: Option<String>,
    pub storage_path: String,
    pub socket_path: String,
    pub api_base_url: String,
}

impl Config {
    pub fn use_postgres(&self) -> bool {
        match &self.database_url {
            Some(url) => url.starts_with("postgres://") || url.starts_with("postgresql://"),
            None => false,
        }
    }
}

lazy_static! {
    pub static ref CONFIG: Config = {
        let database_url = match std::env::var("DATABASE_URL") {
            Ok(val) if val.is_empty() => None,
            Ok(val) => Some(val),
            Err(_) => None,
        };
        let storage_path =
            std::env::var("STORAGE_PATH").unwrap_or_else(|_| "var/st-daemon.db".to_string());
        let socket_path =
            std::env::var("SOCKET_PATH").unwrap_or_else(|_| "var/daemon.sock".to_string());
        let api_base_url = std::env::var("API_BASE_URL")
            .unwrap_or_else(|_| "https://api.spacetraders.io/v2".to_string());
        Config {
            database_url,
            storage_path,
            socket_path,
            api_base_url,
        }
    };
}
