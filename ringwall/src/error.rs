use std::path::PathBuf;

/// Dataplane errors.
///
/// Anything returned from startup is fatal; anything returned from a reload
/// leaves the active snapshot serving traffic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("module {module} failed: {reason}")]
    Module { module: &'static str, reason: String },

    #[error("port {port}: {reason}")]
    Port { port: u16, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn module(module: &'static str, reason: impl Into<String>) -> Self {
        Error::Module {
            module,
            reason: reason.into(),
        }
    }

    pub fn port(port: u16, reason: impl Into<String>) -> Self {
        Error::Port {
            port,
            reason: reason.into(),
        }
    }
}
