//! Stagehand Relay — the collaboration server as a standalone process.
//!
//! Configuration comes from the environment:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `STAGEHAND_BIND` | `127.0.0.1:9090` | listen address |
//! | `STAGEHAND_MAX_USERS` | `100` | editors per document |
//! | `STAGEHAND_CHANGE_LOG` | `10000` | changes kept per document for catch-up |
//! | `STAGEHAND_SEED` | unset | JSON `DocumentSnapshot` loaded before serving |
//! | `RUST_LOG` | `info` | log filter |

use std::path::{Path, PathBuf};

use log::info;
use stagehand_collab::{CollabError, RelayServer, ServerConfig};
use stagehand_core::{DocumentSnapshot, GraphError};
use thiserror::Error;

#[derive(Debug, Error)]
enum RelayError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("cannot read seed document {path}: {source}")]
    SeedRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("seed document {path} is not valid JSON: {source}")]
    SeedParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("seed document rejected: {0}")]
    SeedGraph(#[from] GraphError),
    #[error(transparent)]
    Serve(#[from] CollabError),
}

#[derive(Debug)]
struct RelayOptions {
    server: ServerConfig,
    seed: Option<PathBuf>,
}

impl RelayOptions {
    /// Build options from a variable lookup (the process environment in
    /// `main`).
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayError> {
        let mut server = ServerConfig::default();
        if let Some(bind) = lookup("STAGEHAND_BIND") {
            server.bind_addr = bind;
        }
        if let Some(value) = lookup("STAGEHAND_MAX_USERS") {
            server.max_users_per_room = parse_positive("STAGEHAND_MAX_USERS", value)?;
        }
        if let Some(value) = lookup("STAGEHAND_CHANGE_LOG") {
            server.change_log_limit = parse_positive("STAGEHAND_CHANGE_LOG", value)?;
        }
        Ok(Self {
            server,
            seed: lookup("STAGEHAND_SEED").map(PathBuf::from),
        })
    }
}

fn parse_positive(name: &'static str, value: String) -> Result<usize, RelayError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(RelayError::InvalidNumber { name, value }),
    }
}

fn load_seed(path: &Path) -> Result<DocumentSnapshot, RelayError> {
    let json = std::fs::read_to_string(path).map_err(|source| RelayError::SeedRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&json).map_err(|source| RelayError::SeedParse {
        path: path.to_path_buf(),
        source,
    })
}

async fn run(options: RelayOptions) -> Result<(), RelayError> {
    let server = RelayServer::new(options.server);
    if let Some(path) = &options.seed {
        let document = load_seed(path)?;
        info!("Seeding document {} from {}", document.id, path.display());
        server.seed_document(document).await?;
    }
    server.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Stagehand Relay...");

    let result = match RelayOptions::from_lookup(|name| std::env::var(name).ok()) {
        Ok(options) => run(options).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stagehand_core::NodeSnapshot;
    use uuid::Uuid;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let options = RelayOptions::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(options.server.bind_addr, "127.0.0.1:9090");
        assert_eq!(options.server.max_users_per_room, 100);
        assert!(options.seed.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let options = RelayOptions::from_lookup(lookup_from(&[
            ("STAGEHAND_BIND", "0.0.0.0:7000"),
            ("STAGEHAND_MAX_USERS", "8"),
            ("STAGEHAND_CHANGE_LOG", " 500 "),
            ("STAGEHAND_SEED", "/tmp/venue.json"),
        ]))
        .unwrap();
        assert_eq!(options.server.bind_addr, "0.0.0.0:7000");
        assert_eq!(options.server.max_users_per_room, 8);
        assert_eq!(options.server.change_log_limit, 500);
        assert_eq!(options.seed, Some(PathBuf::from("/tmp/venue.json")));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = RelayOptions::from_lookup(lookup_from(&[("STAGEHAND_MAX_USERS", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidNumber {
                name: "STAGEHAND_MAX_USERS",
                ..
            }
        ));
    }

    #[test]
    fn test_load_seed_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("venue.json");
        let doc = DocumentSnapshot::with_nodes(
            Uuid::new_v4(),
            3,
            vec![NodeSnapshot::text("Stage").with_position(100.0, 20.0)],
        );
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        assert_eq!(load_seed(&path).unwrap(), doc);
    }

    #[test]
    fn test_load_seed_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(load_seed(&missing), Err(RelayError::SeedRead { .. })));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{ not json").unwrap();
        assert!(matches!(load_seed(&garbage), Err(RelayError::SeedParse { .. })));
    }
}
