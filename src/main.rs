//! tandem-server — the collaboration session endpoint.
//!
//! Wires configuration to concrete stores and serves WebSocket sessions.
//! Exits 0 on clean shutdown, 1 when configuration is invalid or a store
//! is unreachable at startup.

use std::process::ExitCode;
use std::sync::Arc;

use tandem_collab::auth::{JwtVerifier, StaticVerifier, TokenVerifier};
use tandem_collab::config::Config;
use tandem_collab::ephemeral::{EphemeralStore, MemoryEphemeralStore, RedisEphemeralStore};
use tandem_collab::server::CollabServer;
use tandem_collab::store::{DocumentStore, MemoryStore, PostgresStore};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };
    log::info!("starting tandem-server on {}", config.listen_addr);

    let store: Arc<dyn DocumentStore> = if config.durable_store_url.is_empty() {
        log::warn!("no durable store configured, using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        match PostgresStore::connect(&config.durable_store_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                log::error!("durable store unreachable: {e}");
                return ExitCode::from(1);
            }
        }
    };

    let ephemeral: Arc<dyn EphemeralStore> = if config.ephemeral_store_url.is_empty() {
        log::warn!("no ephemeral store configured, using in-memory store");
        Arc::new(MemoryEphemeralStore::new())
    } else {
        match RedisEphemeralStore::connect(&config.ephemeral_store_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                log::error!("ephemeral store unreachable: {e}");
                return ExitCode::from(1);
            }
        }
    };

    let verifier: Arc<dyn TokenVerifier> = match &config.auth_jwt_secret {
        Some(secret) => Arc::new(JwtVerifier::new(secret.as_bytes())),
        None => {
            log::warn!("no auth secret configured, all tokens will be rejected");
            Arc::new(StaticVerifier::new())
        }
    };

    let server = CollabServer::new(config, store, ephemeral, verifier);
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("server failed: {e}");
            ExitCode::from(1)
        }
    }
}
