//! Standalone note server.
//!
//! Configured from `NOTES_*` environment variables (see `ServerConfig::from_env`),
//! plus:
//! - `NOTES_TOKENS`: `token=user_uuid:username,...` accepted bearer tokens
//! - `NOTES_SEED_NOTES`: comma-separated note ids created empty at startup

use std::sync::Arc;

use notes_collab::{OpenMembership, ServerConfig, StaticAuthenticator, SyncServer};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!("Starting note server on {}...", config.bind_addr);

    let tokens = std::env::var("NOTES_TOKENS").unwrap_or_default();
    let authenticator = StaticAuthenticator::parse(&tokens)?;
    if authenticator.is_empty() {
        log::warn!("NOTES_TOKENS is empty, every join will be rejected");
    }

    let server = SyncServer::open(config, Arc::new(authenticator), Arc::new(OpenMembership))?;

    let seeds = std::env::var("NOTES_SEED_NOTES").unwrap_or_default();
    for raw in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let note_id = Uuid::parse_str(raw)?;
        let document = server.service().create_note(note_id, "")?;
        log::info!("Note {note_id} ready at version {}", document.version);
    }

    server.run().await
}
