use std::sync::Arc;

use tandem_hub::{HubServer, LogMutations, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    // Settled mutations are logged on the CALLBACK_DEBOUNCE_WAIT/MAXWAIT schedule.
    HubServer::open(config, Some(Arc::new(LogMutations)))?
        .run()
        .await?;
    Ok(())
}
