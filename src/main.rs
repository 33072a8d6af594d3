use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chatrelay::{Server, api, config::Config};

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let service = api::build(&config)?;
    let server = Server::bind(&config.server.bind)
        .await?
        .max_request_bytes(config.server.max_request_bytes);
    info!(address = %server.local_addr(), "relay ready");

    server
        .run_until(
            move |req| {
                let service = service.clone();
                async move { service.call(req).await }
            },
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            },
        )
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatrelay=info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "chatrelay exited");
            ExitCode::FAILURE
        }
    }
}
