use clap::Parser;
use log::{error, info};
use server::accounts::open_directory;
use server::config::{Args, ServerConfig};
use server::network::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig::from(args);

    let accounts = match open_directory(config.accounts.as_deref()) {
        Ok(accounts) => accounts,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    info!("Starting UDP chat server at {}", config.bind_addr);
    let server = match Server::bind(config, accounts).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    server.run().await?;
    Ok(())
}
