use clap::Parser;
use client::console::{self, Input};
use client::network::ChatClient;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host
    #[arg(default_value = shared::DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(default_value_t = shared::DEFAULT_PORT)]
    port: u16,

    /// Username to join as (prompted for if omitted)
    #[arg(short, long)]
    username: Option<String>,

    /// Password for the account (prompted for if omitted)
    #[arg(short, long)]
    password: Option<String>,

    /// Seconds between keep-alive pings
    #[arg(long, default_value_t = 5)]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let username = match args.username {
        Some(username) => username,
        None => prompt(&mut stdin, "username: ").await?,
    };
    let password = match args.password {
        Some(password) => password,
        None => prompt(&mut stdin, "password: ").await?,
    };

    let server = shared::host_port(&args.host, args.port);
    info!("Connecting to {}", server);
    let (client, mut events) = ChatClient::connect(&server).await?;
    let client = Arc::new(client);

    let roster = match client.join(&username, &password).await {
        Ok(roster) => roster,
        Err(e) => {
            error!("Could not join: {}", e);
            return Err(e.into());
        }
    };
    info!("Joined {} as {}", client.server_addr(), username);
    println!("{}", console::welcome_line(&roster.members, roster.omitted));

    let heartbeat = client.spawn_heartbeat(Duration::from_secs(args.heartbeat_secs.max(1)));
    let printer = tokio::spawn(async move {
        while let Some(message) = events.recv().await {
            if let Some(line) = console::render(&message) {
                println!("{}", line);
            }
        }
    });

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match console::parse_input(&line) {
                    Input::Quit => break,
                    Input::Empty => {}
                    Input::Chat(text) => {
                        if let Err(e) = client.chat(&text).await {
                            warn!("Message not delivered: {}", e);
                            println!("! message not delivered: {}", e);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    heartbeat.abort();
    if let Err(e) = client.leave().await {
        warn!("Leave was not acknowledged: {}", e);
    }
    printer.abort();
    Ok(())
}

async fn prompt(
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
    label: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;

    match stdin.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => Err("standard input closed".into()),
    }
}
