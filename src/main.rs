use anyhow::{Context, Result};
use clap::Parser;
use rtpscribe::bus::{MessageBus, SocketBusClient, default_socket_path};
use rtpscribe::cli::{Cli, Commands, ConfigAction};
use rtpscribe::config::Config;
use rtpscribe::control::{ControlTopics, NewStream, StreamEnded};
use rtpscribe::daemon::run_daemon;
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    rtpscribe::logging::init(cli.quiet, cli.verbose);

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            run_daemon(config, None).await?;
        }
        Some(Commands::Serve { socket }) => {
            let config = load_config(cli.config.as_deref())?;
            run_daemon(config, socket).await?;
        }
        Some(Commands::Start {
            channel_id,
            port,
            room,
            caller,
            socket,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let message = NewStream {
                channel_id,
                port,
                room_name: room,
                caller_name: caller,
            };
            let topics = ControlTopics::new(&config.bus.prefix);
            publish(&config, socket, &topics.new_stream, serde_json::to_value(message)?).await?;
        }
        Some(Commands::End {
            channel_id,
            port,
            socket,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let message = StreamEnded { channel_id, port };
            let topics = ControlTopics::new(&config.bus.prefix);
            publish(&config, socket, &topics.stream_ended, serde_json::to_value(message)?).await?;
        }
        Some(Commands::Follow { room, socket }) => {
            let config = load_config(cli.config.as_deref())?;
            handle_follow(&config, room, socket).await?;
        }
        Some(Commands::Config { action }) => {
            handle_config_command(action, cli.config.as_deref())?;
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    };
    Ok(config.with_env_overrides())
}

fn client_for(config: &Config, socket: Option<PathBuf>) -> SocketBusClient {
    let socket_path = socket
        .or_else(|| config.bus.socket.clone())
        .unwrap_or_else(default_socket_path);
    SocketBusClient::new(socket_path)
}

async fn publish(
    config: &Config,
    socket: Option<PathBuf>,
    topic: &str,
    payload: serde_json::Value,
) -> Result<()> {
    let client = client_for(config, socket);
    client.publish(topic, payload).await.with_context(|| {
        format!(
            "Failed to reach the daemon at {}. Is it running? Start it with: rtpscribe serve",
            client.socket_path().display()
        )
    })?;
    println!("Published {topic}");
    Ok(())
}

async fn handle_follow(config: &Config, room: Option<String>, socket: Option<PathBuf>) -> Result<()> {
    let topics = ControlTopics::new(&config.bus.prefix);
    let filter = match room {
        Some(room) => topics.transcription(&room),
        None => topics.transcription_filter(),
    };
    let client = client_for(config, socket);
    let mut subscription = client.subscribe(&filter).await.with_context(|| {
        format!(
            "Failed to follow the daemon at {}",
            client.socket_path().display()
        )
    })?;

    eprintln!("Following {filter}... (Ctrl+C to stop)");
    while let Some(message) = subscription.recv().await {
        println!("{} {}", message.topic, message.payload);
    }
    eprintln!("Daemon connection closed");
    Ok(())
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{rendered}");
        }
        ConfigAction::Path => {
            let path = custom_path
                .map(Path::to_path_buf)
                .unwrap_or_else(Config::default_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}
