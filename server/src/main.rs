use clap::Parser;
use log::info;
use server::config::{self, Overrides};
use server::network::ChatServer;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "LAN chat broadcast server", long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long)]
    bind: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory for message and user logs
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Operator secret feeding the message integrity tags
    #[arg(long)]
    secret: Option<String>,

    /// How many history messages to send on join
    #[arg(long)]
    hist: Option<usize>,

    /// 64-hex-char key enabling at-rest log encryption
    #[arg(long)]
    enc_key_hex: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let cfg = config::bootstrap(&Overrides {
        bind: args.bind,
        port: args.port,
        data: args.data,
        secret: args.secret,
        hist: args.hist,
        enc_key_hex: args.enc_key_hex,
    })?;

    let server = ChatServer::bind(cfg).await?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}
