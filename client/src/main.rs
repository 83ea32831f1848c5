mod network;

use clap::Parser;
use log::info;
use network::ChatClient;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "LAN chat terminal client", long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:5555")]
    server: String,

    /// Username announced to the server
    #[arg(short = 'u', long)]
    user: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    info!("connecting to {}", args.server);
    let client = ChatClient::connect(&args.server, &args.user).await?;
    println!("connected as {}, type a message (/quit to exit)", args.user);

    let (mut broadcasts, mut sender) = client.split();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            broadcast = broadcasts.next_broadcast() => {
                match broadcast? {
                    Some((ts_ms, user, text)) => {
                        println!("[{}] {}: {}", clock(ts_ms), user, text);
                    }
                    None => {
                        println!("server closed the connection");
                        break;
                    }
                }
            }
            line = stdin.next_line() => {
                match line? {
                    Some(line) => {
                        let line = line.trim();
                        if line == "/quit" {
                            break;
                        }
                        if !line.is_empty() {
                            sender.send_message(line).await?;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Wall-clock HH:MM:SS (UTC) from a millisecond timestamp.
fn clock(ts_ms: u64) -> String {
    let secs = ts_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60
    )
}
