use clap::Parser;
use forwarder::{config::Config, supervisor};

#[tokio::main]
async fn main() {
    let cfg = Config::parse();

    if let Err(e) = supervisor::run(cfg).await {
        eprintln!("df-remote-write-forwarder: {e}");
        std::process::exit(1);
    }
}
