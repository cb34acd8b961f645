use clap::Parser;
use gvon_signal::SignalingServer;

/// Signaling server for socket-transport peers.
#[derive(Parser, Debug)]
#[command(name = "gvon-signal", version)]
struct Cli {
    /// Port to listen for signaling requests.
    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// IP or hostname to listen on.
    #[arg(long, default_value = "localhost")]
    ip: String,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async {
            if let Err(err) = run(&cli).await {
                eprintln!("{err}");
                std::process::exit(1);
            }
        });
}

async fn run(cli: &Cli) -> Result<(), String> {
    let addr = format!("{}:{}", cli.ip, cli.port);
    let server = SignalingServer::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind on {addr}: {e}"))?;
    server
        .serve()
        .await
        .map_err(|e| format!("signaling server failed: {e}"))
}
