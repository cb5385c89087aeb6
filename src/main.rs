use std::net::IpAddr;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_kernel::{Relay, RelayOptions};

#[derive(Parser)]
#[command(
    name = "cdp-relay",
    version,
    about = "CDP relay between automation drivers and browser extensions"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (the default).
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Port for the HTTP + WebSocket surface.
    #[arg(long, default_value_t = 19988)]
    port: u16,

    /// Bind address; keep this on loopback unless you know what you are doing.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Require `?token=` on /cdp and a bearer/query token on privileged HTTP.
    #[arg(long)]
    token: Option<String>,

    /// Extension id accepted as WebSocket origin and as a
    /// chrome-extension:// target URL; repeatable.
    #[arg(long = "allow-extension")]
    allowed_extension_ids: Vec<String>,

    /// Create an initial tab on the first driver Target.setAutoAttach when
    /// the extension has no attached targets.
    #[arg(long)]
    auto_tab: bool,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            port: 19988,
            host: IpAddr::from([127, 0, 0, 1]),
            token: None,
            allowed_extension_ids: Vec::new(),
            auto_tab: false,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cdp_frames=off"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let args = match cli.command {
        Some(Command::Serve(args)) => args,
        None => ServeArgs::default(),
    };

    let options = RelayOptions {
        host: args.host,
        port: args.port,
        token: args.token,
        allowed_extension_ids: args.allowed_extension_ids,
        auto_create_tab: args.auto_tab,
        ..RelayOptions::default()
    };

    info!(host = %options.host, port = options.port, "starting cdp-relay");
    let relay = Relay::new(options);
    relay_server::serve(relay).await
}
