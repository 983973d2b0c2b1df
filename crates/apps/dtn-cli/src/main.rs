//! Thin command-line client over the API adapter (§4.9), in the spirit of
//! the classic `dtnsend`/`dtnrecv`/`dtnquery` tools: each subcommand opens
//! one connection, makes its calls, and exits.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dtn_api::{ApiClient, BundleSpec, RegInfo, WireFailureAction, WirePriority};

#[derive(Parser, Debug)]
#[command(name = "dtn-cli")]
struct Cli {
    /// Address of the running daemon's API adapter.
    #[arg(long, default_value = "127.0.0.1:4556")]
    api_bind: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the daemon's local endpoint ID.
    LocalEid,
    /// Register an endpoint pattern and print the assigned registration id.
    Register {
        pattern: String,
        #[arg(long, default_value_t = 3600)]
        expiration_secs: u64,
        #[arg(long)]
        init_passive: bool,
    },
    /// Send a bundle, reading its payload from a file or stdin (`-`).
    Send {
        destination: String,
        #[arg(long)]
        source: PathBuf,
        #[arg(long, default_value_t = 3600)]
        lifetime_secs: u64,
        #[arg(long, value_enum, default_value = "normal")]
        priority: CliPriority,
        #[arg(long)]
        custody: bool,
        #[arg(long)]
        delivery_receipt: bool,
    },
    /// Register for `pattern`, bind to it, and print bundles as they arrive.
    Recv {
        pattern: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        count: Option<u64>,
    },
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum CliPriority {
    Bulk,
    Normal,
    Expedited,
}

impl From<CliPriority> for WirePriority {
    fn from(priority: CliPriority) -> Self {
        match priority {
            CliPriority::Bulk => WirePriority::Bulk,
            CliPriority::Normal => WirePriority::Normal,
            CliPriority::Expedited => WirePriority::Expedited,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("dtn-cli: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::LocalEid => {
            let mut client = ApiClient::connect(&cli.api_bind).await?;
            println!("{}", client.local_eid().await?);
        }
        Command::Register { pattern, expiration_secs, init_passive } => {
            let mut client = ApiClient::connect(&cli.api_bind).await?;
            let regid = client
                .register(RegInfo {
                    pattern,
                    failure_action: WireFailureAction::Defer,
                    expiration_secs,
                    init_passive,
                })
                .await?;
            println!("{regid}");
        }
        Command::Send { destination, source, lifetime_secs, priority, custody, delivery_receipt } => {
            let payload = read_payload(&source)?;
            let mut client = ApiClient::connect(&cli.api_bind).await?;
            client
                .send(
                    BundleSpec {
                        destination,
                        reply_to: None,
                        lifetime_secs,
                        priority: priority.into(),
                        custody,
                        delivery_receipt,
                        do_not_fragment: false,
                    },
                    payload,
                )
                .await?;
        }
        Command::Recv { pattern, timeout_ms, count } => {
            let mut client = ApiClient::connect(&cli.api_bind).await?;
            let regid = client
                .register(RegInfo {
                    pattern,
                    failure_action: WireFailureAction::Defer,
                    expiration_secs: 0,
                    init_passive: false,
                })
                .await?;
            client.bind(regid).await?;

            let mut received = 0u64;
            loop {
                match client.begin_poll(timeout_ms).await? {
                    Some(bundle) => {
                        println!(
                            "from {} ({} bytes, seq {}.{})",
                            bundle.source,
                            bundle.payload.len(),
                            bundle.creation_secs,
                            bundle.creation_seq
                        );
                        use std::io::Write;
                        std::io::stdout().write_all(&bundle.payload)?;
                        println!();
                        received += 1;
                        if count.is_some_and(|limit| received >= limit) {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    Ok(())
}

fn read_payload(source: &PathBuf) -> std::io::Result<Vec<u8>> {
    if source.as_os_str() == "-" {
        use std::io::Read;
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(source)
    }
}
