use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use warmc::{Result, cmd, portfile::PortFileRegistry};

/// Command-line arguments for the warmc application
#[derive(Parser)]
#[command(name = "warmc")]
#[command(about = "Persistent compile server and client")]
#[command(version)]
struct Cli {
   #[command(subcommand)]
   command: Cmd,
}

/// Available subcommands for warmc
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Run a compile server for a port file")]
   Serve {
      #[arg(
         long,
         help = "Server settings: \
                 portfile=<path>[,poolsize=<n>][,keepalive=<secs>][,compiler=<prog>]"
      )]
      settings: String,
   },

   #[command(about = "Send a compile request, starting a server if needed")]
   Compile {
      #[arg(long, help = "Port file of the server")]
      portfile: PathBuf,

      #[arg(long, help = "Fail instead of starting a server")]
      no_spawn: bool,

      #[arg(long, help = "Settings for a server started on demand")]
      settings: Option<String>,

      #[arg(last = true, help = "Compiler arguments")]
      args: Vec<String>,
   },

   #[command(about = "Ask the server for a port file to stop")]
   Stop {
      #[arg(long, help = "Port file of the server")]
      portfile: PathBuf,
   },

   #[command(about = "Show the server published in a port file")]
   Status {
      #[arg(long, help = "Port file of the server")]
      portfile: PathBuf,

      #[arg(long, help = "JSON output")]
      json: bool,
   },
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
      .with_writer(std::io::stderr)
      .init();

   let cli = Cli::parse();
   match run(cli).await {
      Ok(code) => std::process::exit(code),
      Err(err) => {
         eprintln!("{err}");
         std::process::exit(err.exit_code());
      },
   }
}

async fn run(cli: Cli) -> Result<i32> {
   let registry = PortFileRegistry::new();

   match cli.command {
      Cmd::Serve { settings } => cmd::serve::execute(&settings, &registry).await,
      Cmd::Compile { portfile, no_spawn, settings, args } => {
         cmd::compile::execute(portfile, args, no_spawn, settings, &registry).await
      },
      Cmd::Stop { portfile } => cmd::stop::execute(portfile, &registry).await.map(|()| 0),
      Cmd::Status { portfile, json } => {
         cmd::status::execute(portfile, json, &registry).await.map(|()| 0)
      },
   }
}
