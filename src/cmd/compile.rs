//! Compile command: forwards arguments to the server for a port file.

use std::path::PathBuf;

use console::style;

use crate::{
   Result,
   client::Client,
   compiler::LogLevel,
   config::{self, ClientSettings, ServerSettings},
   portfile::PortFileRegistry,
};

/// Sends one compile request. Returns the exit code of the compile result.
pub async fn execute(
   portfile: PathBuf,
   args: Vec<String>,
   no_spawn: bool,
   settings: Option<String>,
   registry: &PortFileRegistry,
) -> Result<i32> {
   let cfg = config::get();
   let handle = registry.get(&portfile)?;
   let mut client = Client::new(handle, ClientSettings::from_config(cfg));

   if !no_spawn {
      let server = match settings {
         Some(s) => ServerSettings::parse(&s, cfg)?,
         None => ServerSettings::new(&portfile, cfg),
      };
      client = client.with_spawn(server);
   }

   let result = client
      .compile(&args, |level, message| match level {
         LogLevel::Error => eprintln!("{}", style(message).red()),
         LogLevel::Warn => eprintln!("{}", style(message).yellow()),
         LogLevel::Info => println!("{message}"),
         LogLevel::Debug | LogLevel::Trace => eprintln!("{}", style(message).dim()),
      })
      .await?;

   if !result.is_ok() {
      eprintln!("{}", style(format!("compile finished with {result}")).dim());
   }
   Ok(result.exit_code())
}
