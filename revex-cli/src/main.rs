// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use std::path::Path;

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use revex::{
  client::AgentConfig,
  common::protocol::handshake::HandshakeFlavor,
  util::validators::{
    parse_service_target, validate_existing_file, validate_host_port, validate_service_target,
  },
};
use tokio_util::sync::CancellationToken;

mod client;
mod config;
mod server;

use config::{ConfigFile, ExchangeLayer, ExchangeSettings, RevproxyLayer};

fn validate_handshake(v: &str) -> Result<(), String> {
  v.parse::<HandshakeFlavor>().map(|_| ())
}

fn validate_positive(v: &str) -> Result<(), String> {
  match v.parse::<u64>() {
    Ok(n) if n > 0 => Ok(()),
    _ => Err(String::from("Expected a positive integer")),
  }
}

fn config_arg() -> Arg<'static> {
  Arg::new("config")
    .help("JSON settings file; flags take precedence over its values")
    .long("config")
    .validator(validate_existing_file)
    .takes_value(true)
}

fn handshake_arg() -> Arg<'static> {
  Arg::new("handshake")
    .help("Data-plane handshake flavor [default: reverse]")
    .long("handshake")
    .validator(validate_handshake)
    .takes_value(true)
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("exchange")
        .about("Run the exchange: control plane, data plane, and proxy front")
        .arg(config_arg())
        .arg(
          Arg::new("control")
            .help("Control-plane listen address [default: 127.0.0.1:9090]")
            .long("control")
            .validator(validate_host_port)
            .takes_value(true),
        )
        .arg(
          Arg::new("data-plane")
            .help("Data-plane listen address [default: 127.0.0.1:9091]")
            .long("data-plane")
            .validator(validate_host_port)
            .takes_value(true),
        )
        .arg(
          Arg::new("front")
            .help("Proxy front listen address [default: 127.0.0.1:1080]")
            .long("front")
            .validator(validate_host_port)
            .takes_value(true),
        )
        .arg(handshake_arg())
        .arg(
          Arg::new("concurrency")
            .help("Data-plane handshakes admitted at once [default: 25]")
            .long("concurrency")
            .validator(validate_positive)
            .takes_value(true),
        )
        .arg(
          Arg::new("dial-timeout-ms")
            .help("Time allowed for a registered party to dial back [default: 10000]")
            .long("dial-timeout-ms")
            .validator(validate_positive)
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("revproxy")
        .about("Register local services with an exchange and serve its dial requests")
        .arg(config_arg())
        .arg(
          Arg::new("namespace")
            .long("namespace")
            .short('n')
            .takes_value(true),
        )
        .arg(
          Arg::new("exchange-control")
            .help("Exchange control-plane address [default: 127.0.0.1:9090]")
            .long("exchange-control")
            .validator(validate_host_port)
            .takes_value(true),
        )
        .arg(
          Arg::new("exchange-data-plane")
            .help("Exchange data-plane address [default: 127.0.0.1:9091]")
            .long("exchange-data-plane")
            .validator(validate_host_port)
            .takes_value(true),
        )
        .arg(handshake_arg())
        .arg(
          Arg::new("service")
            .help("A local service to offer, as name=host:port")
            .long("service")
            .short('s')
            .validator(validate_service_target)
            .takes_value(true)
            .multiple_occurrences(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn load_config_file(args: &ArgMatches) -> Result<ConfigFile> {
  Ok(match args.value_of("config") {
    Some(path) => ConfigFile::load(Path::new(path))?,
    None => ConfigFile::default(),
  })
}

fn parse_handshake(args: &ArgMatches) -> Result<Option<HandshakeFlavor>> {
  args
    .value_of("handshake")
    .map(|v| v.parse::<HandshakeFlavor>().map_err(anyhow::Error::msg))
    .transpose()
}

pub fn exchange_arg_handling(args: &ArgMatches) -> Result<ExchangeSettings> {
  let flags = ExchangeLayer {
    control_addr: args.value_of("control").map(Into::into),
    data_plane_addr: args.value_of("data-plane").map(Into::into),
    front_addr: args.value_of("front").map(Into::into),
    handshake: parse_handshake(args)?,
    concurrency: args.value_of("concurrency").map(str::parse).transpose()?,
    dial_timeout_ms: args.value_of("dial-timeout-ms").map(str::parse).transpose()?,
  };
  Ok(flags.over(load_config_file(args)?.exchange).into())
}

pub fn revproxy_arg_handling(args: &ArgMatches) -> Result<AgentConfig> {
  let services = match args.values_of("service") {
    Some(values) => Some(
      values
        .map(parse_service_target)
        .collect::<Result<_, _>>()?,
    ),
    None => None,
  };
  let flags = RevproxyLayer {
    namespace: args.value_of("namespace").map(Into::into),
    control_addr: args.value_of("exchange-control").map(Into::into),
    data_plane_addr: args.value_of("exchange-data-plane").map(Into::into),
    handshake: parse_handshake(args)?,
    services,
  };
  Ok(AgentConfig::try_from(flags.over(load_config_file(args)?.revproxy))?)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
  let shutdown = CancellationToken::new();
  tokio::task::spawn({
    let shutdown = shutdown.clone();
    async move {
      match tokio::signal::ctrl_c().await {
        Ok(()) => {
          tracing::info!("shutdown_requested");
          shutdown.cancel();
        }
        Err(error) => tracing::warn!(?error, "ctrl_c_handler_unavailable"),
      }
    }
  });
  shutdown
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("exchange", opts) => {
      let settings = exchange_arg_handling(opts)?;
      tracing::info!("Running as exchange with settings {:#?}", settings);
      server::exchange_main(settings, shutdown_on_ctrl_c()).await
    }
    ("revproxy", opts) => {
      let config = revproxy_arg_handling(opts)?;
      tracing::info!("Running as revproxy with config {:#?}", config);
      client::revproxy_main(config, shutdown_on_ctrl_c()).await
    }
    (_, _) => unreachable!(),
  }
}
