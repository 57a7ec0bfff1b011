use anyhow::{Context, Result};
use clap::{arg, crate_name, crate_version, Arg, ArgMatches, Command};
use config::{AT2Configuration, Bootstrap, Export, Import, NodeParameters, PrivateConfig};
use node::spawn_node;

#[tokio::main]
async fn main() -> Result<()> {
    // Read the cli parameters.
    let matches = Command::new(crate_name!())
        .version(crate_version!())
        .about("A probabilistic Byzantine reliable broadcast node.")
        .arg(Arg::new("verbose").multiple_occurrences(true).short('v'))
        .subcommand(
            Command::new("generate")
                .about("Print a fresh key pair to file")
                .arg(arg!(--filename <FILE> "The path to the node keypair")),
        )
        .subcommand(Command::new("run").about("Run a node").args(&[
            arg!(--keypair <FILE> "The path to the node keypair"),
            arg!(--bootstrap <FILE> "The path to the bootstrap roster"),
            arg!(--at2 <FILE> "The path to the broadcast configuration"),
            arg!(--parameters [FILE] "The path to the node parameters"),
            arg!(--router <ADDR> "The router bind address"),
            arg!(--publisher <ADDR> "The publisher bind address"),
        ]))
        .arg_required_else_help(true)
        .get_matches();

    // Configure the logger.
    let log_level = match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_module("node", log_level)
        .filter_module("network", log_level)
        .init();

    // Parse the input parameters.
    match matches.subcommand() {
        Some(("generate", sub_matches)) => PrivateConfig::new()
            .export(sub_matches.value_of("filename").unwrap())
            .context("Failed to generate key pair")?,
        Some(("run", sub_matches)) => spawn(sub_matches).await.context("Failed to spawn node")?,
        _ => unreachable!(),
    }
    Ok(())
}

/// Spawn a node and run its bootstrap discovery.
async fn spawn(matches: &ArgMatches) -> Result<()> {
    let keypair_file = matches.value_of("keypair").unwrap();
    let keypair = PrivateConfig::import(keypair_file).context("Failed to load keypair")?;

    let bootstrap_file = matches.value_of("bootstrap").unwrap();
    let bootstrap = Bootstrap::import(bootstrap_file).context("Failed to load bootstrap roster")?;

    let at2_file = matches.value_of("at2").unwrap();
    let at2 =
        AT2Configuration::import(at2_file).context("Failed to load broadcast configuration")?;

    let params = match matches.value_of("parameters") {
        Some(file) => NodeParameters::import(file).context("Failed to load node parameters")?,
        None => NodeParameters::default(),
    };

    let router = matches
        .value_of("router")
        .unwrap()
        .parse()
        .context("Failed to parse router address")?;
    let publisher = matches
        .value_of("publisher")
        .unwrap()
        .parse()
        .context("Failed to parse publisher address")?;

    let node = spawn_node(keypair.secret, at2, params, router, publisher);

    let routers: Vec<_> = bootstrap
        .routers
        .iter()
        .map(|address| address.parse().context("Failed to parse bootstrap address"))
        .collect::<Result<_>>()?;
    node.peer_discovery(&routers).await;

    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    }
}
