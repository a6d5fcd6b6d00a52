// vim: tw=80
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    process::exit,
};

use clap::{crate_version, Parser};
use dmmp::{Scenario, SimError, Simulator};
use dmmp_core::{registry::Registry, table::Table};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
/// List the available path selectors
struct Selectors {}

impl Selectors {
    fn main(self) -> Result<(), SimError> {
        let registry = Registry::default();
        let mut stdout = io::stdout().lock();
        for name in registry.selectors() {
            writeln!(stdout, "{name}")?;
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Play a failover scenario against simulated devices
struct Simulate {
    #[clap(required(true))]
    /// YAML scenario file
    scenario: PathBuf,
}

impl Simulate {
    async fn main(self) -> Result<(), SimError> {
        let yaml = fs::read_to_string(&self.scenario)?;
        let scenario = Scenario::from_yaml(&yaml)?;
        let mut sim = Simulator::new(&scenario, io::stdout())?;
        sim.run(&scenario.steps).await?;
        sim.finish().await?.flush()?;
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Validate a multipath table and print it in canonical form
struct TableCmd {
    /// Table tokens.  May be given as one argument or several.
    #[clap(required(true), allow_hyphen_values(true))]
    tokens: Vec<String>,
}

impl TableCmd {
    fn main(self) -> Result<(), SimError> {
        let table = self.tokens.join(" ").parse::<Table>()?;
        println!("{table}");
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Selectors(Selectors),
    Simulate(Simulate),
    #[clap(name = "table")]
    Table(TableCmd),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli: Cli = Cli::parse();
    let r = match cli.cmd {
        SubCommand::Selectors(selectors) => selectors.main(),
        SubCommand::Simulate(simulate) => simulate.main().await,
        SubCommand::Table(table) => table.main(),
    };
    if let Err(e) = r {
        eprintln!("Error: {e}");
        exit(2);
    }
}
