//! Chainforge - CLI entry point
//!
//! Compiles a profile store and a selected root profile into an engine
//! configuration document. Mainly a debugging and batch-validation surface;
//! service layers call [`chainforge::compile`] directly.

use chainforge::compiler::{compile, CompileOptions};
use chainforge::store::MemoryStore;
use chainforge::VERSION;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "chainforge")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Proxy chain configuration compiler")]
struct Args {
    /// Path to the profile store (YAML: profiles + rules)
    #[arg(short = 's', long = "store", default_value = "store.yaml")]
    store: PathBuf,

    /// Root profile id to compile
    #[arg(short = 'p', long = "profile")]
    profile: i64,

    /// Compile options file (YAML); defaults apply when omitted
    #[arg(short = 'o', long = "options")]
    options: Option<PathBuf>,

    /// Write the configuration document here instead of stdout
    #[arg(long = "output")]
    output: Option<PathBuf>,

    /// Compile in connectivity-test mode (no inbounds, no rules)
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chainforge=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("Chainforge v{}", VERSION);
    info!("Loading profile store from: {}", args.store.display());

    let store = match MemoryStore::load(&args.store) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load profile store: {}", e);
            std::process::exit(1);
        }
    };

    let mut opts = match &args.options {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            serde_yaml::from_str::<CompileOptions>(&content)?
        }
        None => CompileOptions::default(),
    };
    if args.test {
        opts.for_test = true;
    }

    let result = match compile(&store, args.profile, &opts) {
        Ok(r) => r,
        Err(e) => {
            error!("Compilation failed: {}", e);
            std::process::exit(1);
        }
    };

    for alert in &result.alerts {
        error!("alert: {:?}: {}", alert.code, alert.message);
    }
    for payload in &result.plugin_payloads {
        info!(
            plugin = %payload.plugin_id,
            profile = payload.profile_id,
            "plugin payload generated"
        );
    }

    match &args.output {
        Some(path) => {
            fs::write(path, &result.config_json)?;
            info!("Configuration written to: {}", path.display());
        }
        None => println!("{}", result.config_json),
    }

    Ok(())
}
