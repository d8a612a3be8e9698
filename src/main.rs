use clap::Parser;
use kube::CustomResourceExt;
use secret_syncopier::{
    config::{Config, LogFormat, RunArgs},
    crds::SecretSync,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
enum Args {
    /// Run the controller.
    Run(RunArgs),
    /// Print the SecretSync CustomResourceDefinition.
    Crds,
}

fn init_tracing(format: LogFormat) {
    // Respects RUST_LOG if set, otherwise defaults to INFO
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::Crds => {
            println!("{}", serde_yaml::to_string(&SecretSync::crd())?);
        }
        Args::Run(run_args) => {
            init_tracing(run_args.log_format);
            secret_syncopier::run(Config::from(&run_args)).await?;
        }
    };

    Ok(())
}
