use anyhow::Result;
use charactercounter_controller::charactercounter_types::CharacterCounter;
use charactercounter_controller::config::ControllerConfig;
use charactercounter_controller::controller_runtime::run_controller;
use kube::CustomResourceExt;
use std::env;
use tracing::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cmd = env::args().nth(1).unwrap_or_default();
    if cmd == "export" {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&CharacterCounter::crd())?);
    } else if cmd == "run" {
        let config = ControllerConfig::from_env()?;
        info!("running charactercounter-controller");
        run_controller(config).await?;
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
