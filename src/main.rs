// ███████╗██╗     ███████╗███████╗████████╗
// ██╔════╝██║     ██╔════╝██╔════╝╚══██╔══╝
// █████╗  ██║     █████╗  █████╗     ██║
// ██╔══╝  ██║     ██╔══╝  ██╔══╝     ██║
// ██║     ███████╗███████╗███████╗   ██║
// ╚═╝     ╚══════╝╚══════╝╚══════╝   ╚═╝
//
// ███████╗██╗   ██╗██████╗  ██████╗ ███████╗
// ██╔════╝██║   ██║██╔══██╗██╔════╝ ██╔════╝
// ███████╗██║   ██║██████╔╝██║  ███╗█████╗
// ╚════██║██║   ██║██╔══██╗██║   ██║██╔══╝
// ███████║╚██████╔╝██║  ██║╚██████╔╝███████╗
// ╚══════╝ ╚═════╝ ╚═╝  ╚═╝ ╚═════╝ ╚══════╝
//
// E N G I N E
//
// The most thorough way ever devised to find out how many fake temperature
// sensors a ThingsBoard broker can take before it starts crying.
// Rust + Tokio + rumqttc + one very opinionated metrics ledger.

mod classify;
mod config;
mod dashboard;
mod global_metrics;
mod metrics;
mod models;
mod orchestrator;
mod provision;
mod ramp;
mod reporter;
mod shard;
mod sinks;
mod stop;
mod tokens;
mod worker;

use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

fn print_banner() {
    let banner = r#"
    ╔══════════════════════════════════════════════════════════════════╗
    ║                                                                  ║
    ║        ⚡ F L E E T   S U R G E   E N G I N E ⚡                 ║
    ║                                                                  ║
    ║   Target:   any ThingsBoard-compatible MQTT broker               ║
    ║   Fleet:    hundreds to thousands of simulated devices           ║
    ║   Metrics:  latency percentiles | throughput | collapse time     ║
    ║   Topology: single process, or shards + global aggregator        ║
    ║                                                                  ║
    ║   "A thousand devices walk into a broker."                       ║
    ║                                                                  ║
    ╚══════════════════════════════════════════════════════════════════╝
    "#;
    println!("{banner}");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    // A .env file is optional; not everyone has their life together.
    let _ = dotenvy::dotenv();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = Config::parse();
    if let Err(error) = config.validate() {
        eprintln!("configuration error: {error}");
        return ExitCode::from(1);
    }

    if !config.worker {
        print_banner();
    }

    if config.provision {
        let device_count = if config.device_count > 0 {
            config.device_count
        } else {
            config.count.unwrap_or(0)
        };
        if device_count == 0 {
            eprintln!("configuration error: --provision requires --device-count or --count");
            return ExitCode::from(1);
        }
        let settings = provision::ProvisionSettings {
            base_url: config.tb_url.clone().unwrap_or_default(),
            username: config.tb_username.clone().unwrap_or_default(),
            password: config.tb_password.clone().unwrap_or_default(),
            device_prefix: config.device_prefix.clone(),
            device_count,
            device_label: config.device_label.clone(),
            device_type: config.device_type.clone(),
            device_profile_id: config.device_profile_id.clone(),
        };
        match provision::provision_fleet(&settings).await {
            Ok(tokens_map) => {
                if let Err(error) = provision::write_tokens_file(&config.tokens_file, &tokens_map)
                {
                    eprintln!("provisioning failed: {error}");
                    return ExitCode::from(2);
                }
                info!(
                    path = %config.tokens_file.display(),
                    devices = tokens_map.len(),
                    "token store written"
                );
            }
            Err(error) => {
                eprintln!("provisioning failed: {error}");
                return ExitCode::from(2);
            }
        }
    }

    let outcome = if config.worker {
        shard::run_shard(&config).await.map(|()| 0)
    } else {
        orchestrator::run(&config).await
    };

    match outcome {
        Ok(0) => {
            info!("fleet surge engine: offline");
            ExitCode::SUCCESS
        }
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
