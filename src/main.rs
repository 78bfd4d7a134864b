use std::error::Error;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use stream_migration::config::env;
use stream_migration::{
    AddressBinding, MigrationConfig, SessionConfig, Simulation, SimulationConfig,
};
use tracing::{info, warn};

/// Runtime knobs, overridable through the environment.
#[derive(Debug, Clone)]
struct Settings {
    max_bytes: u64,
    chunk_size: usize,
    first_change_at: Option<Duration>,
    stop_at: Option<Duration>,
    json: bool,
}

impl Settings {
    fn from_env() -> Self {
        let defaults = SessionConfig::default();
        let json = match std::env::var(env::REPORT_ENV) {
            Ok(format) if format.eq_ignore_ascii_case("json") => true,
            Ok(format) if format.eq_ignore_ascii_case("text") => false,
            Ok(format) => {
                warn!(key = env::REPORT_ENV, %format, "unknown report format, using text");
                false
            }
            Err(_) => false,
        };

        Self {
            max_bytes: env::parsed(env::MAX_BYTES_ENV).unwrap_or(defaults.max_transfer_bytes()),
            chunk_size: env::parsed(env::CHUNK_SIZE_ENV).unwrap_or(defaults.send_chunk_size()),
            first_change_at: env::seconds(env::FIRST_IP_CHANGE_ENV),
            stop_at: env::seconds(env::STOP_AT_ENV),
            json,
        }
    }
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

/// Two clients on their own subnets, each hopping from .1 to .3 and back.
fn build(settings: &Settings) -> Result<Simulation, Box<dyn Error + Send + Sync>> {
    let session = SessionConfig::default()
        .with_max_transfer_bytes(settings.max_bytes)
        .with_send_chunk_size(settings.chunk_size)
        .with_echo(false);

    let mut config = SimulationConfig::default().with_server(
        SessionConfig::default()
            .with_max_transfer_bytes(settings.max_bytes)
            .with_send_chunk_size(settings.chunk_size),
    );
    if let Some(stop_at) = settings.stop_at {
        config = config.with_stop_at(stop_at);
    }

    let mut migration = MigrationConfig::default();
    if let Some(at) = settings.first_change_at {
        migration = migration.with_first_change_at(at);
    }

    let mut sim = Simulation::new(config);
    for (subnet, interface) in [(1u8, 1u32), (2, 1)] {
        let client = sim.add_client(
            session.clone(),
            AddressBinding::new(interface, v4(10, 1, subnet, 1)),
        );
        sim.add_migration(client, v4(10, 1, subnet, 3), &migration)?;
    }
    Ok(sim)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    info!(?settings, "starting migration run");

    let mut sim = build(&settings)?;
    let stop = sim.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            stop.raise();
        }
    });

    let report = tokio::task::spawn_blocking(move || {
        sim.start()?;
        Ok::<_, stream_migration::SessionError>(sim.run())
    })
    .await??;

    if settings.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}
