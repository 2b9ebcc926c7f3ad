use clap::{Parser, Subcommand};
use netgate::capture::MemoryIo;
use netgate::config;
use netgate::telemetry::init_logging;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "netgate")]
#[command(about = "Software router data plane: routing, NAT, firewall, QoS and IDS")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate config.toml
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run captured packets through the data plane
    Replay {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// One hex-encoded IP packet per line
        #[arg(short, long)]
        input: PathBuf,

        /// Interface the packets arrived on
        #[arg(long, default_value = "eth0")]
        ingress: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Replay {
            config,
            input,
            ingress,
        } => cmd_replay(&config, &input, ingress),
    };

    if let Err(e) = outcome {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_validate(config_path: &PathBuf) -> Result<(), String> {
    init_logging(None);

    let cfg = config::load(config_path).map_err(|e| e.to_string())?;
    let result = config::validate(&cfg);
    result.print_diagnostics();

    if result.has_errors() {
        return Err(format!(
            "{} has {} error(s)",
            config_path.display(),
            result.errors.len()
        ));
    }

    println!(
        "{} is valid ({} warning(s))",
        config_path.display(),
        result.warnings.len()
    );
    Ok(())
}

fn cmd_replay(config_path: &PathBuf, input: &PathBuf, ingress: String) -> Result<(), String> {
    use tokio::runtime::Runtime;
    use tokio::sync::watch;

    let cfg = config::load(config_path).map_err(|e| e.to_string())?;
    init_logging(Some(&cfg.logging));

    let batch = cfg.dataplane.egress_batch();
    let idle = cfg.dataplane.egress_idle();
    let interval = cfg.dataplane.maintenance_interval();
    let flow_timeout = cfg.dataplane.flow_timeout();
    let dataplane = Arc::new(
        config::compile(&cfg)
            .map_err(|e| e.to_string())?
            .into_dataplane(),
    );

    let text = std::fs::read_to_string(input)
        .map_err(|e| format!("Failed to read {}: {}", input.display(), e))?;
    let io = Arc::new(MemoryIo::from_hex_lines(ingress, &text).map_err(|e| e.to_string())?);
    info!(packets = io.pending(), "replaying {}", input.display());

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async {
        let (done_tx, done_rx) = watch::channel(false);

        let egress = {
            let dataplane = dataplane.clone();
            let io = io.clone();
            let done = done_rx.clone();
            tokio::spawn(async move { dataplane.run_egress(&*io, done, batch, idle).await })
        };

        let maintenance = {
            let dataplane = dataplane.clone();
            let done = done_rx.clone();
            tokio::spawn(async move {
                dataplane
                    .run_maintenance(done, interval, flow_timeout)
                    .await
            })
        };

        dataplane
            .run_ingest(&*io, done_rx)
            .await
            .map_err(|e| e.to_string())?;

        // Let rate-limited classes drain before stopping egress
        while dataplane.qos.total_queued() > 0 {
            tokio::time::sleep(idle).await;
        }
        let _ = done_tx.send(true);

        egress
            .await
            .map_err(|e| format!("egress task failed: {}", e))?
            .map_err(|e| e.to_string())?;
        maintenance
            .await
            .map_err(|e| format!("maintenance task failed: {}", e))?;
        Ok::<(), String>(())
    })?;

    print_report(&dataplane, &io);
    Ok(())
}

fn print_report(dataplane: &netgate::pipeline::Dataplane, io: &MemoryIo) {
    let mut per_egress: BTreeMap<String, usize> = BTreeMap::new();
    for written in io.written() {
        *per_egress.entry(written.egress).or_default() += 1;
    }

    println!("packets read:    {}", io.handed_out());
    println!("packets written: {}", io.written().len());
    for (egress, count) in &per_egress {
        let name = if egress.is_empty() { "(unrouted)" } else { egress.as_str() };
        println!("  {:<14} {}", name, count);
    }

    let alerts = dataplane.ids.alerts();
    if !alerts.is_empty() {
        println!("alerts:");
        for alert in alerts {
            println!(
                "  {} [{:?}] {} {:?}:{} -> {:?}:{}",
                alert.kind,
                alert.severity,
                alert.reason,
                alert.src_ip,
                alert.src_port,
                alert.dst_ip,
                alert.dst_port
            );
        }
    }

    println!("metrics:");
    for (name, value) in dataplane.metrics.export() {
        if value > 0 {
            println!("  {:<24} {}", name, value);
        }
    }
}
