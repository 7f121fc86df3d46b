use anyhow::Context;
use clap::{Parser, Subcommand};
use ferry::{
    MigrationCoordinator, Vm,
    address,
    config::FerryConfig,
    downtime::{exponential_downtime, linear_downtime},
    hypervisor::MigrationParams,
    logger,
    virsh::VirshHypervisor,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Live migration orchestration for virtualization hosts")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Live migrate a libvirt domain to another host
    Migrate {
        /// Domain name
        vm: String,
        /// Destination host, optionally with :port
        #[arg(long)]
        dest: String,
        /// Destination management port
        #[arg(long)]
        port: Option<u16>,
        /// libvirt URI of the local hypervisor
        #[arg(long)]
        connect: Option<String>,
        /// Incoming migrations the destination may already run
        #[arg(long, default_value_t = 2)]
        max_incoming: u32,
        /// Print status updates as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the downtime schedule a migration would follow
    Schedule {
        /// Target downtime in milliseconds
        #[arg(long)]
        downtime: Option<u64>,
        /// Number of steps
        #[arg(long)]
        steps: Option<u32>,
    },
    /// Canonicalize a destination address
    Resolve {
        /// Host, optionally with :port. Omit for this host.
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "ferry=debug");
        }
    }
    logger::init_logger();

    let config_path = cli.config.clone().unwrap_or_else(FerryConfig::default_path);
    let config = if config_path.exists() {
        FerryConfig::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        logger::warn!(
            "Configuration not found at {}, using defaults",
            config_path.display()
        );
        FerryConfig::default()
    };

    match cli.command {
        Commands::Migrate {
            vm,
            dest,
            port,
            connect,
            max_incoming,
            json,
        } => {
            let hypervisor = Arc::new(
                VirshHypervisor::new(&vm, config.migration.migration_uri_scheme.clone())
                    .with_connect_uri(connect)
                    .with_max_incoming(max_incoming),
            );

            let status = hypervisor.domain_status().await?;
            let mem_size_mb = hypervisor.memory_mb().await?;
            let record = Vm::new(&vm, mem_size_mb, status);

            let params = MigrationParams {
                vm_id: record.id().to_string(),
                vm_name: vm.clone(),
                dst: Some(dest),
                dst_port: port.map(serde_json::Value::from),
                mem_size_mb,
                ..Default::default()
            };

            let coordinator = Arc::new(MigrationCoordinator::new(
                record,
                hypervisor,
                params,
                config.migration.clone(),
            ));
            println!("Migration {} started for VM '{}'", coordinator.job_id(), vm);

            let runner = Arc::clone(&coordinator);
            let mut run = tokio::spawn(async move { runner.run().await });
            let mut ticker = tokio::time::interval(Duration::from_secs(1));

            let result = loop {
                tokio::select! {
                    joined = &mut run => break joined.context("migration task panicked")?,
                    _ = tokio::signal::ctrl_c() => {
                        if let Err(e) = coordinator.cancel() {
                            println!("⚠️  Cannot cancel: {}", e);
                        }
                    }
                    _ = ticker.tick() => {
                        let stat = coordinator.get_stat();
                        if json {
                            println!("{}", serde_json::to_string(&stat)?);
                        } else {
                            println!(
                                "{:?} {:>3}% -> {} (attempts: {}, post-copy: {:?})",
                                stat.status,
                                stat.progress,
                                stat.destination,
                                stat.attempt_count,
                                stat.post_copy
                            );
                        }
                    }
                }
            };

            let stat = coordinator.get_stat();
            match result {
                Ok(()) => println!("✅ VM '{}' migrated to {}", vm, stat.destination),
                Err(e) => {
                    println!("❌ Migration of VM '{}' {:?} at {}%: {}", vm, stat.status, stat.progress, e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Schedule { downtime, steps } => {
            let downtime = downtime.unwrap_or(config.migration.migration_downtime);
            let steps = steps.unwrap_or(config.migration.migration_downtime_steps);
            anyhow::ensure!(steps > 0, "steps must be at least 1");

            println!("{:<6} {:>10} {:>10}", "STEP", "DOWNTIME", "LINEAR");
            println!("{}", "=".repeat(28));
            for (i, value) in exponential_downtime(downtime, steps).iter().enumerate() {
                let linear = linear_downtime(downtime, steps, i as u32);
                println!("{:<6} {:>8}ms {:>8}ms", i + 1, value, linear);
            }
        }
        Commands::Resolve { host, port } => {
            let port = port.unwrap_or(config.migration.management_port);
            let has_port = host
                .as_deref()
                .is_some_and(|h| matches!(address::split_host_port(h), Ok(Some(_))));
            let resolved = address::canonicalize(host.as_deref(), (!has_port).then_some(port))?;
            println!("{}", resolved);
        }
        Commands::ShowConfig => {
            println!("# {}", config_path.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
