// envshield - Short-lived credential injection with guaranteed cleanup
//
// This is the main entry point for the application.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use envshield::cleaner::{install_shutdown_hook, HostSignal, HostSignals, SIGNAL_EXIT_CODE};
use envshield::cleanup::{CleanupManager, CleanupType};
use envshield::config::{EngineConfig, ItemFormat, ItemKind};
use envshield::configuration::{ConfigurationManager, Severity};
use envshield::injector;
use envshield::process::{ProcessEvent, ProcessEventSource, ProcessMonitor};
use envshield::snapshot::EngineSnapshot;
use envshield::trigger::CleanupTrigger;
use envshield::vault::SecureStore;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// envshield - Short-lived credential injection with guaranteed cleanup
#[derive(Parser, Debug)]
#[command(name = "envshield")]
#[command(version)]
#[command(about = "Run a CLI tool with short-lived credentials that are wiped on every exit path", long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check configuration, credentials in the environment and the wrapped tool
    Doctor {
        /// Path to the configuration file (default: envshield.yaml)
        #[arg(short, long, default_value = "envshield.yaml")]
        config: PathBuf,
    },

    /// Inject credentials, run the tool, and clean up when it ends
    Run {
        /// Path to the configuration file (default: envshield.yaml)
        #[arg(short, long, default_value = "envshield.yaml")]
        config: PathBuf,

        /// Endpoint URL to inject alongside the token
        #[arg(long)]
        base_url: Option<String>,

        /// Read the token from this environment variable (then unset it)
        /// instead of prompting
        #[arg(long)]
        token_env: Option<String>,

        /// Terminate the tool and clean up after this many minutes
        #[arg(long)]
        timeout_minutes: Option<u64>,

        /// Arguments passed through to the tool
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Run one complete cleanup (store, environment, configured files)
    Clear {
        /// Path to the configuration file (default: envshield.yaml)
        #[arg(short, long, default_value = "envshield.yaml")]
        config: PathBuf,
    },

    /// Show the last saved engine snapshot
    Status {
        /// Path to the configuration file (default: envshield.yaml)
        #[arg(short, long, default_value = "envshield.yaml")]
        config: PathBuf,
    },
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let config = EngineConfig::from_file_or_default(path)
        .with_context(|| format!("Failed to load config from: {}", path.display()))?;
    config
        .validate()
        .with_context(|| "Configuration validation failed")?;
    Ok(config)
}

fn severity_icon(severity: Severity) -> &'static str {
    match severity {
        Severity::Ok => "✓",
        Severity::Warning => "⚠️ ",
        Severity::Error | Severity::Fatal => "✗",
    }
}

async fn run_doctor(config_path: &Path) -> Result<()> {
    println!("🔍 envshield Doctor");
    println!("Loading configuration from: {}\n", config_path.display());

    let config = Arc::new(load_config(config_path)?);
    println!("✓ Configuration loaded and validated");

    // Check whatever is already exported, without applying anything.
    let store = Arc::new(SecureStore::new());
    let manager = ConfigurationManager::new(Arc::clone(&config), store);
    {
        let env = injector::lock();
        for item in &config.items {
            if let Some(value) = env.get(&item.env) {
                let result = match item.kind {
                    ItemKind::Secret => manager.set_secret(&item.key, value.as_bytes()),
                    ItemKind::Plain => manager.set_plain(&item.key, value.as_bytes()),
                };
                if !result.success {
                    println!("   ❌ {}", result.message);
                }
            }
        }
    }

    let report = manager.health_check().await;
    println!();
    for check in &report.checks {
        println!("{} {}: {}", severity_icon(check.severity), check.key, check.message);
    }

    println!();
    println!("Health score: {} ({:?})", report.score, report.status);
    if report.checks.iter().all(|check| check.severity < Severity::Error) {
        println!("✅ All checks passed! Your system is ready.");
        Ok(())
    } else {
        println!("❌ Some checks failed. Please fix the issues above.");
        Err(anyhow::anyhow!("Doctor checks failed"))
    }
}

fn read_token(token_env: Option<&str>) -> Result<Zeroizing<String>> {
    if let Some(name) = token_env {
        let env = injector::lock();
        let token = env
            .get(name)
            .with_context(|| format!("Environment variable {} is not set", name))?;
        // The source variable would otherwise outlive the session.
        env.unset(name);
        return Ok(token);
    }

    if !std::io::stdin().is_terminal() {
        bail!("No token supplied: use --token-env or run interactively");
    }
    let token = dialoguer::Password::new()
        .with_prompt("API token")
        .interact()
        .context("Failed to read token")?;
    Ok(Zeroizing::new(token))
}

async fn run_tool(
    config_path: &Path,
    base_url: Option<String>,
    token_env: Option<String>,
    timeout_minutes: Option<u64>,
    args: Vec<String>,
) -> Result<i32> {
    let config = Arc::new(load_config(config_path)?);
    let token = read_token(token_env.as_deref())?;

    let store = Arc::new(SecureStore::new());
    let signals = HostSignals::new();
    install_shutdown_hook(&signals, Arc::clone(&store), config.known_env_vars());

    let configuration = Arc::new(ConfigurationManager::new(
        Arc::clone(&config),
        Arc::clone(&store),
    ));

    // Step 1: Store credentials
    let token_item = config
        .items
        .iter()
        .find(|item| item.kind == ItemKind::Secret)
        .context("Configuration defines no secret item for the token")?;
    let result = configuration.set_secret(&token_item.key, token.as_bytes());
    drop(token);
    if !result.success {
        bail!("{}", result.message);
    }
    if let Some(url) = base_url {
        let url_item = config
            .items
            .iter()
            .find(|item| item.format == ItemFormat::Url)
            .context("Configuration defines no URL item for --base-url")?;
        let result = configuration.set_plain(&url_item.key, url);
        if !result.success {
            bail!("{}", result.message);
        }
    }

    // Step 2: Validate
    let report = configuration.validate();
    for check in report.warnings() {
        eprintln!("⚠️  {}: {}", check.key, check.message);
    }
    if !report.is_valid() {
        for check in report.errors() {
            eprintln!("❌ {}: {}", check.key, check.message);
        }
        configuration.clear();
        bail!("Credential validation failed");
    }

    // Step 3: Apply
    let applied = configuration.apply();
    if !applied.success {
        configuration.rollback();
        bail!(
            "{}{}",
            applied.message,
            applied
                .cause
                .map(|cause| format!(": {}", cause))
                .unwrap_or_default()
        );
    }
    eprintln!("✓ Injected {} variable(s)", applied.items);

    // Step 4: Wire up monitoring and cleanup
    let monitor = ProcessMonitor::new(config.trigger.poll_interval());
    monitor.start();
    let trigger = CleanupTrigger::new(
        config.trigger.clone(),
        Arc::new(monitor.clone()),
        signals.clone(),
    );
    let cleanup = CleanupManager::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Some(Arc::clone(&configuration)),
    );
    cleanup.bind_trigger(&trigger);
    trigger.start()?;

    let mut process_events = monitor.subscribe();
    let mut host_signals = signals.subscribe();

    // Step 5: Run the tool
    let tool = &config.tool.command;
    let child = match tokio::process::Command::new(tool).args(&args).spawn() {
        Ok(child) => child,
        Err(e) => {
            trigger.stop();
            monitor.stop();
            cleanup.shutdown().await;
            return Err(e).with_context(|| format!("Failed to start '{}'", tool));
        }
    };
    let pid = monitor.watch_child(child, tool);
    if let Some(pid) = pid {
        let timeout = timeout_minutes.map(|minutes| Duration::from_secs(minutes * 60));
        trigger.register_process(pid, tool, timeout)?;
    }

    let exit_code = loop {
        tokio::select! {
            received = process_events.recv() => match received {
                Ok(ProcessEvent::Exited(info)) | Ok(ProcessEvent::Killed(info))
                    if Some(info.pid) == pid =>
                {
                    break info.exit_code.unwrap_or(1);
                }
                Ok(_) => {}
                Err(_) if pid.is_none() => break 0,
                Err(_) => {}
            },
            received = host_signals.recv() => match received {
                Ok(HostSignal::Shutdown { .. }) => break SIGNAL_EXIT_CODE,
                Ok(HostSignal::Fault { .. }) => break 1,
                Err(_) => {}
            },
        }
    };

    // Step 6: Final cleanup
    trigger.stop();
    monitor.stop();
    match cleanup.shutdown().await {
        Some(result) if result.success => eprintln!(
            "🧹 Cleanup complete: {} variable(s), {} byte(s), {} file(s)",
            result.variables_cleared, result.bytes_released, result.files_deleted
        ),
        Some(result) => eprintln!(
            "⚠️  Cleanup incomplete: {} item(s) failed",
            result.failures().count()
        ),
        None => eprintln!("⚠️  Final cleanup did not complete"),
    }

    save_snapshot(&config, &configuration, &cleanup);
    Ok(exit_code)
}

fn save_snapshot(config: &EngineConfig, configuration: &ConfigurationManager, cleanup: &CleanupManager) {
    let Some(path) = config.snapshot.resolved_path() else {
        return;
    };
    // Counters accumulate across runs.
    if let Some(previous) = EngineSnapshot::load(&path) {
        cleanup.seed_statistics(&previous.statistics);
    }
    let snapshot = EngineSnapshot::new(
        configuration.state(),
        configuration.history(),
        cleanup.statistics(),
    );
    if let Err(e) = snapshot.save(&path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to save engine snapshot");
    }
}

async fn run_clear(config_path: &Path) -> Result<()> {
    println!("🧹 envshield Clear");

    let config = Arc::new(load_config(config_path)?);
    let cleanup = CleanupManager::new(Arc::clone(&config), Arc::new(SecureStore::new()), None);
    let result = cleanup
        .execute_now(CleanupType::Complete, "manual clear")
        .await?;
    cleanup.shutdown().await;

    for item in &result.items {
        println!("  {} {:?}", item.target, item.outcome);
    }
    println!(
        "\n{} variable(s) cleared, {} file(s) deleted",
        result.variables_cleared, result.files_deleted
    );

    if result.success {
        println!("✅ Cleanup complete");
        Ok(())
    } else {
        Err(anyhow::anyhow!("Cleanup incomplete"))
    }
}

fn run_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let path = config
        .snapshot
        .resolved_path()
        .context("Could not determine snapshot location")?;

    let Some(snapshot) = EngineSnapshot::load(&path) else {
        println!("No snapshot found at {}", path.display());
        return Ok(());
    };

    let stats = &snapshot.statistics;
    println!("📊 envshield Status ({})", path.display());
    println!("Saved at:      {}", snapshot.saved_at);
    println!("State:         {}", snapshot.state);
    println!(
        "Cleanups:      {} executed, {} succeeded, {} failed, {} cancelled",
        stats.executed, stats.succeeded, stats.failed, stats.cancelled
    );
    println!("Success rate:  {:.0}%", stats.success_rate * 100.0);
    if let Some(last) = stats.last_cleanup {
        println!("Last cleanup:  {}", last);
    }
    if let Some(transition) = snapshot.transitions.last() {
        println!(
            "Last change:   {} -> {} ({})",
            transition.from, transition.to, transition.reason
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    envshield::logging::init(cli.verbose);

    match cli.command {
        Commands::Doctor { config } => {
            if let Err(e) = run_doctor(&config).await {
                eprintln!("\nError: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Run {
            config,
            base_url,
            token_env,
            timeout_minutes,
            args,
        } => match run_tool(&config, base_url, token_env, timeout_minutes, args).await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("\nError: {:#}", e);
                eprintln!("💡 Run 'envshield doctor' to check your configuration.");
                std::process::exit(1);
            }
        },
        Commands::Clear { config } => {
            if let Err(e) = run_clear(&config).await {
                eprintln!("\nError: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Status { config } => {
            if let Err(e) = run_status(&config) {
                eprintln!("\nError: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
