//! Gamemode Governor - command line entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gamemode_governor::AmbientMode;

#[derive(Parser)]
#[command(name = "gamemode-governor")]
#[command(about = "Foreground-aware resource governor with a reversible game mode", long_about = None)]
struct Cli {
    /// Governor settings (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Name-set document (JSON)
    #[arg(long, global = true)]
    names: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ambient governor until Ctrl+C or game mode starts
    Ambient {
        #[arg(short, long, default_value = "normal")]
        mode: AmbientMode,
    },

    /// Wait for a configured game, optimize for it, restore on exit
    Game,

    /// Show mode signal, memory, battery and core topology
    Status,

    /// Show configuration
    Config {
        /// Write the defaults to the configuration path
        #[arg(long)]
        init: bool,
    },

    /// Remove a mode signal left behind by a crashed game mode
    ClearSignal,
}

#[cfg(not(windows))]
fn main() {
    let _ = Cli::parse();
    eprintln!("gamemode-governor only runs on Windows");
    std::process::exit(1);
}

#[cfg(windows)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use gamemode_governor::windows::WindowsPlatform;
    use gamemode_governor::{
        core_counts, AmbientGovernor, ConfigurationStore, GameModeStateMachine, GovernorConfig, ModeSignalStore,
        PrivilegeManager,
    };
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tracing::info;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().unwrap_or_else(GovernorConfig::default_path);
    let mut config = GovernorConfig::load_or_default(&config_path)?;
    if let Some(names) = cli.names {
        config.names_path = names;
    }
    let signal = ModeSignalStore::new(config.signal_path.clone());

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down");
                token.cancel();
            }
        });
    }

    match cli.command {
        Commands::Ambient { mode } => {
            PrivilegeManager::new().require_elevated()?;
            let names = Arc::new(ConfigurationStore::new(config.names_path.clone()));
            let (logical, _) = core_counts();
            let governor = AmbientGovernor::new(WindowsPlatform::collaborators(), config, names, mode, logical);
            governor.run(token).await?;
        }

        Commands::Game => {
            PrivilegeManager::new().require_elevated()?;
            let names = Arc::new(ConfigurationStore::new(config.names_path.clone()));
            let mut machine = GameModeStateMachine::new(
                WindowsPlatform::collaborators(),
                names,
                signal,
                config.game_mode.clone(),
                core_counts(),
            )
            .with_launch_args([
                "--config".to_string(),
                config_path.display().to_string(),
                "--names".to_string(),
                config.names_path.display().to_string(),
            ]);
            match machine.run(&token).await {
                Some(report) => {
                    println!("Game mode finished:");
                    println!("  Processes restored: {}", report.restored_pids);
                    println!("  Services restarted: {}", report.services_restarted.len());
                    println!("  Shell relaunched:   {}", report.shell_relaunched);
                    if let Some(mode) = report.resumed_mode {
                        println!("  Resumed mode:       {}", mode);
                    }
                }
                None => println!("Cancelled before a game started"),
            }
        }

        Commands::Status => {
            use gamemode_governor::platform::{PowerControl, SystemTuning};

            let platform = WindowsPlatform::new();
            match signal.read() {
                Some(s) if s.is_game() => println!(
                    "Mode:      game ({} pid {})",
                    s.game_name.as_deref().unwrap_or("?"),
                    s.game_pid.map_or_else(|| "?".to_string(), |p| p.to_string())
                ),
                _ => println!("Mode:      idle"),
            }
            if let Ok(memory) = platform.memory_info() {
                println!("Memory:    {:.0}% used, {:.1} GiB available", memory.load_percent(), memory.available_gib());
            }
            if let Ok(battery) = platform.battery() {
                if battery.present {
                    println!(
                        "Battery:   {}% ({})",
                        battery.percent,
                        if battery.on_ac { "on AC" } else { "discharging" }
                    );
                } else {
                    println!("Battery:   none (desktop)");
                }
            }
            let (logical, physical) = core_counts();
            println!("Cores:     {} logical, {} physical", logical, physical);
            println!("Elevated:  {}", PrivilegeManager::new().can_govern());
        }

        Commands::Config { init } => {
            if init {
                config.save(&config_path)?;
                println!("Wrote defaults to {}", config_path.display());
            } else {
                println!("Current Configuration ({}):", config_path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }

        Commands::ClearSignal => {
            signal.clear()?;
            println!("Mode signal cleared ({})", signal.path().display());
        }
    }

    Ok(())
}
