//! Pinctl CLI - GPIO 命令行工具

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use pinctl_core::ControllerConfig;
use pinctl_gpio::PinEventTypes;

mod pin_cmd;

#[derive(Parser)]
#[command(name = "pinctl")]
#[command(about = "Inspect and drive GPIO lines through the character device", long_about = None)]
#[command(version)]
struct Cli {
    /// GPIO chip index (/dev/gpiochipN)
    #[arg(long, global = true)]
    chip: Option<u32>,
    /// Consumer label attached to line requests
    #[arg(long, global = true)]
    consumer: Option<String>,
    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Use an in-process simulated chip with this many lines
    #[arg(long, global = true, value_name = "LINES")]
    simulate: Option<u32>,
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show chip index and pin count
    Info,
    /// Read a pin as input
    Read {
        pin: u32,
    },
    /// Drive a pin as output
    Write {
        pin: u32,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        value: u8,
    },
    /// Invert the level of an output pin
    Toggle {
        pin: u32,
    },
    /// Block until an edge occurs on a pin
    Wait {
        pin: u32,
        #[arg(long, value_enum, default_value = "both")]
        edge: Edge,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Edge {
    Rising,
    Falling,
    Both,
}

impl From<Edge> for PinEventTypes {
    fn from(edge: Edge) -> Self {
        match edge {
            Edge::Rising => PinEventTypes::RISING,
            Edge::Falling => PinEventTypes::FALLING,
            Edge::Both => PinEventTypes::BOTH,
        }
    }
}

impl Cli {
    fn controller_config(&self) -> Result<ControllerConfig> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(ControllerConfig::default_path);
        let mut config = ControllerConfig::load(&path)?;

        if let Some(chip) = self.chip {
            config.chip_index = chip;
        }
        if let Some(consumer) = &self.consumer {
            config.consumer = consumer.clone();
        }
        config.validate()?;

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    pinctl_core::logging::init(if cli.verbose { "pinctl=debug,info" } else { "warn" });

    let config = cli.controller_config()?;
    let gpio = pin_cmd::open_controller(config, cli.simulate)?;

    match cli.command {
        Commands::Info => pin_cmd::info(&gpio)?,
        Commands::Read { pin } => pin_cmd::read(&gpio, pin)?,
        Commands::Write { pin, value } => pin_cmd::write(&gpio, pin, value.into())?,
        Commands::Toggle { pin } => pin_cmd::toggle(&gpio, pin)?,
        Commands::Wait {
            pin,
            edge,
            timeout_ms,
        } => {
            pin_cmd::wait(
                gpio,
                pin,
                edge.into(),
                timeout_ms.map(std::time::Duration::from_millis),
            )
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wait() {
        let cli = Cli::try_parse_from([
            "pinctl", "--simulate", "8", "wait", "3", "--edge", "rising", "--timeout-ms", "50",
        ])
        .unwrap();

        assert_eq!(cli.simulate, Some(8));
        match cli.command {
            Commands::Wait {
                pin,
                edge,
                timeout_ms,
            } => {
                assert_eq!(pin, 3);
                assert_eq!(edge, Edge::Rising);
                assert_eq!(timeout_ms, Some(50));
            }
            _ => panic!("expected wait command"),
        }
    }

    #[test]
    fn test_write_value_range() {
        assert!(Cli::try_parse_from(["pinctl", "write", "1", "1"]).is_ok());
        assert!(Cli::try_parse_from(["pinctl", "write", "1", "2"]).is_err());
    }

    #[test]
    fn test_edge_mapping() {
        assert_eq!(PinEventTypes::from(Edge::Both), PinEventTypes::BOTH);
        assert_eq!(PinEventTypes::from(Edge::Falling), PinEventTypes::FALLING);
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "pinctl",
            "--config",
            "/nonexistent/pinctl.json",
            "--chip",
            "2",
            "--consumer",
            "relay-board",
            "info",
        ])
        .unwrap();

        let config = cli.controller_config().unwrap();
        assert_eq!(config.chip_index, 2);
        assert_eq!(config.consumer, "relay-board");
    }
}
