//! CLI argument parsing
//!
//! A single binary with a small operational surface: the config path, a
//! verbosity switch, and auxiliary maintenance commands that run and exit.

use clap::Parser;

/// Default configuration file location on the printer host
pub const DEFAULT_CONFIG_PATH: &str = "/home/mingda/feeder_cabinet_help/config/config.yaml";

/// Arguments shared by the run mode and the auxiliary commands
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config_file: String,

    /// Log at DEBUG level regardless of the configured level
    #[arg(short, long)]
    pub verbose: bool,
}

/// feeder-hub: automatic filament refill bridge
#[derive(Parser, Debug)]
#[command(name = "feeder-hub", about = "Bridge between Klipper and the filament feeder cabinet")]
pub struct HubArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Validate the configuration file and exit
    #[arg(long)]
    pub check_config: bool,

    /// Initialize components but do not start the bridge
    #[arg(long)]
    pub dry_run: bool,

    /// Print log directory statistics and exit
    #[arg(long)]
    pub log_stats: bool,

    /// Move old log files into the archive directory and exit
    #[arg(long)]
    pub archive_logs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_path() {
        let args = HubArgs::try_parse_from(["feeder-hub"]).unwrap();
        assert_eq!(args.common.config_file, DEFAULT_CONFIG_PATH);
        assert!(!args.common.verbose);
        assert!(!args.check_config);
        assert!(!args.dry_run);
    }

    #[test]
    fn custom_config_short_flag() {
        let args = HubArgs::try_parse_from(["feeder-hub", "-c", "/tmp/hub.yaml"]).unwrap();
        assert_eq!(args.common.config_file, "/tmp/hub.yaml");
    }

    #[test]
    fn custom_config_long_flag() {
        let args =
            HubArgs::try_parse_from(["feeder-hub", "--config", "/etc/feeder/hub.yaml"]).unwrap();
        assert_eq!(args.common.config_file, "/etc/feeder/hub.yaml");
    }

    #[test]
    fn verbose_flag() {
        let args = HubArgs::try_parse_from(["feeder-hub", "--verbose"]).unwrap();
        assert!(args.common.verbose);
    }

    #[test]
    fn auxiliary_commands() {
        let args = HubArgs::try_parse_from(["feeder-hub", "--check-config"]).unwrap();
        assert!(args.check_config);

        let args = HubArgs::try_parse_from(["feeder-hub", "--dry-run"]).unwrap();
        assert!(args.dry_run);

        let args = HubArgs::try_parse_from(["feeder-hub", "--log-stats"]).unwrap();
        assert!(args.log_stats);

        let args = HubArgs::try_parse_from(["feeder-hub", "--archive-logs"]).unwrap();
        assert!(args.archive_logs);
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(HubArgs::try_parse_from(["feeder-hub", "--frobnicate"]).is_err());
    }
}
