//! Command-line arguments.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "rack-assetd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Rack asset monitor for IPMI chassis managers", long_about = None)]
pub struct Args {
    // === Configuration ===
    /// Config file (default: config.json next to the executable)
    #[arg(short = 'c', long, value_name = "PATH", help_heading = "Configuration")]
    pub config: Option<String>,

    /// Write a default config file and exit
    #[arg(long = "init-config", value_name = "PATH", help_heading = "Configuration")]
    pub init_config: Option<String>,

    /// Load and validate the config, then exit
    #[arg(long, help_heading = "Configuration")]
    pub check: bool,

    // === Logging ===
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL)
    #[arg(short = 'l', long = "log-level", help_heading = "Logging")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", help_heading = "Logging")]
    pub log_json: bool,

    // === Diagnostics ===
    /// Print the operation table with effective timeouts and exit
    #[arg(long = "print-table", help_heading = "Diagnostics")]
    pub print_table: bool,

    /// Run one scheduling round per chassis manager, then exit
    #[arg(long, help_heading = "Diagnostics")]
    pub once: bool,
}
