use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Cli {
    /// Path to the controller's YAML configuration file.
    #[arg(short, long, default_value_t = String::from("/etc/overlay-controller/config.yaml"))]
    config: String,

    /// Print the resolved configuration and exit without starting the server.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Parses command line arguments.
    pub fn init() -> Self {
        Self::parse()
    }

    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(&self.config)
    }

    pub fn print_config(&self) -> bool {
        self.print_config
    }
}
