use clap::Parser;

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "dxstream")]
#[command(version = "0.1.0")]
#[command(about = "Stream DXTrade market data and portfolio events", long_about = None)]
pub struct Cli {
    /// Directory holding default.toml and environment overrides
    #[arg(short, long, default_value = "config")]
    pub config_dir: String,

    /// Symbols to subscribe (comma separated); defaults to the configured list
    #[arg(short, long, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Stop after this many seconds (runs until Ctrl-C when unset)
    #[arg(short, long)]
    pub duration_secs: Option<u64>,

    /// Skip the market data feed
    #[arg(long)]
    pub no_market_data: bool,

    /// Skip the portfolio feed
    #[arg(long)]
    pub no_portfolio: bool,

    /// Emit logs as JSON
    #[arg(long, env = "DXSTREAM_JSON_LOGS")]
    pub json_logs: bool,

    /// Print every raw inbound frame at debug level
    #[arg(long)]
    pub raw: bool,
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply(&self, config: &mut AppConfig) {
        if !self.symbols.is_empty() {
            config.dxtrade.symbols = self.symbols.clone();
        }
        if self.no_market_data {
            config.dxtrade.enable_market_data = false;
        }
        if self.no_portfolio {
            config.dxtrade.enable_portfolio = false;
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_applied() {
        let cli = Cli::parse_from([
            "dxstream",
            "--symbols",
            "EUR/USD,USD/JPY",
            "--no-portfolio",
            "--duration-secs",
            "5",
        ]);
        let mut config = AppConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.dxtrade.symbols, vec!["EUR/USD", "USD/JPY"]);
        assert!(config.dxtrade.enable_market_data);
        assert!(!config.dxtrade.enable_portfolio);
        assert_eq!(cli.duration_secs, Some(5));
    }

    #[test]
    fn test_defaults_keep_config() {
        let cli = Cli::parse_from(["dxstream"]);
        let mut config = AppConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.dxtrade.symbols.len(), 2);
        assert!(config.dxtrade.enable_portfolio);
        assert_eq!(cli.config_dir, "config");
    }
}
