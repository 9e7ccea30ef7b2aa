use std::io::IsTerminal;

use clap::ValueEnum;
use iccom_engine::StatsSnapshot;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Text
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct StatsOutput<'a> {
    side: &'a str,
    statistics: &'a StatsSnapshot,
}

pub fn print_stats(side: &str, stats: &StatsSnapshot, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = StatsOutput {
                side,
                statistics: stats,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Text => {
            println!("====== {side} statistics ======");
            println!("{stats}");
        }
    }
}
