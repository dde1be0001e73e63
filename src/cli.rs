use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "llm-perf")]
#[command(author, version, about = "Track latency and throughput of streamed LLM completions", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    pub config: PathBuf,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_required() {
        assert!(Cli::try_parse_from(["llm-perf"]).is_err());

        let cli = Cli::try_parse_from(["llm-perf", "run.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("run.toml"));
    }
}
