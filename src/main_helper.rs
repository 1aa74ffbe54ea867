use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::DocumentSettings;
use crate::constants::OPENAI_BASE_URL;
use crate::conversation::CompletionType;
use crate::engine::EngineOptions;
use crate::logging::LoggingConfig;
use crate::mitigation::StrategyFilter;
use crate::provider::ClientOptions;
use crate::types::*;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    /// Send only the selected cell.
    Cell,
    /// Send the selected cell and everything above it.
    Above,
}

impl From<ModeArg> for CompletionType {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Cell => CompletionType::CurrentCellOnly,
            ModeArg::Above => CompletionType::CurrentCellAndAbove,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream chat completions into notebook cells", long_about = None)]
pub struct Args {
    /// Notebook JSON file to complete.
    pub notebook: PathBuf,
    /// Zero-based index of the cell to complete from.
    pub cell: usize,
    #[arg(long, value_enum, default_value_t = ModeArg::Above)]
    pub mode: ModeArg,
    /// Overrides the model stored in the notebook.
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long)]
    pub top_p: Option<f32>,
    #[arg(long)]
    pub max_tokens: Option<u32>,
    #[arg(long, allow_hyphen_values = true)]
    pub presence_penalty: Option<f32>,
    #[arg(long, allow_hyphen_values = true)]
    pub frequency_penalty: Option<f32>,
    #[arg(long, default_value = OPENAI_BASE_URL)]
    pub api_base: String,
    /// Falls back to OPENAI_API_KEY.
    #[arg(long)]
    pub api_key: Option<String>,
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    /// Tracing filter, overrides RUST_LOG.
    #[arg(long)]
    pub log_filter: Option<String>,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Hide reduction strategies that would not save anything.
    #[arg(long, default_value_t = false)]
    pub hide_unprofitable: bool,
    /// Resend up to N times when the reply is cut off by the length limit.
    #[arg(long, default_value_t = 0)]
    pub auto_continue: usize,
    #[arg(long, default_value_t = 8)]
    pub max_tool_rounds: usize,
    /// Answer every prompt with its default.
    #[arg(long, short = 'y', default_value_t = false)]
    pub yes: bool,
    /// Root for the file tools; defaults to the notebook's directory.
    #[arg(long)]
    pub workspace: Option<PathBuf>,
}

impl Args {
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            filter: self.log_filter.clone(),
            json: self.log_json,
            log_dir: self.log_dir.clone(),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_url: self.api_base.clone(),
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            mode: self.mode.into(),
            filter: if self.hide_unprofitable {
                StrategyFilter::HideUnprofitable
            } else {
                StrategyFilter::ShowAll
            },
            max_auto_continue: self.auto_continue,
            max_tool_rounds: self.max_tool_rounds,
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        if let Some(root) = &self.workspace {
            return root.clone();
        }
        match self.notebook.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Command-line overrides on top of the notebook's stored settings.
    pub fn apply_overrides(&self, settings: &mut DocumentSettings) -> Result<()> {
        if let Some(model) = &self.model {
            settings.model = Some(model.clone());
        }
        if let Some(t) = self.temperature {
            settings.request.set_temperature(t)?;
        }
        if let Some(p) = self.top_p {
            settings.request.set_top_p(p)?;
        }
        if let Some(m) = self.max_tokens {
            settings.request.set_max_tokens(m)?;
        }
        if let Some(p) = self.presence_penalty {
            settings.request.set_presence_penalty(p)?;
        }
        if let Some(p) = self.frequency_penalty {
            settings.request.set_frequency_penalty(p)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["cellstream", "nb.json", "2"]);
        assert_eq!(args.cell, 2);
        assert_eq!(args.workspace_root(), PathBuf::from("."));
        let opts = args.engine_options();
        assert_eq!(opts.mode, CompletionType::CurrentCellAndAbove);
        assert_eq!(opts.filter, StrategyFilter::ShowAll);
        assert_eq!(opts.max_auto_continue, 0);
        assert_eq!(args.client_options().base_url, OPENAI_BASE_URL);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "cellstream",
            "work/nb.json",
            "0",
            "--mode",
            "cell",
            "--model",
            "gpt-4",
            "--temperature",
            "0.7",
            "--hide-unprofitable",
            "--auto-continue",
            "2",
            "--presence-penalty",
            "-0.5",
        ]);
        assert_eq!(args.workspace_root(), PathBuf::from("work"));
        let opts = args.engine_options();
        assert_eq!(opts.mode, CompletionType::CurrentCellOnly);
        assert_eq!(opts.filter, StrategyFilter::HideUnprofitable);
        assert_eq!(opts.max_auto_continue, 2);

        let mut settings = DocumentSettings::default();
        args.apply_overrides(&mut settings).unwrap();
        assert_eq!(settings.model.as_deref(), Some("gpt-4"));
        assert_eq!(settings.request.temperature(), Some(0.7));
        assert_eq!(settings.request.presence_penalty(), Some(-0.5));
        assert_eq!(settings.request.frequency_penalty(), None);
    }

    #[test]
    fn test_invalid_temperature_rejected() {
        let args = Args::parse_from(["cellstream", "nb.json", "0", "--temperature", "3.5"]);
        let mut settings = DocumentSettings::default();
        assert!(args.apply_overrides(&mut settings).is_err());
    }
}
