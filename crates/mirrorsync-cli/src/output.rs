//! Output formatting for CLI commands

use serde_json::Value;

/// How command results are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines
    Human,
    /// One JSON document on stdout
    Json,
}

/// Print a result in the selected format.
///
/// `human` is the pre-rendered human text; `json` the structured form.
pub fn emit(format: OutputFormat, human: &str, json: &Value) {
    match format {
        OutputFormat::Human => println!("{human}"),
        OutputFormat::Json => println!("{json}"),
    }
}
