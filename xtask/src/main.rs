//! Build automation tasks for DSS
//!
//! - `generate-cli-docs`: render the registrator CLI reference to markdown
//! - `generate-cli-docs --check`: fail when the committed reference is stale

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for DSS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the dss-registrator CLI reference
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,

        /// Compare against the existing file instead of writing it
        #[arg(long)]
        check: bool,
    },
}

const REFERENCE_FILE: &str = "cli-reference.md";
const GENERATED_ON_PREFIX: &str = "Generated on ";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir, check } => generate_cli_docs(&output_dir, check)?,
    }

    Ok(())
}

/// Environment variables read by `RegistratorConfig::load`, with defaults
const ENVIRONMENT: &[(&str, &str)] = &[
    ("DSS_DATA_ROOT", "Parent of every directory below (default: `./dss-data`)"),
    ("DSS_INCOMING_DIR", "Drop box watched for deliveries"),
    ("DSS_STAGING_DIR", "Transaction workspaces and persisted rollback stacks"),
    ("DSS_PRECOMMIT_DIR", "Storage processor output before it is moved to the store"),
    ("DSS_STORE_DIR", "Final, sharded data set store"),
    ("DSS_ERROR_DIR", "Deliveries that failed with a content or configuration error"),
    ("DSS_REGISTRATION_LOG_DIR", "Per-delivery logs (`in-process/`, `succeeded/`, `failed/`)"),
    ("DSS_USE_MARKER_FILES", "Only register deliveries announced by `.MARKER_is_finished_<name>`"),
    ("DSS_QUIET_PERIOD_SECS", "Age a delivery must reach before it is registered without markers"),
    ("DSS_SCAN_INTERVAL_SECS", "Pause between drop box scans"),
    ("DSS_DELIVERY_HANDLER", "`plain` (one data set per delivery) or `container`"),
    ("DSS_REGISTRY_MODE", "`http` or `memory`"),
    ("DSS_REGISTRY_URL", "Base URL of the metadata registry"),
    ("DSS_REGISTRY_TIMEOUT_SECS", "Timeout of a single registry request"),
    ("DSS_DEFAULT_SPACE", "Space used for identifiers parsed from delivery names"),
    ("DSS_DEFAULT_DATA_SET_TYPE", "Data set type of registered deliveries"),
    ("DSS_ON_ERROR_OVERRIDES", "Undo table overrides, `class@progress=action,...`"),
    ("DSS_PROCESSOR_*", "Storage processor properties, passed on with the prefix removed"),
    ("DSS_PRE_DELIVERY_SCRIPT", "Script run before a delivery is handled"),
    ("DSS_PRE_REGISTRATION_SCRIPT", "Script run before a transaction calls the registry"),
    ("DSS_POST_REGISTRATION_SCRIPT", "Script run after a transaction committed"),
    ("DSS_POST_DELIVERY_SCRIPT", "Script run once a delivery is finished"),
    ("DSS_NOTIFY_RECIPIENT", "Operator address for storage processor notifications"),
    ("DSS_LOG_LEVEL", "Log level (`trace` ... `error`)"),
];

fn render(markdown: &str) -> String {
    let environment: String = ENVIRONMENT
        .iter()
        .map(|(name, description)| format!("| `{}` | {} |\n", name, description))
        .collect();

    format!(
        r#"# dss-registrator CLI Reference

{}{}. Run `cargo xtask generate-cli-docs` to update.

## Commands

{}

## Environment Variables

Settings are read from the environment and an optional `.env` file.

| Variable | Meaning |
|----------|---------|
{}
## Exit Status

- `0`: the command succeeded
- `1`: the delivery was not registered or the command failed
- `2`: invalid arguments
"#,
        GENERATED_ON_PREFIX,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown,
        environment
    )
}

/// Drop the generation date so `--check` does not fail on it
fn without_date(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.starts_with(GENERATED_ON_PREFIX))
        .collect::<Vec<_>>()
        .join("\n")
}

fn generate_cli_docs(output_dir: &str, check: bool) -> anyhow::Result<()> {
    let content = render(&clap_markdown::help_markdown::<dss_registrator::Cli>());
    let file_path = PathBuf::from(output_dir).join(REFERENCE_FILE);

    if check {
        let existing = fs::read_to_string(&file_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", file_path.display(), e))?;
        if without_date(&existing) != without_date(&content) {
            anyhow::bail!(
                "{} is out of date, run `cargo xtask generate-cli-docs`",
                file_path.display()
            );
        }
        println!("CLI reference is up to date");
        return Ok(());
    }

    fs::create_dir_all(output_dir)?;
    fs::write(&file_path, content)?;
    println!("Generated CLI reference at: {}", file_path.display());

    Ok(())
}
