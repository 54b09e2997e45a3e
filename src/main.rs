use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::Configuration, prelude::*, supervisor::Supervisor, ui::Ui};

mod backends;
mod bridge_data;
mod config;
mod dispatcher;
mod job;
mod prelude;
mod retry;
mod stats;
mod supervisor;
mod ui;
mod worker;

/// Advertise text-completion models to a horde dispatcher and fulfill jobs
/// against backing OpenAI-compatible or KoboldAI-compatible endpoints.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - HORDE_URL (optional): Override the dispatcher base URL.
  - API_KEY (optional): Override the dispatcher credential.
  - QUEUE_SIZE (optional): Override the pre-queue depth.
  - HORDE_MAX_LENGTH, HORDE_MAX_CONTEXT_LENGTH (optional): Override every
    model's generation limits.
  - HORDE_BRANDED_MODEL, HORDE_NSFW (optional): "1"/"true"/"yes"/"on" to
    enable.
  - HORDE_BLACKLIST (optional): Comma-separated model-family blacklist.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// Path to the YAML configuration file.
    config_path: PathBuf,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message and exit with a non-zero status.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // This is a long-running daemon, not a file-processing pipeline; we only
    // need the spinner, not a progress bar.
    ui.hide_progress_bars();

    let config = Configuration::load(&opts.config_path)?;
    let supervisor = Supervisor::new(config, ui)?;
    supervisor.run().await
}
