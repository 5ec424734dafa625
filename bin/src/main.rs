#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::process::ExitCode;

use clap::{
    builder::{styling::AnsiColor, Styles},
    Args, Parser,
};
use color_eyre::{eyre::Result, Section};
use stevedore_lib::{registry::Registry, Authentication, Reference, DEFAULT_DOMAIN, INDEX_DOMAIN};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{self, prelude::*};

mod inspect;
mod list_tags;
mod pull;
mod tar;

#[derive(Debug, Parser)]
#[command(name = "stevedore", version, about, styles = style())]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser)]
enum Commands {
    /// List the tags of a repository
    ListTags(list_tags::Options),

    /// Resolve an image and print its configuration
    Inspect(inspect::Options),

    /// Pull an image and save it as an archive
    Pull(pull::Options),

    /// Package an already-downloaded image directory into an archive
    Tar(tar::Options),
}

/// Options shared by every command.
#[derive(Debug, Clone, Args)]
pub struct GlobalOptions {
    /// Registry username
    #[arg(long, global = true, env = "REGISTRY_USERNAME")]
    username: Option<String>,

    /// Registry password
    #[arg(long, global = true, env = "REGISTRY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    ignore_cert_error: bool,

    /// Connect over plain HTTP instead of TLS
    #[arg(long, global = true)]
    plain_http: bool,
}

impl GlobalOptions {
    fn authentication(&self) -> Authentication {
        match (&self.username, &self.password) {
            (None, None) => Authentication::None,
            (username, password) => Authentication::basic(
                username.clone().unwrap_or_default(),
                password.clone().unwrap_or_default(),
            ),
        }
    }

    /// A registry client for the reference's domain.
    pub fn registry(&self, reference: &Reference) -> Result<Registry> {
        Registry::builder()
            .domain(reference.domain.clone())
            .authentication(self.authentication())
            .plain_http(self.plain_http)
            .accept_invalid_certs(self.ignore_cert_error)
            .build()
            .map_err(Into::into)
    }
}

/// Parse a reference, redirecting unqualified names to `REGISTRY_HOST` when
/// that variable is set.
pub fn parse_reference(input: &str) -> Result<Reference> {
    let reference = input
        .parse::<Reference>()
        .map_err(stevedore_lib::Error::from)?;

    let qualified = input.starts_with(&format!("{DEFAULT_DOMAIN}/"))
        || input.starts_with(&format!("{INDEX_DOMAIN}/"));
    match std::env::var("REGISTRY_HOST") {
        Ok(host) if !host.is_empty() && reference.domain == DEFAULT_DOMAIN && !qualified => {
            format!("{host}/{input}")
                .parse::<Reference>()
                .map_err(stevedore_lib::Error::from)
                .map_err(Into::into)
        }
        _ => Ok(reference),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            let code = report
                .downcast_ref::<stevedore_lib::Error>()
                .map(stevedore_lib::Error::exit_code)
                .unwrap_or(1);
            eprintln!("{report:?}");
            ExitCode::from(code)
        }
    }
}

async fn run() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::ListTags(opts) => list_tags::main(cli.global, opts).await,
        Commands::Inspect(opts) => inspect::main(cli.global, opts).await,
        Commands::Pull(opts) => pull::main(cli.global, opts).await,
        Commands::Tar(opts) => tar::main(opts).await,
    }
    .with_warning(|| {
        concat!(
            "Authentication errors are sometimes reported when the actual issue ",
            "is that the specified image or tag does not exist. ",
            "This depends on the behavior of the remote container registry.",
        )
    })
}

fn style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Green.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default())
        .invalid(AnsiColor::Red.on_default())
        .valid(AnsiColor::Blue.on_default())
}
