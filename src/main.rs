use anyhow::Result;
use autoinstrument::cli::AgentOpts;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    autoinstrument::init_logger(opts.verbosity.log_level_filter().into());

    match autoinstrument::run_agent(&opts.agent_opts).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            autoinstrument::utils::report_error(&e);
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(about = "eBPF auto-instrumentation agent")]
#[clap(version)]
#[clap(disable_help_subcommand = true)]
struct Opts {
    #[command(flatten)]
    pub agent_opts: AgentOpts,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}
