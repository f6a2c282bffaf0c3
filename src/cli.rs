use clap::Parser;

pub const NAME: &str = "autoinstrument";

/// Target selection and configuration file. Flags given here override the
/// values of the configuration file.
#[derive(Parser, Debug, Clone, Default)]
#[clap(name = NAME)]
pub struct AgentOpts {
    /// Configuration file in INI format
    #[clap(long)]
    pub config_file: Option<String>,

    /// Regular expression matched against the executable path of the target
    #[clap(long)]
    pub exec: Option<String>,

    /// Port the target listens on. Takes precedence over --exec
    #[clap(long)]
    pub port: Option<u16>,

    /// Instrument every process with the generic tracer only
    #[clap(long)]
    pub system_wide: bool,
}
