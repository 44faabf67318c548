use std::{
    io::{self, Error, ErrorKind},
    time::Duration,
};

use asg_files::{Ec2Inventory, Fetcher, RemoteFileSpecification, SshShell};
use clap::Parser;

pub const APP_NAME: &str = "fetch-asg-files";

/// Downloads files from every instance of the Auto Scaling Groups in a spec file.
#[derive(Debug, Parser)]
#[command(name = APP_NAME, version, about)]
struct Options {
    /// Sets the log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Sets the AWS region
    #[arg(long, default_value = "us-west-2")]
    region: String,

    /// The YAML RemoteFileSpecification to fetch files for
    #[arg(long)]
    spec_file: String,

    /// Assumes this IAM role through STS instead of the default credentials
    #[arg(long)]
    assume_role_arn: Option<String>,

    /// Sets the SSH connect timeout in seconds (must be at least 1)
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    connect_timeout_secs: u64,
}

fn main() -> io::Result<()> {
    let opts = Options::parse();

    // ref. https://github.com/env-logger-rs/env_logger/issues/47
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.log_level),
    );
    log::info!("starting {} with {:?}", APP_NAME, opts);

    execute(&opts).map_err(|e| Error::new(ErrorKind::Other, e.to_string()))
}

fn execute(opts: &Options) -> asg_files::Result<()> {
    let spec = RemoteFileSpecification::load(&opts.spec_file)?;
    spec.validate()?;

    let inventory = match &opts.assume_role_arn {
        Some(role_arn) => Ec2Inventory::with_assumed_role(&opts.region, role_arn, APP_NAME)?,
        None => Ec2Inventory::new(&opts.region)?,
    };
    let shell = SshShell::new(Duration::from_secs(opts.connect_timeout_secs));

    Fetcher::new(inventory, shell).fetch_files_from_asgs(&spec)?;
    log::info!(
        "fetched files from {} ASG(s) into '{}'",
        spec.asg_names.len(),
        spec.local_destination_dir
    );
    Ok(())
}
