use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod demo;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run two engines over an in-process wire and exchange messages.
    Demo(DemoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Demo(args) => demo::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Messages to send in each direction.
    #[arg(long, default_value = "4")]
    pub count: u32,
    /// Channel used for the forward direction.
    #[arg(long, default_value = "5")]
    pub channel: u16,
    /// Channel used for the reply direction.
    #[arg(long, default_value = "6")]
    pub reply_channel: u16,
    /// Payload size per message in bytes.
    #[arg(long, default_value = "100")]
    pub payload_size: usize,
    /// Data xfer (frame) size in bytes; both sides share it.
    #[arg(long, default_value = "64")]
    pub frame_size: usize,
}

#[derive(Args, Debug, Default)]
pub struct VersionArgs {
    /// Show extended build information.
    #[arg(long)]
    pub extended: bool,
}
