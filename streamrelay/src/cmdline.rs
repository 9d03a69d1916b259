use std::path::PathBuf;

use clap::{Arg, Command, value_parser};

pub(super) const ARG_CONFIG: &str = "config";

pub(super) fn root_cli() -> Command {
    Command::new("streamrelay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relays newline delimited messages through a transformation chain to a target")
        .arg(
            Arg::new(ARG_CONFIG)
                .long("config")
                .short('c')
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help(
                    "Path to the JSON configuration. Falls back to STREAMRELAY_CONFIG_FILE, \
                     then to base64 encoded STREAMRELAY_CONFIG",
                ),
        )
}
