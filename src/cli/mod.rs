pub mod actions;

use clap::{Arg, ArgMatches, Command};

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .help("Path to the gateway configuration (.toml or .json)")
        .value_name("FILE")
        .required(true)
}

fn mock_arg() -> Arg {
    Arg::new("mock")
        .long("mock")
        .help("Use the simulated bus regardless of transport.mode")
        .action(clap::ArgAction::SetTrue)
}

/// Command tree of the `busgate` binary.
pub fn build_command() -> Command {
    Command::new("busgate")
        .about("Field gateway for a shared Modbus RTU bus")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about("Run polling and the auto-recovery watchdog until Ctrl-C")
                .arg(config_arg())
                .arg(mock_arg()),
        )
        .subcommand(
            Command::new("exec")
                .about("Send one direct command and print the JSON result")
                .arg(config_arg())
                .arg(mock_arg())
                .arg(Arg::new("port").required(true).help("Logical port, e.g. DO1"))
                .arg(
                    Arg::new("command")
                        .required(true)
                        .help("Command name, e.g. POWER"),
                )
                .arg(
                    Arg::new("value")
                        .required(true)
                        .allow_hyphen_values(true)
                        .help("true/false, a number, or a numeric string"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate a configuration file and print it with defaults filled in")
                .arg(config_arg()),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}
