//! Argument parsing through the library crate the `mirador` binary links.

use clap::Parser;
use mirador_cli::{Command, Config, LogLevel};

fn parse(args: &[&str]) -> Result<Config, clap::Error> {
    let mut argv = vec!["mirador", "--database-url", "postgres://localhost/mirador"];
    argv.extend_from_slice(args);
    Config::try_parse_from(argv)
}

#[test]
fn every_subcommand_parses() {
    let cases = [
        (vec!["serve"], Command::Serve),
        (vec!["sync"], Command::Sync { force: false }),
        (vec!["sync", "--force"], Command::Sync { force: true }),
        (vec!["cleanup"], Command::Cleanup),
        (vec!["status"], Command::Status),
        (vec!["show", "7"], Command::Show { id: 7 }),
    ];

    for (args, expected) in cases {
        let config = parse(&args).unwrap();
        assert_eq!(config.command, expected, "args: {:?}", args);
    }
}

#[test]
fn log_level_defaults_to_info() {
    let config = parse(&["status"]).unwrap();
    assert_eq!(config.log_level, LogLevel::Info);
}

#[test]
fn missing_subcommand_is_rejected() {
    assert!(parse(&[]).is_err());
}
