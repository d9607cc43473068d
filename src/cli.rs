//! Operator command tree.

use clap::{Arg, ArgAction, Command, value_parser};

pub fn command() -> Command {
    Command::new("hashall")
        .about("File catalog and same-device hardlink deduplication")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("scan")
                .about("Catalog a directory tree incrementally")
                .arg(Arg::new("root").help("Directory to scan").required(true))
                .arg(
                    Arg::new("hash-mode")
                        .long("hash-mode")
                        .value_parser(["fast", "full", "upgrade"])
                        .default_value("fast")
                        .help("fast: quick hashes; full: also SHA-256; upgrade: fill missing SHA-256"),
                )
                .arg(
                    Arg::new("parallel")
                        .long("parallel")
                        .action(ArgAction::SetTrue)
                        .help("Hash with one worker per logical CPU"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .help("Exact number of hash workers"),
                ),
        )
        .subcommand(
            Command::new("link")
                .about("Same-device hardlink deduplication")
                .subcommand_required(true)
                .subcommand(
                    Command::new("analyze")
                        .about("Promote quick-hash collisions and report duplicate groups")
                        .arg(device_arg())
                        .arg(min_size_arg()),
                )
                .subcommand(
                    Command::new("plan")
                        .about("Persist a hardlink plan from the current duplicate groups")
                        .arg(Arg::new("name").help("Plan name").required(true))
                        .arg(device_arg())
                        .arg(min_size_arg()),
                )
                .subcommand(
                    Command::new("show-plan")
                        .about("Show a plan and its actions")
                        .arg(plan_id_arg()),
                )
                .subcommand(Command::new("list-plans").about("List all plans"))
                .subcommand(
                    Command::new("execute")
                        .about("Execute a plan's pending actions")
                        .arg(plan_id_arg())
                        .arg(
                            Arg::new("dry-run")
                                .long("dry-run")
                                .action(ArgAction::SetTrue)
                                .help("Verify only; mutate nothing"),
                        )
                        .arg(
                            Arg::new("verify")
                                .long("verify")
                                .value_parser(["fast", "paranoid", "none"])
                                .default_value("fast")
                                .help("Pre-link content verification"),
                        )
                        .arg(
                            Arg::new("no-backup")
                                .long("no-backup")
                                .action(ArgAction::SetTrue)
                                .help("Skip the target.bak safety link"),
                        )
                        .arg(
                            Arg::new("limit")
                                .long("limit")
                                .value_parser(value_parser!(usize))
                                .help("Attempt at most N actions; the rest stay pending"),
                        )
                        .arg(
                            Arg::new("yes")
                                .long("yes")
                                .short('y')
                                .action(ArgAction::SetTrue)
                                .help("Skip the confirmation prompt"),
                        ),
                )
                .subcommand(
                    Command::new("cancel")
                        .about("Cancel a plan that has not finished")
                        .arg(plan_id_arg()),
                ),
        )
        .subcommand(
            Command::new("devices")
                .about("Registered filesystems")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List registered devices"))
                .subcommand(
                    Command::new("show")
                        .about("Show one device and its catalog stats")
                        .arg(device_selector_arg()),
                )
                .subcommand(
                    Command::new("alias")
                        .about("Set a short alias for a device")
                        .arg(device_selector_arg())
                        .arg(Arg::new("name").help("Alias to assign").required(true)),
                ),
        )
        .subcommand(
            Command::new("export")
                .about("Dump a device's catalog as JSON on stdout")
                .arg(device_arg()),
        )
        .subcommand(Command::new("stats").about("Catalog-wide statistics"))
}

fn device_arg() -> Arg {
    Arg::new("device")
        .long("device")
        .required(true)
        .help("Device id or alias")
}

fn device_selector_arg() -> Arg {
    Arg::new("device").help("Device id or alias").required(true)
}

fn plan_id_arg() -> Arg {
    Arg::new("plan-id")
        .help("Plan id")
        .required(true)
        .value_parser(value_parser!(i64))
}

fn min_size_arg() -> Arg {
    // Zero-byte files form legitimate (if unprofitable) duplicate groups,
    // so the size filter is off unless the operator asks for one.
    Arg::new("min-size")
        .long("min-size")
        .value_parser(value_parser!(u64))
        .default_value("0")
        .help("Ignore files smaller than this many bytes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tree_is_well_formed() {
        command().debug_assert();
    }

    #[test]
    fn scan_defaults_to_fast_mode() {
        let matches = command()
            .try_get_matches_from(["hashall", "scan", "/data"])
            .unwrap();
        let (_, scan) = matches.subcommand().unwrap();
        assert_eq!(scan.get_one::<String>("hash-mode").unwrap(), "fast");
    }
}
