use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use warden::{commands, init_tracing, LogFormat};
use warden_core::{NotificationManager, ResponseTier, WardenConfig};

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .short('c')
        .value_parser(value_parser!(PathBuf))
        .help("Path to warden.toml (defaults apply when omitted)");

    Command::new("warden")
        .version(warden::VERSION)
        .about("Resource-pressure control and failure recovery for an embedded analytical engine")
        .subcommand_required(true)
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("pretty")
                .value_parser(value_parser!(LogFormat))
                .help("Log output: pretty or json"),
        )
        .subcommand(
            Command::new("check-config")
                .about("Load, validate and print the effective configuration")
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("evaluate")
                .about("Dry-run the escalation policy")
                .arg(config_arg)
                .arg(
                    Arg::new("usage")
                        .long("usage")
                        .required(true)
                        .value_parser(value_parser!(f64))
                        .help("Memory usage as a percentage of the limit"),
                )
                .arg(
                    Arg::new("tier")
                        .long("tier")
                        .default_value("normal")
                        .value_parser(value_parser!(ResponseTier))
                        .help("Tier currently in force"),
                )
                .arg(
                    Arg::new("since-ms")
                        .long("since-ms")
                        .value_parser(value_parser!(u64))
                        .help("Milliseconds since the last tier change"),
                ),
        )
        .subcommand(
            Command::new("rollback-unit")
                .about("Roll back a deployed unit of functionality")
                .arg(
                    Arg::new("registry")
                        .long("registry")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML unit registry"),
                )
                .arg(
                    Arg::new("toggles")
                        .long("toggles")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON feature-toggle file"),
                )
                .arg(Arg::new("unit").long("unit").required(true).help("Unit id, e.g. 1.2"))
                .arg(
                    Arg::new("reason")
                        .long("reason")
                        .default_value("manual rollback")
                        .help("Passed to the script as REASON"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Leave the toggle alone and pass DRY_RUN=true"),
                ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let format = matches
        .get_one::<LogFormat>("log-format")
        .copied()
        .unwrap_or_default();
    init_tracing(format).context("installing tracing subscriber")?;

    match matches.subcommand() {
        Some(("check-config", args)) => {
            let path = args.get_one::<PathBuf>("config");
            let config = commands::check_config(path.map(PathBuf::as_path))
                .context("configuration is invalid")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Some(("evaluate", args)) => {
            let config = match args.get_one::<PathBuf>("config") {
                Some(path) => WardenConfig::load(path)?,
                None => WardenConfig::default(),
            };
            let usage = args
                .get_one::<f64>("usage")
                .copied()
                .context("--usage is required")?;
            let tier = args
                .get_one::<ResponseTier>("tier")
                .copied()
                .unwrap_or_default();
            let since = args.get_one::<u64>("since-ms").map(|ms| Duration::from_millis(*ms));
            let evaluation = commands::evaluate(&config, usage, tier, since);
            println!("{}", serde_json::to_string_pretty(&evaluation)?);
        }
        Some(("rollback-unit", args)) => {
            let registry = args.get_one::<PathBuf>("registry").context("--registry is required")?;
            let toggles = args.get_one::<PathBuf>("toggles").context("--toggles is required")?;
            let unit = args.get_one::<String>("unit").context("--unit is required")?;
            let reason = args
                .get_one::<String>("reason")
                .map(String::as_str)
                .unwrap_or("manual rollback");
            let dry_run = args.get_flag("dry-run");

            let events = Arc::new(NotificationManager::with_default_sinks(10_000));
            let report =
                commands::rollback_unit(registry, toggles, unit, reason, dry_run, events).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.succeeded() {
                std::process::exit(1);
            }
        }
        _ => {}
    }
    Ok(())
}
