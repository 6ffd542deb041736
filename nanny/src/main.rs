//! The `nanny` binary: CLI wiring around the supervisor library.

// Layer 1: Standard library imports
use std::path::PathBuf;

// Layer 2: Third-party crate imports
use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Layer 3: Internal module imports
use nanny::config::NannyConfig;
use nanny::daemon;
use nanny::error::{NannyError, NannyResult};
use nanny::supervisor::Supervisor;

/// Supervise a long-running process: restart it with backoff, probe its
/// health, run scheduled tasks, and publish status over HTTP and multicast.
///
/// `-s` registers a child and must come before the `-S`/`-h`/`-t` options
/// that attach to it; repeating `-s` starts attaching to the new child.
#[derive(Parser)]
#[command(name = "nanny", version, disable_help_flag = true)]
#[command(after_help = "Example:\n  nanny -s 'bin/server --no-background' -t '8h bin/reset $PID'")]
struct Cli {
    /// Shell command that starts a supervised child (repeatable)
    #[arg(short = 's', value_name = "CMD", action = ArgAction::Append, required = true)]
    start: Vec<String>,

    /// Shell command that stops the most recent -s child
    #[arg(short = 'S', value_name = "CMD", action = ArgAction::Append)]
    stop: Vec<String>,

    /// Health-check command for the most recent -s child
    #[arg(short = 'h', value_name = "CMD", action = ArgAction::Append)]
    health: Vec<String>,

    /// Timed command for the most recent -s child, e.g. '8h bin/reset $PID'
    #[arg(short = 't', value_name = "SPEC", action = ArgAction::Append)]
    timed: Vec<String>,

    /// Stay in the foreground and log to stderr
    #[arg(short = 'd', action = ArgAction::SetTrue)]
    debug: bool,

    /// Write and lock a pidfile
    #[arg(short = 'p', value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// Directory for the children's rotating logs
    #[arg(short = 'l', value_name = "DIR", default_value = "/tmp")]
    logdir: PathBuf,

    /// Print help
    #[arg(long = "help", action = ArgAction::Help)]
    _help: Option<bool>,
}

/// One child as assembled from the command line, in option order.
#[derive(Debug, Default, PartialEq)]
struct ChildPlan {
    start: String,
    stop: Option<String>,
    health: Option<String>,
    timed: Vec<String>,
}

/// Reassembles option order from argument indices so `-S`/`-h`/`-t` bind to
/// the child whose `-s` most recently preceded them.
fn bind_children(cli: &Cli, matches: &ArgMatches) -> NannyResult<Vec<ChildPlan>> {
    #[derive(Debug)]
    enum Opt<'a> {
        Start(&'a str),
        Stop(&'a str),
        Health(&'a str),
        Timed(&'a str),
    }

    let mut ordered: Vec<(usize, Opt<'_>)> = Vec::new();
    if let Some(indices) = matches.indices_of("start") {
        ordered.extend(indices.zip(&cli.start).map(|(i, v)| (i, Opt::Start(v.as_str()))));
    }
    if let Some(indices) = matches.indices_of("stop") {
        ordered.extend(indices.zip(&cli.stop).map(|(i, v)| (i, Opt::Stop(v.as_str()))));
    }
    if let Some(indices) = matches.indices_of("health") {
        ordered.extend(indices.zip(&cli.health).map(|(i, v)| (i, Opt::Health(v.as_str()))));
    }
    if let Some(indices) = matches.indices_of("timed") {
        ordered.extend(indices.zip(&cli.timed).map(|(i, v)| (i, Opt::Timed(v.as_str()))));
    }
    ordered.sort_by_key(|(index, _)| *index);

    let mut plans: Vec<ChildPlan> = Vec::new();
    for (_, opt) in ordered {
        match opt {
            Opt::Start(cmd) => plans.push(ChildPlan {
                start: cmd.to_string(),
                ..ChildPlan::default()
            }),
            other => {
                let Some(plan) = plans.last_mut() else {
                    return Err(NannyError::config(
                        "-S, -h, and -t require a preceding -s child",
                    ));
                };
                match other {
                    Opt::Stop(cmd) => plan.stop = Some(cmd.to_string()),
                    Opt::Health(cmd) => plan.health = Some(cmd.to_string()),
                    Opt::Timed(spec) => plan.timed.push(spec.to_string()),
                    Opt::Start(_) => {}
                }
            }
        }
    }
    Ok(plans)
}

/// Strips the inherited environment down to the conventional safe set before
/// it becomes the children's template.
fn clean_environment() {
    const SAFE: [&str; 4] = ["HOME", "PATH", "PWD", "USER"];
    let doomed: Vec<String> = std::env::vars()
        .map(|(key, _)| key)
        .filter(|key| !SAFE.contains(&key.as_str()))
        .collect();
    for key in doomed {
        std::env::remove_var(&key);
    }
}

fn run() -> NannyResult<()> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)
        .map_err(|e| NannyError::config(e.to_string()))?;
    let plans = bind_children(&cli, &matches)?;

    if cli.debug {
        if let Some(pidfile) = &cli.pidfile {
            daemon::write_pidfile(pidfile)?;
        }
    } else {
        daemon::daemonize(cli.pidfile.as_deref())?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    clean_environment();

    let config = NannyConfig {
        log_dir: cli.logdir.clone(),
        ..NannyConfig::default()
    };
    let mut sup = Supervisor::new(config)?;

    for plan in &plans {
        let id = sup.child_new(&plan.start);
        sup.set_restartable(id, true)?;
        if let Some(stop) = &plan.stop {
            sup.set_stop(id, stop)?;
        }
        if let Some(health) = &plan.health {
            sup.set_health(id, health)?;
        }
        for spec in &plan.timed {
            // A bad spec loses the task, not the supervisor.
            if let Err(err) = sup.add_periodic(id, spec) {
                warn!(error = %err, "periodic task rejected");
            }
        }
        sup.set_logpath(id, &cli.logdir)?;
    }

    sup.init_network()?;
    info!(
        http_port = sup.globals.http_port,
        children = plans.len(),
        "nanny running"
    );

    sup.run()?;
    info!("stop signal received");
    sup.shutdown()?;
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("nanny: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn plans_for(argv: &[&str]) -> NannyResult<Vec<ChildPlan>> {
        let matches = Cli::command().try_get_matches_from(argv).unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        bind_children(&cli, &matches)
    }

    #[test]
    fn test_single_child_with_attachments() {
        let plans = plans_for(&[
            "nanny",
            "-s",
            "bin/server",
            "-S",
            "bin/stop $PID",
            "-h",
            "bin/probe",
            "-t",
            "8h bin/reset $PID",
        ])
        .unwrap();

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].start, "bin/server");
        assert_eq!(plans[0].stop.as_deref(), Some("bin/stop $PID"));
        assert_eq!(plans[0].health.as_deref(), Some("bin/probe"));
        assert_eq!(plans[0].timed, vec!["8h bin/reset $PID"]);
    }

    #[test]
    fn test_options_attach_to_most_recent_child() {
        let plans = plans_for(&[
            "nanny", "-s", "one", "-h", "probe-one", "-s", "two", "-h", "probe-two", "-t",
            "1h tick",
        ])
        .unwrap();

        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].health.as_deref(), Some("probe-one"));
        assert!(plans[0].timed.is_empty());
        assert_eq!(plans[1].health.as_deref(), Some("probe-two"));
        assert_eq!(plans[1].timed, vec!["1h tick"]);
    }

    #[test]
    fn test_start_must_come_first() {
        // clap accepts the flags in any order; the binder enforces that
        // attachments follow their child.
        assert!(plans_for(&["nanny", "-h", "probe", "-s", "one"]).is_err());
    }

    #[test]
    fn test_missing_start_is_usage_error() {
        assert!(Cli::command()
            .try_get_matches_from(["nanny", "-h", "probe"])
            .is_err());
    }

    #[test]
    fn test_clean_environment_keeps_safe_keys() {
        std::env::set_var("NANNY_DOOMED_VAR", "x");
        clean_environment();
        assert!(std::env::var("NANNY_DOOMED_VAR").is_err());
        // PATH survives; children need it.
        assert!(std::env::var("PATH").is_ok());
    }
}
