use std::path::PathBuf;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use homebox_backup::app::App;
use homebox_backup::session::SshConnector;
use homebox_backup::settings::Settings;
use homebox_backup::types::RunStatus;
use homebox_backup::ui::{self, RunOptions};

fn cli() -> Command {
    Command::new("homebox-backup")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Back up a Docker-hosted Homebox instance over SSH")
        .arg(Arg::new("host").long("host").value_name("HOST").help("SSH host"))
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("SSH port"),
        )
        .arg(Arg::new("user").long("user").value_name("USER").help("SSH username"))
        .arg(
            Arg::new("dest")
                .long("dest")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Local directory the archive is saved to"),
        )
        .arg(
            Arg::new("include-other-files")
                .long("include-other-files")
                .help("Also back up everything else in the data directory")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("app-container")
                .long("app-container")
                .value_name("NAME")
                .help("Application container name or id"),
        )
        .arg(
            Arg::new("db-container")
                .long("db-container")
                .value_name("NAME")
                .help("Database container name or id"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Print the backup plan without executing it")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan-only")
                .long("scan-only")
                .help("List running containers and their mounts, then exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("delete-remote-archive")
                .long("delete-remote-archive")
                .help("Delete the archive from the server after a verified download")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("yes")
                .long("yes")
                .short('y')
                .help("Never prompt; the remote archive is kept unless --delete-remote-archive is given")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("settings")
                .long("settings")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Settings file (default: <config dir>/homebox-backup/settings.json)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Append the run log to this file"),
        )
}

fn load_settings(path: Option<&PathBuf>) -> (Settings, Option<PathBuf>) {
    let path = match path {
        Some(path) => Some(path.clone()),
        None => match Settings::default_path() {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Settings will not be persisted");
                None
            }
        },
    };

    let settings = match &path {
        Some(path) => Settings::load_from(path).unwrap_or_else(|e| {
            eprintln!("Ignoring unreadable settings: {e:#}");
            Settings::default()
        }),
        None => Settings::default(),
    };
    (settings, path)
}

fn apply_overrides(settings: &mut Settings, matches: &ArgMatches) {
    if let Some(host) = matches.get_one::<String>("host") {
        settings.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        settings.port = *port;
    }
    if let Some(user) = matches.get_one::<String>("user") {
        settings.username = user.clone();
    }
    if let Some(dest) = matches.get_one::<PathBuf>("dest") {
        settings.save_path = dest.clone();
    }
    if matches.get_flag("include-other-files") {
        settings.backup_other = true;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("homebox_backup=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();

    let (mut settings, settings_path) = load_settings(matches.get_one::<PathBuf>("settings"));
    apply_overrides(&mut settings, &matches);

    let options = RunOptions {
        app_container: matches.get_one::<String>("app-container").cloned(),
        db_container: matches.get_one::<String>("db-container").cloned(),
        scan_only: matches.get_flag("scan-only"),
        delete_remote_archive: matches.get_flag("delete-remote-archive"),
        assume_yes: matches.get_flag("yes"),
        log_file: matches.get_one::<PathBuf>("log-file").cloned(),
    };

    let connector = SshConnector::new(settings.profile.session_config());
    let mut app = App::new(Box::new(connector), settings, matches.get_flag("dry-run"));
    if let Some(path) = settings_path {
        app = app.with_settings_path(path);
    }

    let status = ui::run(&mut app, &options).await?;
    match status {
        RunStatus::Success => Ok(()),
        RunStatus::PartialFailure => std::process::exit(2),
        RunStatus::Failure => std::process::exit(1),
    }
}
