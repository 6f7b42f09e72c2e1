//! Command dispatch logic for ghsync

use super::{CollectArgs, ExtractArgs, InitArgs, TasksArgs, init_config, list_tasks, process_collect, process_extract};
use crate::{Host, Result};
use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand};

const CLAP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser, Debug)]
#[command(name = "ghsync", version, author, long_about = None)]
#[command(about = "Incrementally collect GitHub REST data into a local store")]
#[command(styles = CLAP_STYLES)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect (and extract) data for one repository
    Collect(Box<CollectArgs>),
    /// Re-run extraction over already collected data
    Extract(Box<ExtractArgs>),
    /// List the available sub-tasks
    Tasks(TasksArgs),
    /// Generate a default configuration file
    Init(InitArgs),
}

/// Dispatch command-line arguments to the appropriate handler
///
/// This function parses the command-line arguments and executes the corresponding
/// subcommand. It's designed to be called from main.rs with the program arguments.
///
/// # Errors
///
/// Returns an error if the executed command fails
pub async fn run<I, T, H>(host: &mut H, args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
    H: Host,
{
    match &Cli::parse_from(args).command {
        Command::Collect(collect_args) => process_collect(host, collect_args).await,
        Command::Extract(extract_args) => process_extract(host, extract_args).await,
        Command::Tasks(tasks_args) => list_tasks(host, tasks_args),
        Command::Init(init_args) => init_config(host, init_args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::host::TestHost;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn tokens_are_comma_separated() {
        let cli = Cli::parse_from(["ghsync", "collect", "--repo", "o/r", "--token", "a,b", "--task", "collect_runs,collect_jobs"]);
        let Command::Collect(args) = cli.command else {
            panic!("expected the collect command");
        };

        assert_eq!(args.scope.tokens, ["a", "b"]);
        assert_eq!(args.scope.tasks, ["collect_runs", "collect_jobs"]);
        assert!(!args.full_sync);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
    async fn tasks_command_lists_the_table() {
        let mut host = TestHost::new();
        run(&mut host, ["ghsync", "tasks", "--color", "never"]).await.unwrap();
        assert!(host.output_str().contains("collect_check_runs"));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
    async fn extract_rejects_collection_tasks() {
        let mut host = TestHost::new();
        let err = run(&mut host, ["ghsync", "extract", "--repo", "o/r", "--task", "collect_runs"])
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("not an extraction task"));
    }
}
