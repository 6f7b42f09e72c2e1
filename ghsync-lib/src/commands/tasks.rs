use super::Host;
use super::common::ColorMode;
use crate::Result;
use crate::tasks::TaskTable;
use clap::Parser;
use owo_colors::OwoColorize;
use std::io::Write;

#[derive(Parser, Debug)]
pub struct TasksArgs {
    /// Control when to use colored output
    #[arg(long, value_name = "WHEN", default_value = "auto")]
    pub color: ColorMode,
}

/// List the sub-tasks in the order they run.
pub fn list_tasks<H: Host>(host: &mut H, args: &TasksArgs) -> Result<()> {
    let use_colors = args.color.enabled_for(&std::io::stdout());
    let table = TaskTable::github();
    let width = table.iter().map(|meta| meta.name.len()).max().unwrap_or_default();

    let mut out = host.output();
    for meta in table.iter() {
        let name = format!("{:<width$}", meta.name);
        let default = if meta.enabled_by_default { "default" } else { "opt-in" };

        if use_colors {
            let name = if meta.enabled_by_default {
                name.bold().to_string()
            } else {
                name.dimmed().to_string()
            };
            writeln!(out, "{name}  {:<7}  {default:<7}  {}", meta.kind.cyan(), meta.description)?;
        } else {
            writeln!(out, "{name}  {:<7}  {default:<7}  {}", meta.kind, meta.description)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::host::TestHost;

    #[test]
    fn lists_every_task_in_order() {
        let mut host = TestHost::new();
        list_tasks(&mut host, &TasksArgs { color: ColorMode::Never }).unwrap();

        let output = host.output_str();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 10);
        assert!(lines[0].starts_with("collect_pull_requests "));
        assert!(lines[0].contains("collect"));
        assert!(lines[9].starts_with("extract_secret_scanning_alerts"));
        assert!(lines[9].contains("opt-in"));
    }
}
