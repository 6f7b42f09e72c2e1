use super::Host;
use super::common::{Common, CommonArgs, ScopeArgs};
use crate::Result;
use crate::tasks::{SubtaskKind, TaskTable};
use clap::Parser;
use ohno::bail;

#[derive(Parser, Debug)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub scope: ScopeArgs,
}

/// Re-run extraction over the raw records already stored, without touching the network.
pub async fn process_extract<H: Host>(host: &mut H, args: &ExtractArgs) -> Result<()> {
    let table = TaskTable::github();
    for name in &args.scope.tasks {
        if let Some(meta) = table.find(name)
            && meta.kind != SubtaskKind::Extract
        {
            bail!("task '{name}' is not an extraction task");
        }
    }

    let mut common = Common::new(host, &args.common, &args.scope)?;
    common.run_tasks(Some(SubtaskKind::Extract), &args.scope.tasks, false).await
}
