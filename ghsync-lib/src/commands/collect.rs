use super::Host;
use super::common::{Common, CommonArgs, ScopeArgs};
use crate::Result;
use clap::Parser;

#[derive(Parser, Debug)]
pub struct CollectArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Ignore saved progress and collect everything again
    #[arg(long)]
    pub full_sync: bool,
}

/// Run the default (or the selected) sub-tasks for one repository.
pub async fn process_collect<H: Host>(host: &mut H, args: &CollectArgs) -> Result<()> {
    let mut common = Common::new(host, &args.common, &args.scope)?;
    common.run_tasks(None, &args.scope.tasks, args.full_sync).await
}
