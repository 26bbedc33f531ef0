use crate::context::AppContext;
use crate::progress::DeployProgress;
use crate::utils::{one_line, status_label};
use colored::Colorize;
use pullflow_build::{HttpRegistry, KubeCluster, RegistryAuth};
use pullflow_core::{DeployStatus, DeployStore, MemoryStore};
use pullflow_deploy::{BuildReport, GithubClient, Orchestrator};
use std::sync::Arc;
use std::time::Duration;

pub async fn handle(ctx: &AppContext, build_uuid: &str) -> anyhow::Result<()> {
    let build = ctx.build(build_uuid).await?;
    println!(
        "{} {} → {}",
        "Deploying build".blue(),
        build.uuid.cyan(),
        build.namespace.cyan()
    );

    let cluster = Arc::new(KubeCluster::try_default().await?);
    let registry = Arc::new(HttpRegistry::new(RegistryAuth::new()));
    let source = Arc::new(GithubClient::from_settings(&ctx.settings.github));
    let orchestrator = Orchestrator::new(
        ctx.store.clone(),
        cluster,
        registry,
        source,
        ctx.settings.clone(),
    )?;

    let progress = DeployProgress::new(&build.uuid);
    let watcher = tokio::spawn(watch(ctx.store.clone(), build.uuid.clone(), progress.clone()));

    let result = orchestrator.deploy_build(&build.uuid).await;
    watcher.abort();
    ctx.save().await?;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            progress.finish_error(&e.to_string());
            return Err(e.into());
        }
    };
    progress.finish_success(report.outcomes.len());
    print_report(&report);

    let failed = report.failures().count();
    if failed > 0 {
        anyhow::bail!("{} of {} deploys failed", failed, report.outcomes.len());
    }
    Ok(())
}

/// スピナーのメッセージをストアと同期させる
async fn watch(store: Arc<MemoryStore>, build_uuid: String, progress: DeployProgress) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        let Ok(deploys) = store.list_deploys(&build_uuid).await else {
            continue;
        };

        let done = deploys.iter().filter(|d| d.status.is_terminal()).count();
        let mut pending: Vec<String> = deploys
            .iter()
            .filter(|d| !d.status.is_terminal() && d.status != DeployStatus::Queued)
            .map(|d| format!("{} {}", d.name(), d.status))
            .collect();
        pending.sort();

        progress.set_message(format!(
            "{}/{} finished  {}",
            done,
            deploys.len(),
            pending.join(", ")
        ));
    }
}

fn print_report(report: &BuildReport) {
    println!();
    for outcome in &report.outcomes {
        println!(
            "  {:<20} {} {}",
            outcome.service.bold(),
            status_label(outcome.status),
            outcome
                .message
                .as_deref()
                .map(|m| one_line(m, 80))
                .unwrap_or_default()
        );
    }
    println!();

    if report.succeeded() {
        println!("{}", "✓ All deploys finished".green());
    } else {
        println!(
            "{}",
            "✗ Some deploys failed, see `pullflow logs <build> <service> --stored`".red()
        );
    }
}
