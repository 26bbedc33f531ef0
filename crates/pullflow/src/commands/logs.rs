use crate::context::AppContext;
use colored::Colorize;
use pullflow_build::{KubeCluster, job_events, log_stream_descriptor};

pub struct LogsOptions {
    pub stored: bool,
    pub events: bool,
    pub container: Option<String>,
    pub tail: Option<i64>,
}

pub async fn handle(
    ctx: &AppContext,
    build_uuid: &str,
    service: &str,
    options: LogsOptions,
) -> anyhow::Result<()> {
    let build = ctx.build(build_uuid).await?;
    let deploy = ctx.deploy(build_uuid, service).await?;

    if options.stored {
        match deploy.build_output.as_deref().filter(|o| !o.is_empty()) {
            Some(output) => println!("{}", output),
            None => println!("{}", format!("No build output stored for {}", deploy.uuid).dimmed()),
        }
        return Ok(());
    }

    // キャッシュヒットとパイプライン実行はクラスタにジョブを持たない
    let job_name = deploy
        .build_dispatch_id
        .as_deref()
        .filter(|id| !id.is_empty() && !id.starts_with("cache:"))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "{} has no build job; use --stored for the recorded output",
                deploy.uuid
            )
        })?;

    let cluster = KubeCluster::try_default().await?;

    if options.events {
        let events = job_events(&cluster, &build.namespace, job_name).await?;
        if events.is_empty() {
            println!("{}", format!("No events for job {}", job_name).dimmed());
        }
        for event in events {
            let kind = event.type_.as_deref().unwrap_or("Normal");
            let kind = if kind == "Warning" { kind.yellow() } else { kind.normal() };
            println!(
                "{} {:<8} {:<20} {}",
                event
                    .last_timestamp
                    .as_deref()
                    .or(event.event_time.as_deref())
                    .unwrap_or("-")
                    .dimmed(),
                kind,
                event.reason.as_deref().unwrap_or_default().bold(),
                event.message.as_deref().unwrap_or_default()
            );
        }
        return Ok(());
    }

    let descriptor = log_stream_descriptor(
        &cluster,
        &build.namespace,
        job_name,
        &ctx.settings.stream.endpoint,
        options.tail.unwrap_or(ctx.settings.stream.tail_lines),
        options.container.as_deref(),
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}
