use crate::context::AppContext;
use crate::utils::{one_line, status_label};
use chrono::Local;
use colored::Colorize;
use pullflow_core::{Deploy, DeployStore};

pub async fn handle(ctx: &AppContext, build_uuid: &str, activity: bool) -> anyhow::Result<()> {
    let build = ctx.build(build_uuid).await?;
    let mut deploys = ctx.store.list_deploys(&build.uuid).await?;
    deploys.sort_by(|a, b| a.name().cmp(b.name()));

    println!(
        "{} {}  {} {}",
        "Build".bold(),
        build.uuid.cyan(),
        "namespace".dimmed(),
        build.namespace
    );
    if deploys.is_empty() {
        println!("  {}", "No deploys".dimmed());
        return Ok(());
    }

    for deploy in &deploys {
        print_deploy(deploy);

        if activity {
            for entry in ctx.store.activity(&deploy.uuid).await? {
                println!(
                    "      {} {} {}",
                    entry
                        .at
                        .with_timezone(&Local)
                        .format("%H:%M:%S")
                        .to_string()
                        .dimmed(),
                    status_label(entry.status),
                    entry.message.as_deref().map(|m| one_line(m, 80)).unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn print_deploy(deploy: &Deploy) {
    let marker = if deploy.active { "●".green() } else { "○".dimmed() };
    println!(
        "  {} {:<20} {} {}",
        marker,
        deploy.name().bold(),
        status_label(deploy.status),
        deploy
            .status_message
            .as_deref()
            .map(|m| one_line(m, 80))
            .unwrap_or_default()
    );
    if let Some(image) = &deploy.docker_image {
        println!("      {} {}", "image".dimmed(), image);
    }
}
