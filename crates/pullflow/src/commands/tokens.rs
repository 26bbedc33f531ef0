use crate::context::AppContext;
use colored::Colorize;
use pullflow_core::restore_hyphens;
use pullflow_deploy::EnvResolver;
use std::collections::BTreeMap;

pub async fn handle(ctx: &AppContext, build_uuid: &str, json: bool) -> anyhow::Result<()> {
    let build = ctx.build(build_uuid).await?;
    let resolver = EnvResolver::new(ctx.store.clone(), ctx.settings.defaults.clone())?;

    let tokens: BTreeMap<String, String> = resolver
        .tokens(&build)
        .await?
        .into_iter()
        .map(|(key, value)| (restore_hyphens(&key), value))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&tokens)?);
        return Ok(());
    }

    println!(
        "{} {} ({} tokens)",
        "Build".bold(),
        build.uuid.cyan(),
        tokens.len()
    );
    for (key, value) in &tokens {
        println!("  {} = {}", key.bold(), value);
    }
    Ok(())
}
