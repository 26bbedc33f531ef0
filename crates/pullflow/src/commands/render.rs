use crate::context::AppContext;
use colored::Colorize;
use pullflow_deploy::EnvResolver;

pub async fn handle(
    ctx: &AppContext,
    build_uuid: &str,
    template: Option<&str>,
    service: Option<&str>,
) -> anyhow::Result<()> {
    let build = ctx.build(build_uuid).await?;
    let resolver = EnvResolver::new(ctx.store.clone(), ctx.settings.defaults.clone())?;

    if let Some(service) = service {
        let deploy = ctx.deploy(build_uuid, service).await?;
        let resolved = resolver.resolve(&build, &deploy).await?;

        for (key, value) in &resolved.env {
            println!("{}={}", key, value);
        }
        if !resolved.init_env.is_empty() {
            println!("{}", "# init".dimmed());
            for (key, value) in &resolved.init_env {
                println!("{}={}", key, value);
            }
        }
        return Ok(());
    }

    let template = template.ok_or_else(|| anyhow::anyhow!("Nothing to render"))?;
    println!("{}", resolver.render(&build, template).await?);
    Ok(())
}
