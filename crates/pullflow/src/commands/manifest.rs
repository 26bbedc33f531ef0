use crate::context::AppContext;
use pullflow_build::{BackendProfile, create_build_job, image_tag, init_image_tag};
use pullflow_core::BuildEngine;
use pullflow_deploy::{BuildTarget, EnvResolver, build_job_spec};

/// `service` のデプロイが作成する Job を YAML で表示
pub async fn handle(
    ctx: &AppContext,
    build_uuid: &str,
    service: &str,
    sha: &str,
    engine: Option<BuildEngine>,
) -> anyhow::Result<()> {
    let build = ctx.build(build_uuid).await?;
    let deploy = ctx.deploy(build_uuid, service).await?;

    let (owner, repo) = deploy
        .service
        .owner_and_repo()
        .ok_or_else(|| anyhow::anyhow!("Service '{}' has no source repository", service))?;
    let registry = ctx.settings.registry()?.to_string();

    let resolver = EnvResolver::new(ctx.store.clone(), ctx.settings.defaults.clone())?;
    let resolved = resolver.resolve(&build, &deploy).await?;

    let image_repo = format!("{}/{}", registry, deploy.service.name);
    let image = format!("{}:{}", image_repo, image_tag(sha, &resolved.env));
    let init_image = deploy
        .service
        .init_dockerfile_path
        .as_ref()
        .map(|_| format!("{}:{}", image_repo, init_image_tag(sha, &resolved.init_env)));

    let target = BuildTarget {
        owner: owner.to_string(),
        repo: repo.to_string(),
        branch: deploy.branch_name.clone().unwrap_or_default(),
        sha: sha.to_string(),
        registry,
        image,
        init_image,
    };

    let engine = engine
        .or(deploy.service.builder)
        .unwrap_or(ctx.settings.build.engine);
    let profile = BackendProfile::for_engine(engine, &ctx.settings.build);
    let spec = build_job_spec(&ctx.settings.build, &build, &deploy, profile, &target, None);

    print!("{}", serde_yaml::to_string(&create_build_job(&spec))?);
    Ok(())
}
