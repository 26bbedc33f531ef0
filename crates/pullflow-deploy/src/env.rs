//! 1 デプロイ分の env 解決
//!
//! デプロイが属するビルドのトークンプールを構築し、サービスの生の
//! env と init-env テンプレートをそれに対してレンダリングする。

use crate::error::Result;
use pullflow_core::{
    Build, ClusterDefaults, Deploy, DeployStore, RenderContext, TemplateRenderer, TokenBuilder,
    Tokens, build_extras,
};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnv {
    pub env: BTreeMap<String, String>,
    pub init_env: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct EnvResolver {
    store: Arc<dyn DeployStore>,
    renderer: Arc<TemplateRenderer>,
}

impl EnvResolver {
    pub fn new(store: Arc<dyn DeployStore>, defaults: ClusterDefaults) -> Result<Self> {
        Ok(Self {
            store,
            renderer: Arc::new(TemplateRenderer::new(defaults)?),
        })
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    /// `build` のトークンプール。毎回ストアから作り直す
    pub async fn tokens(&self, build: &Build) -> Result<Tokens> {
        let deploys = self.store.list_deploys(&build.uuid).await?;
        let builder = TokenBuilder::new(self.renderer.defaults());
        Ok(builder
            .build_tokens(self.store.as_ref(), build, &deploys, &build_extras(build))
            .await?)
    }

    /// `build` のコンテキストでテンプレートを 1 つレンダリング
    pub async fn render(&self, build: &Build, template: &str) -> Result<String> {
        let tokens = self.tokens(build).await?;
        Ok(self.renderer.render(template, &render_context(build, &tokens))?)
    }

    #[tracing::instrument(skip(self, build, deploy), fields(deploy = %deploy.uuid))]
    pub async fn resolve(&self, build: &Build, deploy: &Deploy) -> Result<ResolvedEnv> {
        let tokens = self.tokens(build).await?;
        let ctx = render_context(build, &tokens);

        let env = self.renderer.render_env(&deploy.service.env, &ctx)?;
        let init_env = self.renderer.render_env(&deploy.service.init_env, &ctx)?;

        tracing::debug!(
            tokens = tokens.len(),
            env = env.len(),
            init_env = init_env.len(),
            "Resolved env"
        );
        Ok(ResolvedEnv { env, init_env })
    }
}

fn render_context<'a>(build: &'a Build, tokens: &'a Tokens) -> RenderContext<'a> {
    RenderContext {
        tokens,
        build_uuid: &build.uuid,
        active_namespace: &build.namespace,
        use_default_namespace: build.use_default_uuid,
        no_default_env: build.no_default_env(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullflow_core::{MemoryStore, ServiceDefinition};

    #[tokio::test]
    async fn test_resolves_cross_service_hostname() {
        let store = Arc::new(MemoryStore::new());
        let build = Build::new("abc123");
        store.insert_build(build.clone()).await;

        let backend = Deploy::new(ServiceDefinition::new("backend"), "abc123", true);
        let mut web = ServiceDefinition::new("web");
        web.env.insert(
            "API_URL".to_string(),
            "http://{{{backend_internalHostname}}}:8080".to_string(),
        );
        web.env
            .insert("PR".to_string(), "pr-{{pullRequestNumber}}".to_string());
        let web = Deploy::new(web, "abc123", true);
        store.insert_deploy(backend).await;
        store.insert_deploy(web.clone()).await;

        let resolver = EnvResolver::new(store, ClusterDefaults::default()).unwrap();
        let resolved = resolver.resolve(&build, &web).await.unwrap();

        assert_eq!(
            resolved.env.get("API_URL").map(String::as_str),
            Some("http://backend.env-abc123.svc.cluster.local:8080")
        );
        assert_eq!(resolved.env.get("PR").map(String::as_str), Some("pr-"));
        assert!(resolved.init_env.is_empty());
    }

    #[tokio::test]
    async fn test_render_single_template() {
        let store = Arc::new(MemoryStore::new());
        let build = Build::new("abc123");
        store.insert_build(build.clone()).await;

        let resolver = EnvResolver::new(store, ClusterDefaults::default()).unwrap();
        let rendered = resolver.render(&build, "ns={{namespace}}").await.unwrap();
        assert_eq!(rendered, "ns=env-abc123");
    }
}
