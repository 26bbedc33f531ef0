//! env テンプレートのレンダリング
//!
//! テンプレートは `{{{service_property}}}` プレースホルダーで他サービスを参照する
//! （二重波括弧も受け付けて正規化する）。解決順:
//!
//! 1. 値が既知の `*_internalHostname` はクラスタ FQDN
//!    `{host}{suffix}.{namespace}.{cluster_domain}{remainder}` になる
//! 2. その他の既知の値はそのまま置換
//! 3. 未解決の `*_UUID` / `*_internalHostname` / `*_publicUrl` は
//!    デフォルト環境にフォールバック
//! 4. 残りは Tera で処理し、未知の名前は空文字になる
//!
//! Tera の識別子にハイフンは使えないため、レンダリング中はサービス名を
//! [`HYPHEN_SENTINEL`] でエスケープし、最後に戻す。

pub mod tokens;

use crate::error::{CoreError, Result};
use crate::model::ClusterDefaults;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use tera::{Context, Tera};

pub use tokens::*;

/// トークン名中の `-` の代替
pub const HYPHEN_SENTINEL: &str = "__HYPH__";

/// `no-default-env` 機能が有効なときの、解決できない
/// デフォルト環境トークンの値
pub const NO_DEFAULT_ENV: &str = "no-default-env";

const UUID_SUFFIX: &str = "_UUID";
const INTERNAL_HOSTNAME_SUFFIX: &str = "_internalHostname";
const PUBLIC_URL_SUFFIX: &str = "_publicUrl";

/// `{{x}}`, `{{ x }}`, `{{{x}}}`
const BRACES_PATTERN: &str = r"\{\{\{?\s*([^{}\s]+)\s*\}?\}\}";

/// プレースホルダー、最初の `:`/`/` までのサフィックス、残り
const PLACEHOLDER_PATTERN: &str =
    r#"\{\{\{([^{}\s]+)\}\}\}([^:/"'\s{}]*)((?:[:/][^"'\s{}]*)?)"#;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

/// テンプレート識別子として有効になるようハイフンを置換
pub fn escape_hyphens(name: &str) -> String {
    name.replace('-', HYPHEN_SENTINEL)
}

pub fn restore_hyphens(name: &str) -> String {
    name.replace(HYPHEN_SENTINEL, "-")
}

/// 呼び出しごとのレンダリング入力
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub tokens: &'a BTreeMap<String, String>,
    /// レンダリング対象ビルドの UUID
    pub build_uuid: &'a str,
    pub active_namespace: &'a str,
    /// このビルドに属さないホスト名はベースラインの名前空間で解決する
    pub use_default_namespace: bool,
    pub no_default_env: bool,
}

/// トークン辞書に対して env テンプレートをレンダリング
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    defaults: ClusterDefaults,
    braces: Regex,
    placeholder: Regex,
    identifier: Regex,
}

impl TemplateRenderer {
    pub fn new(defaults: ClusterDefaults) -> Result<Self> {
        Ok(Self {
            defaults,
            braces: compile(BRACES_PATTERN)?,
            placeholder: compile(PLACEHOLDER_PATTERN)?,
            identifier: compile(IDENTIFIER_PATTERN)?,
        })
    }

    pub fn defaults(&self) -> &ClusterDefaults {
        &self.defaults
    }

    /// テンプレート文字列を 1 つレンダリング
    pub fn render(&self, template: &str, ctx: &RenderContext<'_>) -> Result<String> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }

        let normalized = self.normalize_placeholders(template);

        let substituted = self.placeholder.replace_all(&normalized, |caps: &Captures| {
            self.resolve_placeholder(caps, ctx)
        });

        let rendered = if substituted.contains("{{{") {
            self.render_remaining(&substituted, ctx.tokens)?
        } else {
            substituted.into_owned()
        };

        Ok(restore_hyphens(&rendered))
    }

    /// env マップの全値をレンダリング
    pub fn render_env(
        &self,
        env: &BTreeMap<String, String>,
        ctx: &RenderContext<'_>,
    ) -> Result<BTreeMap<String, String>> {
        env.iter()
            .map(|(key, template)| {
                let value = self.render(template, ctx).map_err(|e| match e {
                    CoreError::TemplateRenderError(msg) => {
                        CoreError::TemplateRenderError(format!("{key}: {msg}"))
                    }
                    other => other,
                })?;
                Ok((key.clone(), value))
            })
            .collect()
    }

    fn resolve_placeholder(&self, caps: &Captures<'_>, ctx: &RenderContext<'_>) -> String {
        let whole = &caps[0];
        let name = &caps[1];
        let suffix = &caps[2];
        let remainder = &caps[3];

        let known = ctx.tokens.get(name).filter(|v| !v.is_empty());

        if let Some(value) = known {
            if name.ends_with(INTERNAL_HOSTNAME_SUFFIX) {
                return self.qualify_hostname(value, suffix, remainder, ctx);
            }
            return format!("{value}{suffix}{remainder}");
        }

        if name.ends_with(UUID_SUFFIX) {
            let uuid = if ctx.no_default_env {
                NO_DEFAULT_ENV
            } else {
                self.defaults.default_uuid.as_str()
            };
            return format!("{uuid}{suffix}{remainder}");
        }

        if let Some(service) = name.strip_suffix(INTERNAL_HOSTNAME_SUFFIX) {
            if ctx.no_default_env {
                return format!("{NO_DEFAULT_ENV}{suffix}{remainder}");
            }
            return format!(
                "{}{}.{}.{}{}",
                restore_hyphens(service),
                suffix,
                self.defaults.baseline_namespace(),
                self.defaults.cluster_domain,
                remainder
            );
        }

        if let Some(service) = name.strip_suffix(PUBLIC_URL_SUFFIX) {
            return format!(
                "{}{}{}",
                self.defaults.default_public_url(&restore_hyphens(service)),
                suffix,
                remainder
            );
        }

        // 汎用パスに任せる
        whole.to_string()
    }

    /// `backend-abc123` -> `backend.env-abc123.svc.cluster.local`
    fn qualify_hostname(
        &self,
        value: &str,
        suffix: &str,
        remainder: &str,
        ctx: &RenderContext<'_>,
    ) -> String {
        if value == NO_DEFAULT_ENV {
            return format!("{value}{suffix}{remainder}");
        }

        let belongs_to_build = !ctx.build_uuid.is_empty() && value.contains(ctx.build_uuid);
        let (host, namespace) = if belongs_to_build || !ctx.use_default_namespace {
            (
                strip_uuid(value, ctx.build_uuid),
                ctx.active_namespace.to_string(),
            )
        } else {
            (
                strip_uuid(value, &self.defaults.default_uuid),
                self.defaults.baseline_namespace(),
            )
        };

        format!(
            "{}{}.{}.{}{}",
            host, suffix, namespace, self.defaults.cluster_domain, remainder
        )
    }

    /// 独自ルールで残ったプレースホルダーを Tera で処理
    fn render_remaining(
        &self,
        template: &str,
        tokens: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut context = Context::new();
        for (key, value) in tokens {
            if self.identifier.is_match(key) {
                context.insert(key.as_str(), value);
            }
        }

        let mut source = String::with_capacity(template.len() + 64);
        let mut last = 0;
        for caps in self.placeholder.captures_iter(template) {
            let Some(m) = caps.get(0) else { continue };
            push_literal(&mut source, &template[last..m.start()]);

            let name = &caps[1];
            if self.identifier.is_match(name) {
                source.push_str(&format!("{{{{ {name} | default(value=\"\") }}}}"));
            } else {
                let value = tokens.get(name).map(String::as_str).unwrap_or_default();
                push_literal(&mut source, value);
            }
            push_literal(&mut source, &caps[2]);
            push_literal(&mut source, &caps[3]);
            last = m.end();
        }
        push_literal(&mut source, &template[last..]);

        Tera::one_off(&source, &context, false)
            .map_err(|e| CoreError::TemplateRenderError(extract_tera_error_detail(&e)))
    }

    /// 三重波括弧に正規化し、プレースホルダー名中のハイフンをエスケープ
    fn normalize_placeholders(&self, template: &str) -> String {
        self.braces
            .replace_all(template, |caps: &Captures| {
                format!("{{{{{{{}}}}}}}", escape_hyphens(&caps[1]))
            })
            .into_owned()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| CoreError::InvalidConfig(format!("regex compile error: {}", e)))
}

fn strip_uuid<'v>(value: &'v str, uuid: &str) -> &'v str {
    if uuid.is_empty() {
        return value;
    }
    value
        .strip_suffix(uuid)
        .and_then(|rest| rest.strip_suffix('-'))
        .filter(|host| !host.is_empty())
        .unwrap_or(value)
}

/// Tera に解釈させないリテラル
fn push_literal(out: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if text.contains("{{") || text.contains("{%") || text.contains("{#") {
        out.push_str("{% raw %}");
        out.push_str(text);
        out.push_str("{% endraw %}");
    } else {
        out.push_str(text);
    }
}

/// Tera エラーとその source チェーンを平坦化
fn extract_tera_error_detail(e: &tera::Error) -> String {
    use std::error::Error;

    let mut details = vec![e.to_string()];
    let mut source = e.source();
    while let Some(err) = source {
        details.push(err.to_string());
        source = err.source();
    }

    let full_error = details.join(" | ");

    if full_error.contains("not found in context")
        && let Some(start) = full_error.find("Variable `")
        && let Some(end) = full_error[start..].find("` not found")
    {
        let var_name = &full_error[start + 10..start + end];
        return format!("undefined token: `{}`", restore_hyphens(var_name));
    }

    full_error
}
