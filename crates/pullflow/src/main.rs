mod commands;
mod context;
mod progress;
mod utils;

use clap::{Parser, Subcommand};
use context::AppContext;
use pullflow_core::BuildEngine;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pullflow")]
#[command(about = "pull request ごとのエフェメラル環境をデプロイする", long_about = None)]
#[command(version)]
struct Cli {
    /// 状態スナップショット（デフォルト: ./.pullflow/state.json）
    #[arg(long, global = true, env = "PULLFLOW_STATE")]
    state: Option<PathBuf>,

    /// 設定ファイル（デフォルトは通常の探索順）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// ビルドのトークンプールを表示
    Tokens {
        /// ビルド UUID
        build: String,
        /// JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// テンプレート、またはサービスの env をビルドに対してレンダリング
    Render {
        /// ビルド UUID
        build: String,
        /// テンプレート文字列（例: '{{api_publicUrl}}/health'）
        #[arg(required_unless_present = "service")]
        template: Option<String>,
        /// 代わりにこのサービスの env 全体を解決する
        #[arg(short = 'n', long, conflicts_with = "template")]
        service: Option<String>,
    },
    /// サービスのビルド Job マニフェストを適用せずに表示
    Manifest {
        /// ビルド UUID
        build: String,
        /// サービス名
        service: String,
        /// ビルドするコミット
        #[arg(long)]
        sha: String,
        /// ビルドエンジンを上書き (kaniko, buildkit)
        #[arg(long, value_parser = parse_engine)]
        engine: Option<BuildEngine>,
    },
    /// ビルドの全デプロイをビルド
    Deploy {
        /// ビルド UUID
        build: String,
    },
    /// ビルドのデプロイ状態を表示
    Status {
        /// ビルド UUID
        build: String,
        /// 各デプロイのアクティビティも表示
        #[arg(short, long)]
        activity: bool,
    },
    /// デプロイのビルドログのストリーム先を表示
    Logs {
        /// ビルド UUID
        build: String,
        /// サービス名
        service: String,
        /// 保存済みのビルド出力を表示
        #[arg(long, conflicts_with = "events")]
        stored: bool,
        /// ビルドジョブのクラスタイベントを表示
        #[arg(long)]
        events: bool,
        /// ストリームを 1 コンテナに限定
        #[arg(long)]
        container: Option<String>,
        /// 遡って表示する行数
        #[arg(short = 'l', long)]
        tail: Option<i64>,
    },
}

fn parse_engine(value: &str) -> Result<BuildEngine, String> {
    BuildEngine::parse(value).ok_or_else(|| format!("unknown build engine: {}", value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let ctx = AppContext::load(cli.state, cli.config).await?;

    match cli.command {
        Commands::Tokens { build, json } => {
            commands::tokens::handle(&ctx, &build, json).await?;
        }
        Commands::Render {
            build,
            template,
            service,
        } => {
            commands::render::handle(&ctx, &build, template.as_deref(), service.as_deref())
                .await?;
        }
        Commands::Manifest {
            build,
            service,
            sha,
            engine,
        } => {
            commands::manifest::handle(&ctx, &build, &service, &sha, engine).await?;
        }
        Commands::Deploy { build } => {
            commands::deploy::handle(&ctx, &build).await?;
        }
        Commands::Status { build, activity } => {
            commands::status::handle(&ctx, &build, activity).await?;
        }
        Commands::Logs {
            build,
            service,
            stored,
            events,
            container,
            tail,
        } => {
            let options = commands::logs::LogsOptions {
                stored,
                events,
                container,
                tail,
            };
            commands::logs::handle(&ctx, &build, &service, options).await?;
        }
    }

    Ok(())
}
