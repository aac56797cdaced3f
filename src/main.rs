//! ViralGen 命令行
//!
//! 入口：初始化日志、加载配置，执行一次趋势查询 / 视频生成 / 上传，并以 JSON 打印结果。

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use viralgen::core::create_automation_builder;
use viralgen::tasks::trends::parse_seeds;
use viralgen::tasks::{Platform, UploadRequest};

#[derive(Parser, Debug)]
#[command(name = "viralgen", version, about = "Trend discovery, video generation and social upload automation")]
struct Cli {
    /// 额外的 TOML 配置文件
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 查询种子词的热门相关查询
    Trend {
        /// 逗号分隔的种子词；缺省用配置中的 default_seeds
        #[arg(long)]
        seeds: Option<String>,
        /// 逗号分隔的代理
        #[arg(long)]
        proxies: Option<String>,
    },
    /// 用 Grok Imagine 生成视频
    Grok {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        headless: Option<bool>,
        #[arg(long)]
        proxies: Option<String>,
    },
    /// 发布视频到 TikTok / Instagram
    Upload {
        #[arg(long)]
        video: PathBuf,
        #[arg(long, default_value = "tiktok")]
        platform: String,
        #[arg(long, default_value = "")]
        caption: String,
        /// 会话槽位（cookies 文件路径）
        #[arg(long)]
        cookies: Option<String>,
        #[arg(long)]
        headless: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    viralgen::observability::init();

    let cli = Cli::parse();
    let builder = create_automation_builder(cli.config);

    let output = match cli.command {
        Command::Trend { seeds, proxies } => {
            let seeds = match seeds {
                Some(s) => parse_seeds(&s),
                None => builder.config().trends.default_seeds.clone(),
            };
            let scout = builder.trend_scout(builder.proxies_for(proxies.as_deref()));
            let trend = scout.top_trend(&seeds).await;
            serde_json::json!({ "trend": trend })
        }
        Command::Grok {
            prompt,
            headless,
            proxies,
        } => {
            let generator = builder.content_generator(builder.proxies_for(proxies.as_deref()), headless)?;
            let result = generator.generate(&prompt).await.context("Grok generation failed")?;
            serde_json::json!({ "ok": true, "result": result })
        }
        Command::Upload {
            video,
            platform,
            caption,
            cookies,
            headless,
        } => {
            let platform: Platform = platform.parse()?;
            let mut request = UploadRequest::new(video, caption, platform);
            if let Some(cookies) = cookies {
                request = request.with_cookies(cookies);
            }
            let uploader = builder.social_uploader(builder.shared_proxies(), headless)?;
            let result = uploader.upload(&request).await.context("Upload failed")?;
            serde_json::json!({ "ok": true, "result": result })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
