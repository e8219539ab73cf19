use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use codepal_core_sdk::{
    config::AppConfig,
    context::{self, SYSTEM_PROMPT},
    execution::SubmissionInput,
    gateway::CompletionRequest,
    models::{CodeContext, InlineImage, ProblemContext},
    registry::{ProviderId, Registry},
    server::{self, AppState},
    telemetry,
    vault::{SaveOutcome, StorageMode},
};

/**
 * \brief CLI 程序入口：密钥管理、对话、代码执行与本地服务。
 */
#[derive(Parser, Debug)]
#[command(name = "codepal", version, about = "Coding-practice companion core")]
struct Cli {
    /** \brief 当前用户标识 */
    #[arg(long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 列出支持的模型服务及默认模型。
     */
    Providers,

    /**
     * \brief 管理模型服务密钥。
     */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief 携带题目与代码上下文发起一次对话。
     */
    Chat {
        #[arg(long)]
        provider: ProviderId,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "")]
        model: String,
        /** \brief 本地模式下直接提供密钥 */
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value = "unset")]
        mode: StorageMode,
        #[arg(long)]
        problem_title: Option<String>,
        /** \brief 题目描述文件 */
        #[arg(long)]
        problem_file: Option<String>,
        /** \brief 题目截图（png/jpeg/webp） */
        #[arg(long)]
        problem_image: Option<String>,
        #[arg(long)]
        code_file: Option<String>,
        #[arg(long, default_value = "plaintext")]
        language: String,
    },

    /**
     * \brief 提交源码到执行后端并打印结果。
     */
    Run {
        #[arg(long)]
        file: String,
        #[arg(long)]
        language_id: u32,
        #[arg(long)]
        memory_limit_kb: Option<u32>,
        #[arg(long)]
        time_limit_seconds: Option<f64>,
    },

    /**
     * \brief 列出编辑器可用的执行语言。
     */
    Languages,

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /** \brief 保存密钥：persisted 加密保存在服务端，ephemeral 仅清除服务端副本。 */
    Set {
        #[arg(long)]
        provider: ProviderId,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "persisted")]
        mode: StorageMode,
    },
    /** \brief 查看保存状态（不显示密钥）。 */
    Status {
        #[arg(long)]
        provider: Option<ProviderId>,
    },
    /** \brief 设置默认模型。 */
    Model {
        #[arg(long)]
        provider: ProviderId,
        #[arg(long)]
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Providers = cli.command {
        // 列表不依赖密钥配置，仅在可用时应用地址覆盖
        let overrides = AppConfig::from_env()
            .map(|c| c.provider_base_urls)
            .unwrap_or_default();
        print_providers(&Registry::with_overrides(&overrides));
        return Ok(());
    }

    let config = AppConfig::from_env().context("load configuration failed")?;
    telemetry::set_log_dir(&config.log_dir);
    telemetry::set_enabled(config.telemetry_enabled);

    let owner = cli.user;
    match cli.command {
        Commands::Providers => {}
        Commands::Key { action } => {
            let state = AppState::from_config(&config)?;
            match action {
                KeyAction::Set {
                    provider,
                    api_key,
                    mode,
                } => match state
                    .vault
                    .save(&owner, provider, &api_key, mode)
                    .with_context(|| format!("save key for {} failed", provider))?
                {
                    SaveOutcome::Persisted => {
                        println!("Saved {} key (encrypted, stored on server)", provider)
                    }
                    SaveOutcome::ReturnedToCaller(_) => println!(
                        "Cleared stored {} key; pass it with --api-key when chatting",
                        provider
                    ),
                },
                KeyAction::Status { provider } => {
                    let providers = match provider {
                        Some(p) => vec![p],
                        None => ProviderId::ALL.to_vec(),
                    };
                    for p in providers {
                        let mode = state.vault.stored_mode(&owner, p)?;
                        let model = state.vault.default_model(&owner, p)?;
                        println!(
                            "{:<11} storage={:<9} model={}",
                            p.as_str(),
                            mode.as_db(),
                            model.as_deref().unwrap_or("-")
                        );
                    }
                }
                KeyAction::Model { provider, model } => {
                    state
                        .vault
                        .set_default_model(&owner, provider, &model)
                        .context("save default model failed")?;
                    println!("Default model for {} set to {}", provider, model);
                }
            }
        }
        Commands::Chat {
            provider,
            prompt,
            model,
            api_key,
            mode,
            problem_title,
            problem_file,
            problem_image,
            code_file,
            language,
        } => {
            let state = AppState::from_config(&config)?;
            let problem = load_problem(problem_title, problem_file, problem_image)?;
            let code = match code_file {
                Some(path) => Some(CodeContext {
                    source_code: std::fs::read_to_string(&path)
                        .with_context(|| format!("read code file {} failed", path))?,
                    language_tag: language,
                }),
                None => None,
            };
            let messages = context::assemble(
                SYSTEM_PROMPT,
                problem.as_ref(),
                code.as_ref(),
                &[],
                &prompt,
            );
            telemetry::log_event(
                "cli.chat",
                &format!(
                    "provider={} owner={} prompt_len={}",
                    provider,
                    owner,
                    prompt.len()
                ),
            );
            let request = CompletionRequest {
                owner,
                provider,
                model,
                messages,
                supplied_key: api_key,
                mode,
            };
            let cancel = cancel_on_ctrl_c();
            let reply = state.gateway.reply(&request, &cancel).await;
            println!("{}", reply.text);
        }
        Commands::Run {
            file,
            language_id,
            memory_limit_kb,
            time_limit_seconds,
        } => {
            let state = AppState::from_config(&config)?;
            let source_code = std::fs::read_to_string(&file)
                .with_context(|| format!("read source file {} failed", file))?;
            let orchestrator = state.orchestrator();
            let cancel = cancel_on_ctrl_c();
            let outcome = match orchestrator
                .submit(
                    &owner,
                    SubmissionInput {
                        source_code,
                        language_id,
                        memory_limit_kb,
                        time_limit_seconds,
                    },
                    &cancel,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => bail!("{}", err.user_message()),
            };
            if let Some(stdout) = outcome.result.stdout.as_deref() {
                print!("{}", stdout);
            }
            match outcome.banner() {
                Some(banner) => {
                    eprintln!("[{}] {}", banner.category, banner.description);
                    if let Some(detail) = banner.detail {
                        eprintln!("{}", detail);
                    }
                }
                None => eprintln!(
                    "[{}] time={}s memory={}KB",
                    outcome.status.description(),
                    outcome.result.time.as_deref().unwrap_or("-"),
                    outcome
                        .result
                        .memory
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "-".to_string())
                ),
            }
        }
        Commands::Languages => {
            let state = AppState::from_config(&config)?;
            let languages = match state.languages(&owner).await {
                Ok(languages) => languages,
                Err(err) => bail!("{}", err.user_message()),
            };
            for lang in languages {
                println!("{:>4}  {}", lang.id, lang.name);
            }
        }
        Commands::Serve { addr } => {
            server::run(&addr, &config).await?;
        }
    }

    Ok(())
}

fn print_providers(registry: &Registry) {
    for p in registry.all() {
        println!(
            "{:<11} {:<12} default={:<26} base={}",
            p.id.as_str(),
            p.display_name,
            p.default_model,
            p.endpoint()
        );
    }
}

fn load_problem(
    title: Option<String>,
    description_file: Option<String>,
    image_file: Option<String>,
) -> Result<Option<ProblemContext>> {
    if title.is_none() && description_file.is_none() && image_file.is_none() {
        return Ok(None);
    }
    let description = match description_file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("read problem file {} failed", path))?,
        None => String::new(),
    };
    let image = match image_file {
        Some(path) => {
            let mime = match std::path::Path::new(&path)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .as_deref()
            {
                Some("png") => "image/png",
                Some("jpg") | Some("jpeg") => "image/jpeg",
                Some("webp") => "image/webp",
                _ => bail!("unsupported image type: {}", path),
            };
            let bytes =
                std::fs::read(&path).with_context(|| format!("read image {} failed", path))?;
            Some(InlineImage::from_bytes(mime, &bytes))
        }
        None => None,
    };
    Ok(Some(ProblemContext {
        title: title.unwrap_or_default(),
        description,
        image,
    }))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}
