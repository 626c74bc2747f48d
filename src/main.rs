use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod api;
mod build;
mod check;
mod config;
mod error;
mod logging;
mod logstream;
mod process;
mod state;
mod update;

/// 宽限期结束、取消构建后再等待连接关闭的时间
const FORCED_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "expo-build-service", about = "Expo 应用远程构建服务", version = long_version())]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动构建服务
    Serve {
        /// TOML 配置文件（可选，环境变量优先）
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// 监听地址
        #[arg(long)]
        host: Option<String>,

        /// 监听端口
        #[arg(long)]
        port: Option<u16>,
    },

    /// 检查运行环境与配置
    Check {
        /// TOML 配置文件
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // None 等同于 Serve { config: None, host: None, port: None }
    let command = cli.command.unwrap_or(Commands::Serve {
        config: None,
        host: None,
        port: None,
    });

    match command {
        Commands::Serve { config, host, port } => {
            let mut service_config = config::ServiceConfig::load(config.as_deref())?;
            if let Some(host) = host {
                service_config.server.host = host;
            }
            if let Some(port) = port {
                service_config.server.port = port;
            }
            logging::init(&service_config)?;

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(run_server(service_config))?;
        }
        Commands::Check { config } => {
            let service_config = config::ServiceConfig::load(config.as_deref())?;
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&service_config.log.level)),
                )
                .init();

            let result = check::run(&service_config);

            for w in &result.warnings {
                tracing::warn!("{w}");
            }
            for e in &result.errors {
                tracing::error!("{e}");
            }

            if result.errors.is_empty() {
                tracing::info!("检查通过（{} 个警告）", result.warnings.len());
            } else {
                anyhow::bail!(
                    "检查未通过：{} 个错误，{} 个警告",
                    result.errors.len(),
                    result.warnings.len()
                );
            }
        }
    }

    Ok(())
}

async fn run_server(service_config: config::ServiceConfig) -> anyhow::Result<()> {
    let host = service_config.server.host.clone();
    let port = service_config.server.port;
    let grace = service_config.server.shutdown_grace();

    if service_config.auth.build_token.is_empty() {
        tracing::warn!("AUTH_TOKEN 未设置，所有 /build 请求都会被拒绝");
    }
    if service_config.auth.update_token.is_empty() {
        tracing::warn!("UPDATE_AUTH_TOKEN 未设置，所有 /update 请求都会被拒绝");
    }

    let app_state = state::AppState::new(service_config);
    let app = api::router(app_state.clone());

    let addr = format!("{host}:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if let Some(info) = port_owner(port) {
                tracing::error!("端口 {port} 已被占用：{info}");
            } else {
                tracing::error!("端口 {port} 已被占用");
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!("构建服务启动：http://{}", addr);

    let result = serve_until_shutdown(listener, app, &app_state, grace).await;
    // 运行时销毁会连带终止更新脚本的进程组
    app_state.updates.wait_idle().await;
    result
}

async fn serve_until_shutdown(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    app_state: &state::AppState,
    grace: Duration,
) -> anyhow::Result<()> {
    let stop_accepting = CancellationToken::new();
    tokio::spawn(wait_for_signal(stop_accepting.clone()));

    let server = axum::serve(listener, app).with_graceful_shutdown(stop_accepting.clone().cancelled_owned());
    let mut server = std::pin::pin!(server.into_future());

    tokio::select! {
        result = &mut server => return result.map_err(Into::into),
        _ = stop_accepting.cancelled() => {}
    }

    // 停止接受新连接后，给进行中的构建一个宽限期
    tracing::info!("收到退出信号，等待进行中的请求（最多 {:?}）", grace);
    if let Ok(result) = tokio::time::timeout(grace, &mut server).await {
        return result.map_err(Into::into);
    }

    tracing::warn!("宽限期已过，终止所有进行中的构建");
    app_state.shutdown.cancel();
    match tokio::time::timeout(FORCED_SHUTDOWN_WAIT, &mut server).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::warn!("仍有连接未关闭，强制退出");
            Ok(())
        }
    }
}

/// Ctrl-C 或 SIGTERM 触发优雅关闭
async fn wait_for_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("监听 Ctrl-C 失败：{e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("监听 SIGTERM 失败：{e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    token.cancel();
}

/// 端口被占用时通过 /proc 找出监听该端口的进程（仅 Linux）
fn port_owner(port: u16) -> Option<String> {
    let port_hex = format!(":{port:04X}");
    let inode = ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|f| std::fs::read_to_string(f).ok())
        .flat_map(|content| {
            content
                .lines()
                .skip(1)
                .map(|l| l.split_whitespace().map(str::to_string).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        })
        // 第 2 列本地地址，第 4 列状态（0A 为 LISTEN），第 10 列 inode
        .find(|cols| cols.len() > 9 && cols[3] == "0A" && cols[1].ends_with(&port_hex))
        .map(|cols| cols[9].clone())?;

    let socket = format!("socket:[{inode}]");
    std::fs::read_dir("/proc").ok()?.flatten().find_map(|proc_entry| {
        let pid = proc_entry.file_name().to_string_lossy().into_owned();
        if !pid.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let owns = std::fs::read_dir(proc_entry.path().join("fd"))
            .ok()?
            .flatten()
            .any(|fd| std::fs::read_link(fd.path()).is_ok_and(|l| l.to_string_lossy() == socket));
        owns.then(|| {
            let comm = std::fs::read_to_string(proc_entry.path().join("comm")).unwrap_or_default();
            format!("PID {pid} ({})", comm.trim())
        })
    })
}

const fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        "\ncommit:  ",
        env!("EXPO_BUILD_COMMIT"),
        "\nbuild:   ",
        env!("EXPO_BUILD_TIME"),
        "\ntarget:  ",
        env!("EXPO_BUILD_TARGET"),
        "\nprofile: ",
        env!("EXPO_BUILD_PROFILE"),
    )
}
