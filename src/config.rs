use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_timeout")]
    pub timeout: String,
    #[serde(default = "default_temp_dir_prefix")]
    pub temp_dir_prefix: String,
    /// 工作目录的父目录，未设置时使用系统临时目录
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    #[serde(default = "default_allowed_platforms")]
    pub allowed_platforms: Vec<String>,
    #[serde(default = "default_clone_branch")]
    pub clone_branch: String,
}

/// 外部工具命令行，按空白切分，首项为程序名
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_git")]
    pub git: String,
    #[serde(default = "default_install")]
    pub install: String,
    #[serde(default = "default_eas")]
    pub eas: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_update_script")]
    pub script_path: PathBuf,
    /// 为空时直接执行脚本（依赖脚本自身的 shebang）
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default = "default_update_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub build_token: String,
    #[serde(default)]
    pub update_token: String,
}

impl ServiceConfig {
    /// 加载配置：默认值 < TOML 文件 < 环境变量
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("读取配置文件 {} 失败", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("解析配置文件 {} 失败", path.display()))?
            }
            None => ServiceConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// 用环境变量覆盖配置，空字符串视为未设置
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("SERVER_PORT") {
            match v.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("SERVER_PORT 无效：{v}，保留 {}", self.server.port),
            }
        }
        if let Some(v) = get("SHUTDOWN_GRACE") {
            self.server.shutdown_grace = v;
        }
        if let Some(v) = get("LOG_DIRECTORY") {
            self.log.directory = PathBuf::from(v);
        }
        if let Some(v) = get("LOG_FILE") {
            self.log.file = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = get("BUILD_TIMEOUT") {
            self.build.timeout = v;
        }
        if let Some(v) = get("TEMP_DIR_PREFIX") {
            self.build.temp_dir_prefix = v;
        }
        if let Some(v) = get("TEMP_ROOT") {
            self.build.temp_root = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ALLOWED_PLATFORMS") {
            self.build.allowed_platforms = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = get("DEFAULT_CLONE_BRANCH") {
            self.build.clone_branch = v;
        }
        if let Some(v) = get("GIT_COMMAND") {
            self.tools.git = v;
        }
        if let Some(v) = get("INSTALL_COMMAND") {
            self.tools.install = v;
        }
        if let Some(v) = get("EAS_COMMAND") {
            self.tools.eas = v;
        }
        if let Some(v) = get("UPDATE_SCRIPT_PATH") {
            self.update.script_path = PathBuf::from(v);
        }
        if let Some(v) = get("UPDATE_INTERPRETER") {
            self.update.interpreter = Some(v);
        }
        if let Some(v) = get("UPDATE_TIMEOUT") {
            self.update.timeout = v;
        }
        if let Some(v) = lookup("AUTH_TOKEN") {
            self.auth.build_token = v;
        }
        if let Some(v) = lookup("UPDATE_AUTH_TOKEN") {
            self.auth.update_token = v;
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log.directory.join(&self.log.file)
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        duration_or_default("server.shutdown_grace", &self.shutdown_grace, Duration::from_secs(5))
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        duration_or_default("build.timeout", &self.timeout, Duration::from_secs(60 * 60))
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl UpdateConfig {
    pub fn timeout(&self) -> Duration {
        duration_or_default("update.timeout", &self.timeout, Duration::from_secs(30 * 60))
    }
}

fn duration_or_default(key: &str, raw: &str, fallback: Duration) -> Duration {
    match parse_duration(raw) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("{key} 取值 {raw:?} 无效（{e}），使用默认值 {fallback:?}");
            fallback
        }
    }
}

/// 解析 `90s`、`60m`、`1h30m`、`500ms` 形式的时长
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("时长为空");
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            anyhow::bail!("缺少时间数值：{rest}");
        }
        let num: u64 = rest[..digits].parse().context("无效的时间数值")?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 3600),
            "d" => Duration::from_secs(num * 86400),
            "" => anyhow::bail!("缺少时间单位：{s}"),
            _ => anyhow::bail!("不支持的时间单位: {unit}"),
        };
    }
    Ok(total)
}

/// 把配置里的命令行切分成程序名和参数
pub fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

// 默认值函数
fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_grace() -> String { "5s".into() }
fn default_log_directory() -> PathBuf { PathBuf::from("/home/server/expo-build-service/logs") }
fn default_log_file() -> String { "server.log".into() }
fn default_log_level() -> String { "info".into() }
fn default_build_timeout() -> String { "60m".into() }
fn default_temp_dir_prefix() -> String { "build-".into() }
fn default_allowed_platforms() -> Vec<String> { vec!["android".into(), "ios".into()] }
fn default_clone_branch() -> String { "main".into() }
fn default_git() -> String { "git".into() }
fn default_install() -> String { "npm install".into() }
fn default_eas() -> String { "eas".into() }
fn default_update_script() -> PathBuf { PathBuf::from("/home/server/expo-build-service/update_server.sh") }
fn default_update_timeout() -> String { "30m".into() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout: default_build_timeout(),
            temp_dir_prefix: default_temp_dir_prefix(),
            temp_root: None,
            allowed_platforms: default_allowed_platforms(),
            clone_branch: default_clone_branch(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: default_git(),
            install: default_install(),
            eas: default_eas(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            script_path: default_update_script(),
            interpreter: None,
            timeout: default_update_timeout(),
        }
    }
}
