use super::StageError;
use crate::build::platform::Platform;
use crate::config::split_command;
use crate::process::{self, CommandSpec, RunContext};
use std::path::{Path, PathBuf};

/// 执行 `eas build --local` 生成安装包，返回产物路径
///
/// 平台在启动任何进程之前校验。进程成功退出后还要确认产物确实存在，
/// 防止构建工具静默失败却返回 0。
pub async fn build_app(
    eas: &str,
    package_dir: &Path,
    platform: &str,
    allowed_platforms: &[String],
    output_file: &str,
    ctx: &RunContext,
) -> Result<PathBuf, StageError> {
    let platform = Platform::parse(platform, allowed_platforms)
        .ok_or_else(|| StageError::UnsupportedPlatform(platform.to_string()))?;
    let (program, base_args) = split_command(eas).ok_or(StageError::ToolNotConfigured("eas"))?;

    let spec = CommandSpec::new(program)
        .args(base_args)
        .args(["build", "--platform", platform.as_str(), "--local", "--output", output_file])
        .current_dir(package_dir);
    process::run(&spec, ctx).await?;

    let artifact = package_dir.join(output_file);
    if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
        return Err(StageError::ArtifactMissing(artifact));
    }
    Ok(artifact)
}
