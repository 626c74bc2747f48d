use super::StageError;
use crate::config::split_command;
use crate::process::{self, CommandSpec, RunContext};
use std::path::Path;

/// 仓库地址的注入过滤
///
/// 地址作为独立参数传给 git 而不经过 shell，这里只拦截明显的命令分隔符
/// 与以 `-` 开头的选项注入，并不是完整的 URL 校验。
pub fn validate_repo_url(url: &str) -> Result<(), StageError> {
    let url = url.trim();
    if url.is_empty() || url.contains([';', '&']) || url.starts_with('-') {
        return Err(StageError::InvalidRepoUrl);
    }
    Ok(())
}

/// 浅克隆指定分支到 `dest`
pub async fn clone_repository(
    git: &str,
    repo_url: &str,
    branch: &str,
    dest: &Path,
    ctx: &RunContext,
) -> Result<(), StageError> {
    validate_repo_url(repo_url)?;
    let (program, base_args) = split_command(git).ok_or(StageError::ToolNotConfigured("git"))?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let spec = CommandSpec::new(program)
        .args(base_args)
        .args(["clone", "--depth", "1", "--single-branch", "--branch", branch, "--"])
        .arg(repo_url.trim())
        .arg(dest.to_string_lossy())
        // 禁止 git 交互式询问凭据，否则会一直挂到超时
        .env("GIT_TERMINAL_PROMPT", "0");

    process::run(&spec, ctx).await?;

    if !dest.is_dir() {
        return Err(StageError::CloneMissing(dest.to_path_buf()));
    }
    Ok(())
}
