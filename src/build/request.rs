use crate::build::platform::Platform;
use crate::build::stages::fetch::validate_repo_url;
use crate::error::JobError;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

/// 请求体的原始形态，字段缺失或为 null 时统一按“缺少参数”处理
#[derive(Debug, Default, Deserialize)]
struct RawBuildRequest {
    #[serde(default)]
    repo_url: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    package_path: Option<String>,
    #[serde(default)]
    update_server: Option<bool>,
}

/// 校验通过后的构建请求，解析后不再修改
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub repo_url: String,
    pub platform: Platform,
    pub package_path: PathBuf,
    pub update_server: bool,
}

impl BuildRequest {
    /// 解析并校验请求体；任何失败都发生在创建工作目录和启动进程之前
    pub fn parse(body: &[u8], allowed_platforms: &[String]) -> Result<Self, JobError> {
        let raw: RawBuildRequest = serde_json::from_slice(body).map_err(JobError::InvalidPayload)?;

        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let (Some(repo_url), Some(platform), Some(package_path)) = (
            non_empty(raw.repo_url),
            non_empty(raw.platform),
            non_empty(raw.package_path),
        ) else {
            return Err(JobError::MissingParameters);
        };

        let platform = Platform::parse(&platform, allowed_platforms)
            .ok_or(JobError::UnsupportedPlatform(platform))?;
        validate_repo_url(&repo_url).map_err(|_| JobError::InvalidRepoUrl)?;
        let package_path = validate_package_path(&package_path)?;

        Ok(Self {
            repo_url,
            platform,
            package_path,
            update_server: raw.update_server.unwrap_or(false),
        })
    }
}

/// 包路径会拼接在克隆目录下，只允许普通的相对路径
fn validate_package_path(raw: &str) -> Result<PathBuf, JobError> {
    let path = Path::new(raw);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(JobError::InvalidPackagePath(raw.to_string()));
    }
    Ok(path.to_path_buf())
}
