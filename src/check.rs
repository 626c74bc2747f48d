use crate::build::platform::Platform;
use crate::config::{ServiceConfig, split_command};

pub struct CheckResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// 启动前的环境检查：日志目录、外部工具、更新脚本与认证配置
pub fn run(config: &ServiceConfig) -> CheckResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    check_log_dir(config, &mut errors);
    check_tools(config, &mut errors);
    check_update_script(config, &mut warnings);
    check_auth(config, &mut warnings);
    check_build(config, &mut errors, &mut warnings);

    CheckResult { errors, warnings }
}

fn check_log_dir(config: &ServiceConfig, errors: &mut Vec<String>) {
    let dir = &config.log.directory;
    if let Err(e) = std::fs::create_dir_all(dir) {
        errors.push(format!("无法创建日志目录 {}：{e}", dir.display()));
        return;
    }
    let path = config.log_path();
    if let Err(e) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        errors.push(format!("日志文件 {} 不可写：{e}", path.display()));
    }
}

fn check_tools(config: &ServiceConfig, errors: &mut Vec<String>) {
    let tools = [
        ("tools.git", &config.tools.git),
        ("tools.install", &config.tools.install),
        ("tools.eas", &config.tools.eas),
    ];
    for (key, command) in tools {
        let Some((program, _)) = split_command(command) else {
            errors.push(format!("{key} 未配置"));
            continue;
        };
        if which::which(&program).is_err() {
            errors.push(format!("{key}：找不到可执行文件 {program}"));
        }
    }
}

fn check_update_script(config: &ServiceConfig, warnings: &mut Vec<String>) {
    let script = &config.update.script_path;
    if !script.is_file() {
        warnings.push(format!("更新脚本 {} 不存在，/update 将会失败", script.display()));
    }
    if let Some(interpreter) = &config.update.interpreter
        && !interpreter.trim().is_empty()
        && which::which(interpreter.trim()).is_err()
    {
        warnings.push(format!("找不到更新脚本解释器 {interpreter}"));
    }
}

fn check_auth(config: &ServiceConfig, warnings: &mut Vec<String>) {
    if config.auth.build_token.is_empty() {
        warnings.push("AUTH_TOKEN 未设置，所有 /build 请求都会被拒绝".to_string());
    }
    if config.auth.update_token.is_empty() {
        warnings.push("UPDATE_AUTH_TOKEN 未设置，所有 /update 请求都会被拒绝".to_string());
    }
}

fn check_build(config: &ServiceConfig, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let allowed = &config.build.allowed_platforms;
    if allowed.is_empty() {
        errors.push("build.allowed_platforms 为空，无法接受任何构建".to_string());
    }
    for name in allowed {
        if !Platform::ALL.iter().any(|p| p.as_str() == name.trim()) {
            warnings.push(format!("未知平台 {name} 将被忽略"));
        }
    }
    let temp_root = config.build.temp_root();
    if let Err(e) = std::fs::create_dir_all(&temp_root) {
        errors.push(format!("无法创建临时目录根 {}：{e}", temp_root.display()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn base(dir: &Path) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.log.directory = dir.join("logs");
        config.build.temp_root = Some(dir.join("tmp"));
        config.tools.git = "sh".into();
        config.tools.install = "sh -c true".into();
        config.tools.eas = "sh".into();
        config.update.script_path = dir.join("update_server.sh");
        config.auth.build_token = "a".into();
        config.auth.update_token = "b".into();
        config
    }

    #[test]
    fn healthy_environment_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = base(dir.path());
        std::fs::write(&config.update.script_path, "#!/bin/sh\n").unwrap();

        let result = run(&config);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
        assert!(config.log_path().exists());
    }

    #[test]
    fn missing_tool_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base(dir.path());
        config.tools.eas = "definitely-not-a-real-tool-4711".into();

        let result = run(&config);
        assert!(result.errors.iter().any(|e| e.contains("tools.eas")));
    }

    #[test]
    fn tool_given_as_path_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base(dir.path());
        config.tools.git = "/bin/sh".into();
        config.tools.eas = dir.path().join("eas").display().to_string();

        let result = run(&config);
        assert!(!result.errors.iter().any(|e| e.contains("tools.git")));
        assert!(result.errors.iter().any(|e| e.contains("tools.eas")));
    }

    #[test]
    fn empty_secrets_and_unknown_platforms_warn() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base(dir.path());
        config.auth.build_token.clear();
        config.build.allowed_platforms.push("web".into());

        let result = run(&config);
        assert!(result.warnings.iter().any(|w| w.contains("AUTH_TOKEN")));
        assert!(result.warnings.iter().any(|w| w.contains("web")));
        assert!(result.warnings.iter().any(|w| w.contains("update_server.sh")));
    }
}
