use super::StageError;
use crate::config::split_command;
use crate::process::{self, CommandSpec, RunContext};
use std::path::Path;

/// 在包目录下执行依赖安装（默认 `npm install`），继承服务进程的环境变量
pub async fn install_dependencies(
    install: &str,
    package_dir: &Path,
    ctx: &RunContext,
) -> Result<(), StageError> {
    if !package_dir.is_dir() {
        return Err(StageError::PackageMissing(package_dir.to_path_buf()));
    }
    let (program, args) = split_command(install).ok_or(StageError::ToolNotConfigured("install"))?;

    let spec = CommandSpec::new(program).args(args).current_dir(package_dir);
    process::run(&spec, ctx).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::stages::testing::fake_tool;
    use crate::process::tests::ctx;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_inside_package_dir() {
        let tools = tempfile::tempdir().unwrap();
        let pkg = tempfile::tempdir().unwrap();
        let npm = fake_tool(tools.path(), "npm", "touch node_modules.marker\necho \"$@\" > install.args");

        install_dependencies(&format!("{npm} install"), pkg.path(), &ctx(Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(pkg.path().join("node_modules.marker").exists());
        assert_eq!(
            std::fs::read_to_string(pkg.path().join("install.args")).unwrap().trim(),
            "install"
        );
    }

    #[tokio::test]
    async fn inherits_service_environment() {
        let tools = tempfile::tempdir().unwrap();
        let pkg = tempfile::tempdir().unwrap();
        // PATH 一定存在于服务进程环境中
        let npm = fake_tool(tools.path(), "npm", "test -n \"$PATH\"");

        install_dependencies(&npm, pkg.path(), &ctx(Duration::from_secs(10)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_package_dir_spawns_nothing() {
        let pkg = tempfile::tempdir().unwrap();
        let err = install_dependencies(
            "definitely-not-a-real-tool-4711",
            &pkg.path().join("apps/missing"),
            &ctx(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::PackageMissing(_)));
    }

    #[tokio::test]
    async fn install_that_never_returns_hits_deadline() {
        let tools = tempfile::tempdir().unwrap();
        let pkg = tempfile::tempdir().unwrap();
        let npm = fake_tool(tools.path(), "npm", "sleep 30");

        let err = install_dependencies(&npm, pkg.path(), &ctx(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
