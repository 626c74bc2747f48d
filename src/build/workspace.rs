use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// 单个构建任务独占的临时目录
///
/// 目录结构：`{root}/repo` 为克隆目标，`{root}/repo/{package_path}` 为构建目录。
/// 子目录只计算路径不预先创建，由需要的步骤按需创建。
/// 正常结束时调用 [`Workspace::release`]；其余任何退出路径（提前返回、panic、
/// 客户端断开导致 future 被丢弃）都由 `TempDir` 的析构兜底删除。
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    root: PathBuf,
    package_path: PathBuf,
}

impl Workspace {
    pub fn acquire(
        temp_root: &Path,
        prefix: &str,
        job_id: &str,
        package_path: &Path,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(temp_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}{job_id}-"))
            .tempdir_in(temp_root)?;
        let root = dir.path().to_path_buf();
        tracing::debug!("已创建工作目录：{}", root.display());

        Ok(Self {
            dir: Some(dir),
            root,
            package_path: package_path.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn clone_dir(&self) -> PathBuf {
        self.root.join("repo")
    }

    pub fn package_dir(&self) -> PathBuf {
        self.clone_dir().join(&self.package_path)
    }

    /// 递归删除整个工作目录
    pub async fn release(mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => tracing::debug!("已清理工作目录：{}", root.display()),
            Ok(Err(e)) => tracing::error!("清理工作目录 {} 失败：{e}", root.display()),
            Err(e) => tracing::error!("清理工作目录 {} 的任务异常：{e}", root.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paths_are_lazy_and_release_removes_tree() {
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(base.path(), "build-", "20260101-0000-abc", Path::new("apps/mobile"))
            .unwrap();

        let root = ws.root().to_path_buf();
        assert!(root.starts_with(base.path()));
        let name = root.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("build-20260101-0000-abc-"));
        assert_eq!(ws.clone_dir(), root.join("repo"));
        assert_eq!(ws.package_dir(), root.join("repo/apps/mobile"));
        assert!(!ws.clone_dir().exists());

        std::fs::create_dir_all(ws.package_dir()).unwrap();
        std::fs::write(ws.package_dir().join("package.json"), "{}").unwrap();

        ws.release().await;
        assert!(!root.exists());
    }

    #[test]
    fn same_job_id_yields_distinct_roots() {
        let base = tempfile::tempdir().unwrap();
        let a = Workspace::acquire(base.path(), "build-", "same", Path::new(".")).unwrap();
        let b = Workspace::acquire(base.path(), "build-", "same", Path::new(".")).unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn drop_removes_tree() {
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::acquire(base.path(), "build-", "dropped", Path::new(".")).unwrap();
        let root = ws.root().to_path_buf();
        std::fs::create_dir_all(ws.clone_dir()).unwrap();
        drop(ws);
        assert!(!root.exists());
    }
}
