use std::fmt;

/// 支持的目标平台
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Android, Platform::Ios];

    /// 仅当平台既是已知平台又在配置的允许列表中时返回
    pub fn parse(raw: &str, allowed: &[String]) -> Option<Self> {
        let platform = Self::ALL.into_iter().find(|p| p.as_str() == raw)?;
        allowed
            .iter()
            .any(|a| a.trim() == raw)
            .then_some(platform)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Platform::Android => "apk",
            Platform::Ios => "ipa",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Platform::Android => "application/vnd.android.package-archive",
            Platform::Ios => "application/octet-stream",
        }
    }

    /// 产物文件名，同时作为 `--output` 参数和下载文件名
    pub fn artifact_name(self, job_id: &str) -> String {
        format!("app-{job_id}.{}", self.extension())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_respects_known_set_and_allow_list() {
        let both = allowed(&["android", "ios"]);
        assert_eq!(Platform::parse("android", &both), Some(Platform::Android));
        assert_eq!(Platform::parse("ios", &both), Some(Platform::Ios));
        assert_eq!(Platform::parse("web", &both), None);
        assert_eq!(Platform::parse("Android", &both), None);

        let android_only = allowed(&["android"]);
        assert_eq!(Platform::parse("ios", &android_only), None);

        // 允许列表里的未知平台不会因此变得可用
        assert_eq!(Platform::parse("windows", &allowed(&["windows"])), None);
    }

    #[test]
    fn artifact_naming() {
        assert_eq!(Platform::Android.artifact_name("20260101-1200-x1"), "app-20260101-1200-x1.apk");
        assert_eq!(Platform::Ios.artifact_name("id"), "app-id.ipa");
        assert_eq!(Platform::Ios.content_type(), "application/octet-stream");
    }
}
