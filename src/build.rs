pub mod events;
pub mod pipeline;
pub mod platform;
pub mod request;
pub mod stages;
pub mod workspace;

/// 生成构建 ID：分钟级时间戳便于人工辨认，随机后缀保证并发请求互不冲突
pub fn generate_job_id() -> String {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M");
    let ulid = ulid::Ulid::new().to_string().to_lowercase();
    // ULID 末尾字符来自随机部分
    format!("{stamp}-{}", &ulid[ulid.len() - 8..])
}
