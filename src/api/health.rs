/// 存活检查，不需要认证
pub async fn health() -> &'static str {
    "Server is up and running.\n"
}
