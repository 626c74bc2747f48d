//! 服务日志实时跟踪（tail -f），把新追加的行逐行推送到 HTTP 响应体

use axum::body::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 没有新数据时的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 流式响应体的写入端；每次发送一个块，hyper 会立即把它刷给客户端
pub type ResponseSink = mpsc::Sender<Result<Bytes, std::io::Error>>;

/// 一个响应写入端 + 一个后台跟踪任务 + 一个停止信号
///
/// 会话存活期间只有跟踪任务写 sink；调用方必须等 [`LogStreamSession::stop`]
/// 返回后才能再写同一个 sink。
pub struct LogStreamSession {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LogStreamSession {
    pub fn start(log_path: PathBuf, sink: ResponseSink) -> Self {
        Self::start_until(log_path, sink, CancellationToken::new())
    }

    /// 由外部信号决定何时结束，例如后台更新任务完成时
    pub fn start_until(log_path: PathBuf, sink: ResponseSink, stop: CancellationToken) -> Self {
        Self::spawn(log_path, sink, stop, None)
    }

    /// 从调用方事先记录的偏移开始推送，覆盖从记录偏移到任务启动之间写入的行
    pub fn start_from(log_path: PathBuf, sink: ResponseSink, stop: CancellationToken, offset: u64) -> Self {
        Self::spawn(log_path, sink, stop, Some(offset))
    }

    fn spawn(log_path: PathBuf, sink: ResponseSink, stop: CancellationToken, offset: Option<u64>) -> Self {
        let handle = tokio::spawn(tail(log_path, sink, stop.clone(), offset));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// 当前日志长度，文件不存在时为 0
    pub async fn current_offset(log_path: &Path) -> u64 {
        tokio::fs::metadata(log_path).await.map(|m| m.len()).unwrap_or(0)
    }

    /// 发出停止信号并等待跟踪任务退出
    pub async fn stop(mut self) {
        self.stop.cancel();
        self.join().await;
    }

    /// 等待跟踪任务自行结束（停止信号由别处触发或 sink 已关闭）
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::warn!("日志跟踪任务异常退出：{e}");
        }
    }
}

impl Drop for LogStreamSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn tail(path: PathBuf, sink: ResponseSink, stop: CancellationToken, offset: Option<u64>) {
    let Some((mut reader, mut pos)) = open_at(&path, &stop, offset).await else {
        return;
    };
    let mut pending: Vec<u8> = Vec::new();

    while !stop.is_cancelled() {
        match reader.read_until(b'\n', &mut pending).await {
            Ok(0) => {
                // 文件被截断或轮转后从头读
                if let Ok(meta) = tokio::fs::metadata(&path).await
                    && meta.len() < pos
                {
                    tracing::debug!("日志文件被截断，重新从头读取");
                    match File::open(&path).await {
                        Ok(file) => {
                            reader = BufReader::new(file);
                            pos = 0;
                            pending.clear();
                            continue;
                        }
                        Err(e) => tracing::warn!("重新打开日志文件失败：{e}"),
                    }
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
            Ok(n) => {
                pos += n as u64;
                // 行尚未写完整时继续累积
                if !pending.ends_with(b"\n") {
                    continue;
                }
                let line = Bytes::from(std::mem::take(&mut pending));
                let sent = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    sent = sink.send(Ok(line)) => sent,
                };
                if sent.is_err() {
                    tracing::debug!("客户端已断开，停止推送日志");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("读取日志文件失败：{e}");
                break;
            }
        }
    }
}

/// 打开日志文件并定位到指定偏移（默认末尾）；文件暂不存在时持续重试直到停止
async fn open_at(path: &Path, stop: &CancellationToken, offset: Option<u64>) -> Option<(BufReader<File>, u64)> {
    let target = offset.map_or(SeekFrom::End(0), SeekFrom::Start);
    loop {
        match File::open(path).await {
            Ok(mut file) => match file.seek(target).await {
                Ok(pos) => return Some((BufReader::new(file), pos)),
                Err(e) => {
                    tracing::warn!("定位日志文件末尾失败：{e}");
                    return None;
                }
            },
            Err(e) => tracing::debug!("日志文件 {} 暂不可读：{e}", path.display()),
        }
        tokio::select! {
            _ = stop.cancelled() => return None,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).create(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    async fn next_chunk(rx: &mut mpsc::Receiver<Result<Bytes, std::io::Error>>) -> Option<String> {
        let chunk = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.ok()??;
        Some(String::from_utf8(chunk.unwrap().to_vec()).unwrap())
    }

    #[tokio::test]
    async fn forwards_only_new_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        append(&log, "old line from a previous job\n");

        let (tx, mut rx) = mpsc::channel(16);
        let session = LogStreamSession::start(log.clone(), tx);
        // 等跟踪任务定位到文件末尾
        tokio::time::sleep(Duration::from_millis(200)).await;

        append(&log, "cloning repository\n");
        append(&log, "installing ");
        assert_eq!(next_chunk(&mut rx).await.as_deref(), Some("cloning repository\n"));

        append(&log, "dependencies\n");
        assert_eq!(next_chunk(&mut rx).await.as_deref(), Some("installing dependencies\n"));

        session.stop().await;
        append(&log, "after stop\n");
        // 会话结束后 sink 的发送端已全部释放
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_sink_ends_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        append(&log, "");

        let (tx, rx) = mpsc::channel(1);
        let mut session = LogStreamSession::start(log.clone(), tx);
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(rx);
        append(&log, "nobody is listening\n");

        tokio::time::timeout(Duration::from_secs(3), session.join())
            .await
            .expect("streamer should exit once the client is gone");
    }

    #[tokio::test]
    async fn external_signal_stops_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        append(&log, "");

        let (tx, mut rx) = mpsc::channel(16);
        let done = CancellationToken::new();
        let mut session = LogStreamSession::start_until(log.clone(), tx, done.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        append(&log, "update: pulling\n");
        assert_eq!(next_chunk(&mut rx).await.as_deref(), Some("update: pulling\n"));

        done.cancel();
        tokio::time::timeout(Duration::from_secs(3), session.join()).await.unwrap();
    }

    #[tokio::test]
    async fn recorded_offset_catches_lines_written_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        append(&log, "before the request\n");

        let offset = LogStreamSession::current_offset(&log).await;
        append(&log, "update: fetching origin\n");

        let (tx, mut rx) = mpsc::channel(16);
        let session = LogStreamSession::start_from(log.clone(), tx, CancellationToken::new(), offset);
        assert_eq!(next_chunk(&mut rx).await.as_deref(), Some("update: fetching origin\n"));
        session.stop().await;
    }

    #[tokio::test]
    async fn offset_of_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(LogStreamSession::current_offset(&dir.path().join("none.log")).await, 0);
    }

    #[tokio::test]
    async fn truncated_file_is_reread_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        append(&log, "a fairly long line that will be rotated away\n");

        let (tx, mut rx) = mpsc::channel(16);
        let session = LogStreamSession::start(log.clone(), tx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&log, "").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        append(&log, "fresh\n");
        assert_eq!(next_chunk(&mut rx).await.as_deref(), Some("fresh\n"));
        session.stop().await;
    }
}
