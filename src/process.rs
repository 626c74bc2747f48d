//! 外部命令执行
//!
//! 每个命令在独立进程组中运行，stdout/stderr 合并采集并逐行写入服务日志。
//! 截止时间或取消信号触发时整个进程组会被终止并回收，不会留下孤儿进程。

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 采集输出的上限，超出后只保留末尾部分
const MAX_CAPTURED_BYTES: usize = 256 * 1024;
/// SIGTERM 之后等待进程自行退出的时间
const KILL_GRACE: Duration = Duration::from_secs(5);
/// 进程退出后等待管道读完的时间（后台子进程可能继续持有管道）
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 一次任务的截止时间与取消信号，向下传递给每个外部命令
#[derive(Debug, Clone)]
pub struct RunContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// 在继承的环境变量基础上追加
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// 成功退出的命令输出（stdout 与 stderr 按到达顺序合并）
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub combined: Vec<u8>,
}

impl ProcessOutput {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.combined)
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("无法启动 {program}：{source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("等待 {program} 退出失败：{source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} 执行失败（{status}）")]
    Failed {
        program: String,
        status: ExitStatus,
        output: String,
    },

    #[error("{program} 超时，已终止")]
    TimedOut { program: String, output: String },

    #[error("{program} 已取消")]
    Cancelled { program: String, output: String },
}

impl ProcessError {
    /// 失败时采集到的输出，仅用于写日志
    pub fn output(&self) -> &str {
        match self {
            Self::Failed { output, .. }
            | Self::TimedOut { output, .. }
            | Self::Cancelled { output, .. } => output,
            Self::Spawn { .. } | Self::Wait { .. } => "",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

enum Exit {
    Completed(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// 执行命令直到退出、超时或取消；非零退出码视为失败
pub async fn run(spec: &CommandSpec, ctx: &RunContext) -> Result<ProcessOutput, ProcessError> {
    let program = spec.program.clone();
    if ctx.cancel.is_cancelled() {
        return Err(ProcessError::Cancelled { program, output: String::new() });
    }
    if ctx.is_expired() {
        return Err(ProcessError::TimedOut { program, output: String::new() });
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    let mut group = GroupGuard::new(child.id());

    tracing::info!(
        program = %spec.program,
        args = ?spec.args,
        dir = ?spec.current_dir,
        pid = ?child.id(),
        "启动外部命令"
    );

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pipe_lines(stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pipe_lines(stderr, tx.clone())));
    }
    drop(tx);
    let collector = tokio::spawn(collect_output(rx, program.clone()));

    let exit = tokio::select! {
        status = child.wait() => Exit::Completed(status),
        _ = tokio::time::sleep_until(ctx.deadline) => Exit::TimedOut,
        _ = ctx.cancel.cancelled() => Exit::Cancelled,
    };

    if matches!(exit, Exit::TimedOut | Exit::Cancelled) {
        terminate_process_group(&mut child, KILL_GRACE).await;
    }
    group.disarm();

    let output = finish_output(readers, collector).await;

    match exit {
        Exit::Completed(Ok(status)) if status.success() => Ok(ProcessOutput { combined: output }),
        Exit::Completed(Ok(status)) => Err(ProcessError::Failed {
            program,
            status,
            output: String::from_utf8_lossy(&output).into_owned(),
        }),
        Exit::Completed(Err(source)) => Err(ProcessError::Wait { program, source }),
        Exit::TimedOut => {
            tracing::warn!(program = %spec.program, "外部命令超过截止时间，进程组已终止");
            Err(ProcessError::TimedOut {
                program,
                output: String::from_utf8_lossy(&output).into_owned(),
            })
        }
        Exit::Cancelled => {
            tracing::warn!(program = %spec.program, "任务已取消，进程组已终止");
            Err(ProcessError::Cancelled {
                program,
                output: String::from_utf8_lossy(&output).into_owned(),
            })
        }
    }
}

async fn pipe_lines<R>(reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if !line.ends_with(b"\n") {
                    line.push(b'\n');
                }
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("读取子进程输出失败：{e}");
                break;
            }
        }
    }
}

async fn collect_output(mut rx: mpsc::Receiver<Vec<u8>>, program: String) -> Vec<u8> {
    let mut buf = Vec::new();
    while let Some(line) = rx.recv().await {
        tracing::info!("[{program}] {}", String::from_utf8_lossy(&line).trim_end());
        buf.extend_from_slice(&line);
        if buf.len() > MAX_CAPTURED_BYTES {
            let excess = buf.len() - MAX_CAPTURED_BYTES;
            buf.drain(..excess);
        }
    }
    buf
}

async fn finish_output(mut readers: Vec<JoinHandle<()>>, collector: JoinHandle<Vec<u8>>) -> Vec<u8> {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!("子进程管道仍被占用，停止读取");
        for reader in &readers {
            reader.abort();
        }
    }
    collector.await.unwrap_or_default()
}

/// 先 SIGTERM 整个进程组，宽限期后 SIGKILL，最后回收子进程
async fn terminate_process_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(-(pid as i32));

    if let Err(e) = signal::kill(pgid, Signal::SIGTERM)
        && e != nix::errno::Errno::ESRCH
    {
        tracing::warn!(pid, error = ?e, "向进程组发送 SIGTERM 失败");
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        // 组长已退出，组内可能仍有忽略 SIGTERM 的后代
        let _ = signal::kill(pgid, Signal::SIGKILL);
        return;
    }

    if let Err(e) = signal::kill(pgid, Signal::SIGKILL)
        && e != nix::errno::Errno::ESRCH
    {
        tracing::warn!(pid, error = ?e, "向进程组发送 SIGKILL 失败");
    }
    let _ = child.wait().await;
}

/// future 在等待期间被丢弃（例如客户端断开）时，强制结束整个进程组
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|p| p as i32),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            let _ = signal::kill(Pid::from_raw(-pgid), Signal::SIGKILL);
        }
    }
}
