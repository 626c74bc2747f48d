use std::fmt;

/// 构建任务状态机的各个阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Validating,
    Fetching,
    Installing,
    Building,
    Serving,
    Done,
    Failed,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Validating => "validating",
            JobStage::Fetching => "fetching",
            JobStage::Installing => "installing",
            JobStage::Building => "building",
            JobStage::Serving => "serving",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
