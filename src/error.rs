/// Repository-wide structured errors spanning the pipeline, transfer and
/// coordinator subsystems. Every fallible operation surfaces one of these
/// kinds; callers never branch on unrelated error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PilotError {
    /// 缺少凭证或配置无效（API key、base URL、配置文件）
    Config(String),
    /// 输入校验失败（非法文件名、路径穿越、行 schema 错误）
    Validation(String),
    /// 瞬时错误（网络超时、5xx、被限流），可在引擎内部重试
    Transient(String),
    /// 远端资源已存在，交由冲突策略处理
    Conflict(String),
    /// 校验和/长度不匹配、加密填充非法
    Integrity(String),
    /// 磁盘或配额耗尽，对单文件致命
    Exhausted(String),
    /// 用户中断（信号）
    Cancelled,
    /// 程序错误或不变量被破坏
    Fatal(String),
}

impl std::fmt::Display for PilotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use PilotError::*;
        match self {
            Config(s) => write!(f, "配置错误: {}", s),
            Validation(s) => write!(f, "输入校验失败: {}", s),
            Transient(s) => write!(f, "临时错误: {}", s),
            Conflict(s) => write!(f, "资源已存在: {}", s),
            Integrity(s) => write!(f, "完整性校验失败: {}", s),
            Exhausted(s) => write!(f, "空间或配额不足: {}", s),
            Cancelled => write!(f, "操作已被用户取消"),
            Fatal(s) => write!(f, "内部错误: {}", s),
        }
    }
}

impl std::error::Error for PilotError {}

impl PilotError {
    /// Stable machine-readable kind tag used by the JSONL failure ledger
    /// and the `--json` summaries.
    pub fn kind(&self) -> &'static str {
        use PilotError::*;
        match self {
            Config(_) => "config",
            Validation(_) => "validation",
            Transient(_) => "transient",
            Conflict(_) => "conflict",
            Integrity(_) => "integrity",
            Exhausted(_) => "exhausted",
            Cancelled => "cancelled",
            Fatal(_) => "fatal",
        }
    }

    /// Whether the error may resolve itself on a later attempt. Only
    /// `Transient` qualifies; conflicts and integrity failures have their
    /// own dedicated recovery paths and are never blindly retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, PilotError::Transient(_))
    }

    /// Whether a part/range level retry inside an active transfer is
    /// worthwhile. Integrity failures get exactly one in-place retry at the
    /// call site, so they are excluded here; validation/config/conflict
    /// errors never are.
    pub fn is_retriable_during_transfer(&self) -> bool {
        matches!(self, PilotError::Transient(_))
    }

    /// Whether the failure of one row should be allowed to leave the rest
    /// of a pipeline run alive under `continue-on-error`.
    pub fn is_row_scoped(&self) -> bool {
        use PilotError::*;
        match self {
            Transient(_) | Conflict(_) | Integrity(_) | Exhausted(_) => true,
            Config(_) | Validation(_) | Cancelled | Fatal(_) => false,
        }
    }

    /// Map an HTTP status from the remote API / object store onto an error
    /// kind. 429 and 5xx are transient (429 additionally signals the rate
    /// coordinator via the lease release path); 409 is a conflict.
    pub fn from_status(status: u16, context: &str) -> PilotError {
        match status {
            409 => PilotError::Conflict(context.to_string()),
            429 => PilotError::Transient(format!("远端限流(429): {}", context)),
            s if s >= 500 => PilotError::Transient(format!("远端 {}: {}", s, context)),
            401 | 403 => PilotError::Config(format!("认证失败({}): {}", status, context)),
            507 => PilotError::Exhausted(context.to_string()),
            s => PilotError::Fatal(format!("非预期状态码 {}: {}", s, context)),
        }
    }

    /// Classify a std::io error, separating disk exhaustion from the
    /// generally retriable network/IO family.
    pub fn from_io(e: &std::io::Error, context: &str) -> PilotError {
        use std::io::ErrorKind::*;
        match e.kind() {
            StorageFull | QuotaExceeded => {
                PilotError::Exhausted(format!("{} — {}", context, e))
            }
            TimedOut | ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof
            | Interrupted => PilotError::Transient(format!("{} — {}", context, e)),
            _ => PilotError::Fatal(format!("{} — {}", context, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(PilotError::Transient("x".into()).is_transient());
        assert!(!PilotError::Conflict("x".into()).is_transient());
        assert!(!PilotError::Cancelled.is_transient());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(PilotError::from_status(409, "f"), PilotError::Conflict(_)));
        assert!(PilotError::from_status(503, "f").is_transient());
        assert!(PilotError::from_status(429, "f").is_transient());
        assert!(matches!(PilotError::from_status(401, "f"), PilotError::Config(_)));
        assert!(matches!(PilotError::from_status(507, "f"), PilotError::Exhausted(_)));
    }

    #[test]
    fn row_scoped_policy() {
        assert!(PilotError::Exhausted("disk".into()).is_row_scoped());
        assert!(PilotError::Integrity("sum".into()).is_row_scoped());
        assert!(!PilotError::Validation("bad".into()).is_row_scoped());
        assert!(!PilotError::Cancelled.is_row_scoped());
    }

    #[test]
    fn io_classification() {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "t");
        assert!(PilotError::from_io(&e, "read").is_transient());
        let e = std::io::Error::new(std::io::ErrorKind::StorageFull, "full");
        assert!(matches!(PilotError::from_io(&e, "write"), PilotError::Exhausted(_)));
    }
}
