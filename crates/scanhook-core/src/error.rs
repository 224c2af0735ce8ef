//! 错误类型（扫描管线全局）
//!
//! 每一类错误都只作用于单个规则、单个钩子或单个对象；
//! 调度器把它们转换为诊断 Finding 并写结构化日志，不会中断整条管线。
use serde::Serialize;
use thiserror::Error;

use crate::object::{FieldSelector, ObjectId};

#[derive(Error, Debug)]
pub enum ScanHookError {
    /// 规则源码无效（只影响该条规则）
    #[error("rule compile failed: rule={rule} {message}")]
    CompileError { rule: String, message: String },

    /// 证据偏移越界，Finding 被丢弃
    #[error(
        "match offset out of bounds: object={object} field={field} offset={offset} len={len} field_len={field_len:?}"
    )]
    InvalidOffset {
        object: ObjectId,
        field: FieldSelector,
        offset: u64,
        len: u64,
        field_len: Option<u64>,
    },

    /// 偏移处重新读取的字节与记录的匹配内容不一致，Finding 被丢弃
    #[error("match bytes differ from field content: object={object} field={field} offset={offset} len={len}")]
    EvidenceMismatch { object: ObjectId, field: FieldSelector, offset: u64, len: u64 },

    #[error("extraction depth limit exceeded: name={name} depth={depth} max={max}")]
    RecursionLimitExceeded { name: String, depth: usize, max: usize },

    #[error("extraction size limit exceeded: name={name} size={size} limit={limit}")]
    SizeLimitExceeded { name: String, size: u64, limit: u64 },

    #[error("cyclic extraction detected: name={name} sha256={sha256}")]
    CyclicExtractionDetected { name: String, sha256: String },

    /// 钩子返回错误或 panic
    #[error("hook fault: tag={tag} {message}")]
    HookFault { tag: String, message: String },

    /// 内容读取失败：仅终止当前对象剩余的钩子
    #[error("content read failed: object={object} {message}")]
    ReaderError { object: ObjectId, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 诊断类别（写入诊断 Finding，便于下游按类别过滤）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    CompileError,
    InvalidOffset,
    RecursionLimitExceeded,
    SizeLimitExceeded,
    CyclicExtractionDetected,
    HookFault,
    ReaderError,
    Internal,
}

impl ScanHookError {
    pub fn diagnostic_kind(&self) -> DiagnosticKind {
        match self {
            Self::CompileError { .. } => DiagnosticKind::CompileError,
            Self::InvalidOffset { .. } | Self::EvidenceMismatch { .. } => DiagnosticKind::InvalidOffset,
            Self::RecursionLimitExceeded { .. } => DiagnosticKind::RecursionLimitExceeded,
            Self::SizeLimitExceeded { .. } => DiagnosticKind::SizeLimitExceeded,
            Self::CyclicExtractionDetected { .. } => DiagnosticKind::CyclicExtractionDetected,
            Self::HookFault { .. } => DiagnosticKind::HookFault,
            Self::ReaderError { .. } | Self::Io(_) => DiagnosticKind::ReaderError,
            Self::Config(_) => DiagnosticKind::Internal,
        }
    }

    /// 递归守卫拒绝的三类错误
    pub fn is_guard_refusal(&self) -> bool {
        matches!(
            self,
            Self::RecursionLimitExceeded { .. }
                | Self::SizeLimitExceeded { .. }
                | Self::CyclicExtractionDetected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanHookError>;
