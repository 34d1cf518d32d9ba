//! 领域模型错误定义
//!
//! 领域错误直接对应对外的错误分类：校验失败、权限不足、状态冲突、资源不存在。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 输入不合法（空消息、参与者不足、回复目标无效等）
    #[error("{message}")]
    Validation { field: String, message: String },

    /// 调用方无权执行该操作
    #[error("{action}")]
    PermissionDenied { action: String },

    /// 实体当前状态不允许该操作（例如编辑已删除消息）
    #[error("{message}")]
    InvalidState { message: String },

    /// 资源不存在
    #[error("{resource_type} {resource_id} not found")]
    NotFound {
        resource_type: String,
        resource_id: String,
    },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建权限错误
    pub fn permission_denied(action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            action: action.into(),
        }
    }

    /// 创建状态错误
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// 创建资源不存在错误
    pub fn not_found(resource_type: impl Into<String>, resource_id: impl ToString) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.to_string(),
        }
    }
}

/// 存储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("record conflict")]
    Conflict,
    /// 存储层拒绝了操作，携带领域错误
    #[error(transparent)]
    Rejected(#[from] DomainError),
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
