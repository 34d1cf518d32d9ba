use domain::{DomainError, RepositoryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("{0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl ApplicationError {
    pub fn not_found(resource_type: &str, resource_id: impl ToString) -> Self {
        ApplicationError::Domain(DomainError::not_found(resource_type, resource_id))
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            // 存储层拒绝的操作按领域错误对外暴露
            RepositoryError::Rejected(err) => ApplicationError::Domain(err),
            other => ApplicationError::Repository(other),
        }
    }
}
