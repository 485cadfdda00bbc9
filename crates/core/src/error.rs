use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid version '{0}': expected <major>.<minor>.<rev>")]
    InvalidVersion(String),

    #[error("Invalid node count {count}: at least {min} nodes are required")]
    InvalidNodeCount { count: u32, min: u32 },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
