use super::CONTAINER_ID_LEN;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid container id `{0}`: expected {len} lowercase hex characters", len = CONTAINER_ID_LEN)]
    InvalidContainerID(String),
}

pub type Result<T> = std::result::Result<T, Error>;
