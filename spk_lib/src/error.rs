use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("error reading or writing container data: {0}")]
    Binrw(#[from] binrw::Error),

    #[error("error reading data: {0}")]
    Io(#[from] std::io::Error),
}
