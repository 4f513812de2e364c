//! Common error types

use protocol::BoardError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Board error: {0}")]
    Board(#[from] BoardError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Direction;

    #[test]
    fn test_board_error_conversion() {
        let err: Error = BoardError::Busy(Direction::Out).into();
        assert!(matches!(err, Error::Board(BoardError::Busy(Direction::Out))));
        assert_eq!(err.to_string(), format!("Board error: {}", BoardError::Busy(Direction::Out)));
    }
}
