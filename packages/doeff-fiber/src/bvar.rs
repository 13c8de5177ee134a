//! Capture capsules: single-producer, single-consumer cells holding a
//! suspended stack chain.

use crate::error::RuntimeError;
use crate::ids::BlockId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BvarStatus {
    Empty,
    Full,
    Taken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BvarState {
    Empty,
    Full(BlockId),
    Taken,
}

/// A capsule wrapping the head segment of a captured chain.
///
/// `Full -> Taken` happens exactly once. Use is single-domain and sequential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bvar {
    state: BvarState,
}

impl Bvar {
    pub fn full(head: BlockId) -> Self {
        Bvar {
            state: BvarState::Full(head),
        }
    }

    pub fn empty() -> Self {
        Bvar {
            state: BvarState::Empty,
        }
    }

    pub fn status(&self) -> BvarStatus {
        match self.state {
            BvarState::Empty => BvarStatus::Empty,
            BvarState::Full(_) => BvarStatus::Full,
            BvarState::Taken => BvarStatus::Taken,
        }
    }

    /// Head segment without consuming.
    pub fn peek(&self) -> Option<BlockId> {
        match self.state {
            BvarState::Full(head) => Some(head),
            _ => None,
        }
    }

    pub fn put(&mut self, head: BlockId) -> Result<(), RuntimeError> {
        match self.state {
            BvarState::Empty => {
                self.state = BvarState::Full(head);
                Ok(())
            }
            BvarState::Full(_) => Err(RuntimeError::invalid_argument("continuation already full")),
            BvarState::Taken => Err(RuntimeError::invalid_argument("continuation already taken")),
        }
    }

    pub fn take(&mut self) -> Result<BlockId, RuntimeError> {
        match self.state {
            BvarState::Full(head) => {
                self.state = BvarState::Taken;
                Ok(head)
            }
            BvarState::Empty => Err(RuntimeError::invalid_argument("continuation is empty")),
            BvarState::Taken => Err(RuntimeError::invalid_argument("continuation already taken")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_is_exactly_once() {
        let head = BlockId::from_index(5);
        let mut bvar = Bvar::full(head);
        assert_eq!(bvar.status(), BvarStatus::Full);
        assert_eq!(bvar.peek(), Some(head));

        assert_eq!(bvar.take(), Ok(head));
        assert_eq!(bvar.status(), BvarStatus::Taken);
        assert!(bvar.peek().is_none());

        let err = bvar.take().unwrap_err();
        assert_eq!(
            err,
            RuntimeError::invalid_argument("continuation already taken")
        );
    }

    #[test]
    fn test_take_empty_fails() {
        let mut bvar = Bvar::empty();
        assert!(matches!(bvar.take(), Err(RuntimeError::InvalidArgument(_))));
        assert_eq!(bvar.status(), BvarStatus::Empty);
    }

    #[test]
    fn test_put_fills_empty_only() {
        let mut bvar = Bvar::empty();
        bvar.put(BlockId::from_index(1)).unwrap();
        assert_eq!(bvar.status(), BvarStatus::Full);
        assert!(bvar.put(BlockId::from_index(2)).is_err());

        bvar.take().unwrap();
        assert!(bvar.put(BlockId::from_index(3)).is_err());
    }
}
