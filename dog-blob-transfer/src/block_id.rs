use uuid::Uuid;

use crate::{BlockId, BlockListItem, TransferError, TransferResult};

/// Width of the zero-padded position in generated ids
const POSITION_WIDTH: usize = 6;

/// Derives block ids for the chunks of one upload.
///
/// Ids are `base64("{prefix}-{position:06}")`: the random prefix keeps them
/// from colliding with ids staged by anyone else, the position makes a retry
/// of the same chunk reuse its id, and the fixed layout gives every id of the
/// operation the same encoded length.
#[derive(Debug, Clone)]
pub struct BlockIdSequencer {
    prefix: String,
}

impl BlockIdSequencer {
    /// Sequencer with a fresh random prefix
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            prefix: format!("blk{}", &uuid[..16]),
        }
    }

    #[cfg(test)]
    fn with_prefix<S: Into<String>>(prefix: S) -> TransferResult<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.contains('-') {
            return Err(TransferError::validation(format!(
                "Block id prefix {:?} must be non-empty and must not contain '-'",
                prefix
            )));
        }
        Ok(Self { prefix })
    }

    /// Id for the chunk at `position`
    pub fn id_for(&self, position: u32) -> BlockId {
        let raw = format!("{}-{:0width$}", self.prefix, position, width = POSITION_WIDTH);
        BlockId::encode(raw.as_bytes())
    }

    /// Raw id length produced by this sequencer
    pub fn raw_len(&self) -> usize {
        self.prefix.len() + 1 + POSITION_WIDTH
    }

    #[cfg(test)]
    fn owns(&self, id: &BlockId) -> bool {
        let raw = match id.decode().and_then(|raw| String::from_utf8(raw).ok()) {
            Some(raw) => raw,
            None => return false,
        };
        raw.strip_prefix(&format!("{}-", self.prefix))
            .map_or(false, |rest| {
                rest.len() == POSITION_WIDTH && rest.bytes().all(|b| b.is_ascii_digit())
            })
    }

    /// Check that this sequencer can address `count` chunks and that its ids fit
    /// alongside `existing` ids in one committed list.
    pub fn check_compatible(
        &self,
        count: u32,
        existing: &[BlockListItem],
        max_raw_len: usize,
    ) -> TransferResult<()> {
        if u64::from(count) > 10u64.pow(POSITION_WIDTH as u32) {
            return Err(TransferError::validation(format!(
                "{} chunks exceed the {} positions a block id can encode",
                count,
                10u64.pow(POSITION_WIDTH as u32)
            )));
        }
        if self.raw_len() > max_raw_len {
            return Err(TransferError::validation(format!(
                "Generated block ids are {} bytes, limit is {}",
                self.raw_len(),
                max_raw_len
            )));
        }
        let encoded_len = self.id_for(0).len();
        if let Some(other) = existing.iter().find(|item| item.id.len() != encoded_len) {
            return Err(TransferError::validation(format!(
                "Existing block id {} has length {}, generated ids have length {}",
                other.id,
                other.id.len(),
                encoded_len
            )));
        }
        Ok(())
    }
}

impl Default for BlockIdSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a caller-assembled block list before it is sent for commit
pub fn validate_block_list(items: &[BlockListItem], max_raw_len: usize) -> TransferResult<()> {
    let mut expected_len = None;
    for item in items {
        let raw = item.id.decode().ok_or_else(|| {
            let id = item.id.as_str();
            TransferError::validation(format!("Block id {:?} is not valid base64", id))
        })?;
        if raw.is_empty() || raw.len() > max_raw_len {
            return Err(TransferError::validation(format!(
                "Block id {} must decode to 1-{} bytes, got {}",
                item.id,
                max_raw_len,
                raw.len()
            )));
        }
        match expected_len {
            None => expected_len = Some(item.id.len()),
            Some(len) if len != item.id.len() => {
                return Err(TransferError::validation(format!(
                    "Block ids in one list must share a length: {} has length {}, expected {}",
                    item.id,
                    item.id.len(),
                    len
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_stable_and_uniform() {
        let sequencer = BlockIdSequencer::new();
        let ids: Vec<BlockId> = (0..2000).map(|p| sequencer.id_for(p)).collect();

        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|id| id.len() == ids[0].len()));
        assert_eq!(sequencer.id_for(17), ids[17]);
        assert!(sequencer.owns(&ids[42]));
    }

    #[test]
    fn separate_operations_never_collide() {
        let a = BlockIdSequencer::new();
        let b = BlockIdSequencer::new();
        assert_ne!(a.id_for(0), b.id_for(0));
        assert!(!a.owns(&b.id_for(0)));
        assert!(!a.owns(&BlockId::from_index(0)));
    }

    #[test]
    fn rejects_mixed_lengths() {
        let sequencer = BlockIdSequencer::with_prefix("fixed").unwrap();
        let existing = vec![BlockListItem::new(BlockId::from_index(3))];

        assert!(sequencer.check_compatible(10, &[], 64).is_ok());
        assert!(matches!(
            sequencer.check_compatible(10, &existing, 64),
            Err(TransferError::Validation { .. })
        ));

        let mixed = vec![
            BlockListItem::new(BlockId::from_index(0)),
            BlockListItem::new(sequencer.id_for(0)),
        ];
        assert!(validate_block_list(&mixed, 64).is_err());
        assert!(validate_block_list(&mixed[..1], 64).is_ok());
    }

    #[test]
    fn position_capacity_is_bounded_by_id_width() {
        let sequencer = BlockIdSequencer::new();
        assert!(sequencer.check_compatible(1_000_000, &[], 64).is_ok());
        assert!(matches!(
            sequencer.check_compatible(1_000_001, &[], 64),
            Err(TransferError::Validation { .. })
        ));
    }

    #[test]
    fn rejects_bad_prefix_and_bad_ids() {
        assert!(BlockIdSequencer::with_prefix("").is_err());
        assert!(BlockIdSequencer::with_prefix("a-b").is_err());

        let garbage = vec![BlockListItem::new(BlockId::from_string("not base64!".to_string()))];
        assert!(validate_block_list(&garbage, 64).is_err());
    }
}
