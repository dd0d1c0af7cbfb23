use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::error::{FetchError, MalformedRecord, StoreError};

pub type RecordId = [u8; 32];
pub type AuthorId = [u8; 32];

/// The "no predecessor" address. The oldest record points here, and an empty
/// list has it as its head.
pub const ORIGIN: RecordId = [0u8; 32];

pub const MAX_TITLE_LEN: usize = 50;
pub const MAX_BODY_LEN: usize = 500;

/// A record as the local view holds it. Content is immutable once fetched;
/// only the reconciler rewrites `previous_id` when a delete splices the
/// chain.
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct Record {
    pub id: RecordId,
    #[builder(default, setter(into))]
    pub title: String,
    #[builder(default, setter(into))]
    pub body: String,
    #[builder(default = [1u8; 32])]
    pub author_id: AuthorId,
    #[builder(default = ORIGIN)]
    pub previous_id: RecordId,
}

impl Record {
    /// Decodes and validates account bytes fetched for `id`.
    pub fn decode(id: RecordId, bytes: &[u8]) -> Result<Self, FetchError> {
        let account = RecordAccount::decode(bytes)
            .map_err(|e| FetchError::Malformed(id, e))?;
        Self::from_account(id, account)
    }

    pub fn from_account(
        id: RecordId,
        account: RecordAccount,
    ) -> Result<Self, FetchError> {
        // the genesis account is owned by nobody and is not a live record
        if account.author == ORIGIN {
            return Err(FetchError::Genesis(id));
        }
        if account.title.len() > MAX_TITLE_LEN {
            Err(FetchError::Malformed(
                id,
                MalformedRecord::TitleTooLong {
                    len: account.title.len(),
                    limit: MAX_TITLE_LEN,
                },
            ))?
        }
        if account.body.len() > MAX_BODY_LEN {
            Err(FetchError::Malformed(
                id,
                MalformedRecord::BodyTooLong {
                    len: account.body.len(),
                    limit: MAX_BODY_LEN,
                },
            ))?
        }
        if account.previous == id {
            Err(FetchError::Malformed(id, MalformedRecord::SelfReference))?
        }
        Ok(Self {
            id,
            title: account.title,
            body: account.body,
            author_id: account.author,
            previous_id: account.previous,
        })
    }

    pub fn is_oldest(&self) -> bool {
        self.previous_id == ORIGIN
    }

    /// True when title, body and author all match.
    pub fn same_content(&self, other: &Record) -> bool {
        self.title == other.title
            && self.body == other.body
            && self.author_id == other.author_id
    }

    /// Copies content fields from `other`, leaving id and link untouched.
    /// Returns true if anything changed.
    pub(crate) fn take_content(&mut self, other: Record) -> bool {
        if self.same_content(&other) {
            return false;
        }
        self.title = other.title;
        self.body = other.body;
        self.author_id = other.author_id;
        true
    }
}

/// The remote layout of a record account.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RecordAccount {
    pub title: String,
    pub body: String,
    /// Contributing party. All zero on the genesis account.
    pub author: AuthorId,
    pub previous: RecordId,
    /// Party allowed to mutate the account.
    pub authority: AuthorId,
}

impl RecordAccount {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|bytes| bytes.into_vec())
            .map_err(|e| StoreError::Rpc(format!("encoding account: {e:?}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedRecord> {
        // archives must be read from an aligned buffer
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<RecordAccount>(&aligned)
            .map_err(|_| MalformedRecord::Undecodable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(title: &str, previous: RecordId) -> RecordAccount {
        RecordAccount {
            title: title.into(),
            body: "body".into(),
            author: [7u8; 32],
            previous,
            authority: [7u8; 32],
        }
    }

    #[test]
    fn decodes_encoded_account() {
        let bytes = account("hello", [2u8; 32]).encode().unwrap();
        let record = Record::decode([3u8; 32], &bytes).unwrap();
        assert_eq!(record.id, [3u8; 32]);
        assert_eq!(record.title, "hello");
        assert_eq!(record.previous_id, [2u8; 32]);
        assert_eq!(record.author_id, [7u8; 32]);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Record::decode([3u8; 32], &[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            FetchError::Malformed([3u8; 32], MalformedRecord::Undecodable)
        );
    }

    #[test]
    fn genesis_account_is_not_a_record() {
        let mut genesis = account("", ORIGIN);
        genesis.author = ORIGIN;
        let err = Record::from_account([9u8; 32], genesis).unwrap_err();
        assert_eq!(err, FetchError::Genesis([9u8; 32]));
        assert!(err.is_not_found());
    }

    #[test]
    fn oversized_title_is_rejected() {
        let long = "x".repeat(MAX_TITLE_LEN + 1);
        let err = Record::from_account([3u8; 32], account(&long, ORIGIN))
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Malformed(_, MalformedRecord::TitleTooLong { .. })
        ));
    }

    #[test]
    fn self_reference_is_rejected() {
        let err = Record::from_account([3u8; 32], account("t", [3u8; 32]))
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::Malformed([3u8; 32], MalformedRecord::SelfReference)
        );
    }

    #[test]
    fn take_content_keeps_link() {
        let mut record = Record::builder()
            .id([1u8; 32])
            .title("old")
            .previous_id([2u8; 32])
            .build();
        let fresh = Record::builder()
            .id([1u8; 32])
            .title("new")
            .previous_id([5u8; 32])
            .build();
        assert!(record.take_content(fresh.clone()));
        assert_eq!(record.title, "new");
        assert_eq!(record.previous_id, [2u8; 32]);
        assert!(!record.take_content(fresh));
    }
}
